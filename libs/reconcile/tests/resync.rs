//! Resync orchestrator behavior against an in-memory configurator.
//!
//! Covers:
//! - Idempotent back-to-back passes
//! - Convergence with obsolete, reserved and physical live objects
//! - Continue-on-error across steps
//! - Restart correlation through a persisted snapshot

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dpsync_reconcile::{
    Applied, Configurator, Handle, KeyedConfigurator, KeyedResync, MemorySnapshotStore,
    ModifyError, NameToIndex, Named, ReconcileError, Resync, Snapshot, SnapshotEntry,
    SnapshotStore,
};
use parking_lot::Mutex;
use rstest::rstest;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Kind {
    Loopback,
    Physical,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Obj {
    name: String,
    kind: Kind,
    mtu: u32,
}

impl Named for Obj {
    fn name(&self) -> &str {
        &self.name
    }
}

fn virt(name: &str) -> Obj {
    Obj {
        name: name.to_string(),
        kind: Kind::Virtual,
        mtu: 1500,
    }
}

#[derive(Debug, Clone)]
struct LiveObj {
    internal_name: String,
    kind: Kind,
    mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Create(String),
    Modify(String, Handle),
    Delete(Handle),
}

struct FakeConfigurator {
    registry: NameToIndex<Obj>,
    live: Mutex<BTreeMap<Handle, LiveObj>>,
    next_handle: AtomicU32,
    calls: Mutex<Vec<Call>>,
    fail_dump: AtomicBool,
    fail_delete: Mutex<HashSet<Handle>>,
    fail_create: Mutex<HashSet<String>>,
    fail_modify: Mutex<HashSet<String>>,
    /// Modify removes the object, then fails to bring it back.
    fail_recreate: Mutex<HashSet<String>>,
    pending: Mutex<HashSet<String>>,
}

impl FakeConfigurator {
    fn new() -> Self {
        let mut live = BTreeMap::new();
        live.insert(
            Handle(0),
            LiveObj {
                internal_name: "local0".to_string(),
                kind: Kind::Loopback,
                mtu: 0,
            },
        );
        Self {
            registry: NameToIndex::new("iface"),
            live: Mutex::new(live),
            next_handle: AtomicU32::new(100),
            calls: Mutex::new(Vec::new()),
            fail_dump: AtomicBool::new(false),
            fail_delete: Mutex::new(HashSet::new()),
            fail_create: Mutex::new(HashSet::new()),
            fail_modify: Mutex::new(HashSet::new()),
            fail_recreate: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    fn with_live(self, handle: u32, internal_name: &str, kind: Kind) -> Self {
        self.live.lock().insert(
            Handle(handle),
            LiveObj {
                internal_name: internal_name.to_string(),
                kind,
                mtu: 1500,
            },
        );
        self
    }

    /// Same forwarder state, fresh process-local state.
    fn restarted(&self) -> Self {
        let fresh = Self::new();
        *fresh.live.lock() = self.live.lock().clone();
        fresh
            .next_handle
            .store(self.next_handle.load(Ordering::SeqCst), Ordering::SeqCst);
        fresh
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl Configurator for FakeConfigurator {
    type Desired = Obj;
    type Live = LiveObj;
    type Kind = Kind;

    fn registry(&self) -> &NameToIndex<Obj> {
        &self.registry
    }

    async fn lookup_live_state(&self) -> Result<BTreeMap<Handle, LiveObj>, ReconcileError> {
        if self.fail_dump.load(Ordering::SeqCst) {
            return Err(ReconcileError::Transport("forwarder unreachable".into()));
        }
        Ok(self.live.lock().clone())
    }

    async fn create(&self, desired: &Obj) -> Result<(), ReconcileError> {
        self.calls.lock().push(Call::Create(desired.name.clone()));
        if self.fail_create.lock().contains(&desired.name) {
            return Err(ReconcileError::rejected(&desired.name, "no memory"));
        }
        if self.pending.lock().contains(&desired.name) {
            return Ok(());
        }
        if desired.kind == Kind::Physical {
            // Physical objects exist already, under their internal name.
            let Some((handle, _)) = self.registry.lookup_by_name(&desired.name) else {
                return Err(ReconcileError::validation(&desired.name, "no such device"));
            };
            self.registry.register_name(&desired.name, handle, desired.clone());
            return Ok(());
        }
        let handle = Handle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.live.lock().insert(
            handle,
            LiveObj {
                internal_name: format!("if{}", handle.0),
                kind: desired.kind,
                mtu: desired.mtu,
            },
        );
        self.registry
            .register_name(&desired.name, handle, desired.clone());
        Ok(())
    }

    async fn modify(
        &self,
        desired: &Obj,
        handle: Handle,
        _live_kind: Kind,
        _live: &LiveObj,
    ) -> Result<Handle, ModifyError> {
        self.calls
            .lock()
            .push(Call::Modify(desired.name.clone(), handle));
        if self.fail_modify.lock().contains(&desired.name) {
            return Err(ModifyError::at(
                handle,
                ReconcileError::rejected(&desired.name, "mtu out of range"),
            ));
        }
        if self.fail_recreate.lock().contains(&desired.name) {
            self.live.lock().remove(&handle);
            self.registry.unregister_handle(handle);
            return Err(ModifyError::gone(ReconcileError::rejected(
                &desired.name,
                "no memory",
            )));
        }
        if let Some(obj) = self.live.lock().get_mut(&handle) {
            obj.mtu = desired.mtu;
        }
        self.registry.register_name(&desired.name, handle, desired.clone());
        Ok(handle)
    }

    async fn delete(&self, _live: &LiveObj, handle: Handle) -> Result<(), ReconcileError> {
        self.calls.lock().push(Call::Delete(handle));
        if self.fail_delete.lock().contains(&handle) {
            return Err(ReconcileError::rejected(handle.to_string(), "in use"));
        }
        self.live.lock().remove(&handle);
        self.registry.unregister_handle(handle);
        Ok(())
    }

    fn live_kind(&self, live: &LiveObj) -> Kind {
        live.kind
    }

    fn retained(&self, handle: Handle, live: &LiveObj) -> Option<(String, Obj)> {
        if handle.is_reserved() || live.kind == Kind::Physical {
            Some((
                live.internal_name.clone(),
                Obj {
                    name: live.internal_name.clone(),
                    kind: live.kind,
                    mtu: live.mtu,
                },
            ))
        } else {
            None
        }
    }

    fn is_pending(&self, desired: &Obj) -> bool {
        self.pending.lock().contains(&desired.name)
    }

    fn retain_pending(&self, desired: &[Obj]) {
        self.pending
            .lock()
            .retain(|name| desired.iter().any(|d| &d.name == name));
    }
}

fn resync(
    configurator: &Arc<FakeConfigurator>,
    store: &Arc<MemorySnapshotStore>,
) -> Resync<FakeConfigurator> {
    Resync::new(
        Arc::clone(configurator),
        Arc::clone(store) as Arc<dyn SnapshotStore>,
        "agent-test",
    )
}

fn persisted(store: &MemorySnapshotStore, bindings: &[(&str, u32)]) {
    let entries = bindings
        .iter()
        .map(|(name, handle)| SnapshotEntry {
            name: name.to_string(),
            handle: Handle(*handle),
            metadata: serde_json::to_value(virt(name)).unwrap(),
        })
        .collect();
    store
        .save("agent-test/iface", &Snapshot::new("agent-test/iface", entries))
        .unwrap();
}

#[tokio::test]
async fn test_fresh_boot_example_scenario() {
    let cfg = Arc::new(FakeConfigurator::new().with_live(7, "host-eth1", Kind::Virtual));
    let store = Arc::new(MemorySnapshotStore::new());
    let resync = resync(&cfg, &store);

    let summary = resync.run(&[virt("eth1")]).await.unwrap();

    assert_eq!(
        cfg.calls(),
        vec![Call::Delete(Handle(7)), Call::Create("eth1".to_string())]
    );
    assert_eq!(summary.retained, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.created, 1);
    assert_eq!(cfg.registry.names(), vec!["eth1", "local0"]);
    assert_eq!(
        cfg.registry.lookup_by_name("local0").map(|(h, _)| h),
        Some(Handle(0))
    );
    assert_eq!(
        cfg.registry.lookup_by_name("eth1").map(|(h, _)| h),
        Some(Handle(100))
    );
    assert!(resync.first_pass_done().await);
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let cfg = Arc::new(FakeConfigurator::new());
    let store = Arc::new(MemorySnapshotStore::new());
    let resync = resync(&cfg, &store);
    let desired = vec![virt("eth1"), virt("eth2")];

    resync.run(&desired).await.unwrap();
    cfg.take_calls();

    let summary = resync.run(&desired).await.unwrap();

    assert_eq!(summary.created, 0);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.modified, 2);
    assert_eq!(cfg.count(|c| matches!(c, Call::Create(_) | Call::Delete(_))), 0);
    assert_eq!(resync.passes().await, 2);
}

#[tokio::test]
async fn test_restart_correlation_keeps_identity() {
    let cfg = Arc::new(FakeConfigurator::new().with_live(5, "tap0", Kind::Virtual));
    let store = Arc::new(MemorySnapshotStore::new());
    persisted(&store, &[("eth0", 5)]);
    let resync = resync(&cfg, &store);

    resync.run(&[virt("eth0")]).await.unwrap();

    assert_eq!(cfg.calls(), vec![Call::Modify("eth0".to_string(), Handle(5))]);
    assert_eq!(
        cfg.registry.lookup_by_name("eth0").map(|(h, _)| h),
        Some(Handle(5))
    );
}

#[tokio::test]
async fn test_snapshot_read_before_overwrite() {
    let cfg = Arc::new(FakeConfigurator::new().with_live(5, "tap0", Kind::Virtual));
    let store = Arc::new(MemorySnapshotStore::new());
    persisted(&store, &[("eth0", 5)]);
    let resync = resync(&cfg, &store);

    resync.run(&[virt("eth0")]).await.unwrap();

    // The in-memory registry was empty when the first pass saved it.
    let saved = store.load("agent-test/iface").unwrap().unwrap();
    assert!(saved.entries.is_empty());
}

#[tokio::test]
async fn test_restart_across_processes() {
    let store = Arc::new(MemorySnapshotStore::new());
    let first = Arc::new(FakeConfigurator::new());
    let desired = vec![virt("eth0"), virt("eth1")];

    resync(&first, &store).run(&desired).await.unwrap();
    // What a persister would write after the pass.
    let snapshot = first.registry.to_snapshot("agent-test/iface").unwrap();
    store.save("agent-test/iface", &snapshot).unwrap();

    let second = Arc::new(first.restarted());
    let summary = resync(&second, &store).run(&desired).await.unwrap();

    assert_eq!(summary.created, 0);
    assert_eq!(summary.deleted, 0);
    assert_eq!(
        second.registry.lookup_by_name("eth0"),
        first.registry.lookup_by_name("eth0")
    );
}

#[tokio::test]
async fn test_stale_snapshot_handle_is_recreated() {
    let cfg = Arc::new(FakeConfigurator::new());
    let store = Arc::new(MemorySnapshotStore::new());
    persisted(&store, &[("eth0", 9)]);
    let resync = resync(&cfg, &store);

    resync.run(&[virt("eth0")]).await.unwrap();

    assert_eq!(cfg.calls(), vec![Call::Create("eth0".to_string())]);
}

#[rstest]
#[case::physical(Kind::Physical)]
#[case::reserved(Kind::Loopback)]
#[tokio::test]
async fn test_reserved_and_physical_never_deleted(#[case] kind: Kind) {
    let handle = if kind == Kind::Physical { 1 } else { 0 };
    let cfg = Arc::new(FakeConfigurator::new().with_live(handle, "GigabitEthernet0/8/0", kind));
    let store = Arc::new(MemorySnapshotStore::new());

    resync(&cfg, &store).run(&[]).await.unwrap();

    assert_eq!(cfg.count(|c| matches!(c, Call::Delete(_))), 0);
    assert!(cfg
        .registry
        .lookup_by_handle(Handle(handle))
        .is_some());
}

#[tokio::test]
async fn test_physical_interface_configured_by_internal_name() {
    let cfg = Arc::new(FakeConfigurator::new().with_live(1, "GigabitEthernet0/8/0", Kind::Physical));
    let store = Arc::new(MemorySnapshotStore::new());
    let resync = resync(&cfg, &store);
    let uplink = Obj {
        name: "GigabitEthernet0/8/0".to_string(),
        kind: Kind::Physical,
        mtu: 9000,
    };

    resync.run(&[uplink.clone()]).await.unwrap();
    assert_eq!(cfg.take_calls(), vec![Call::Create(uplink.name.clone())]);

    resync.run(&[uplink.clone()]).await.unwrap();
    assert_eq!(cfg.calls(), vec![Call::Modify(uplink.name.clone(), Handle(1))]);
    assert_eq!(
        cfg.registry.lookup_by_handle(Handle(1)),
        Some(("GigabitEthernet0/8/0".to_string(), uplink))
    );
}

#[tokio::test]
async fn test_delete_failure_does_not_stop_pass() {
    let cfg = Arc::new(
        FakeConfigurator::new()
            .with_live(7, "obsolete-a", Kind::Virtual)
            .with_live(8, "obsolete-b", Kind::Virtual),
    );
    cfg.fail_delete.lock().insert(Handle(7));
    let store = Arc::new(MemorySnapshotStore::new());

    let result = resync(&cfg, &store).run(&[virt("eth1")]).await;

    assert!(matches!(result, Err(ReconcileError::Rejected { .. })));
    assert_eq!(
        cfg.calls(),
        vec![
            Call::Delete(Handle(7)),
            Call::Delete(Handle(8)),
            Call::Create("eth1".to_string()),
        ]
    );
    assert!(cfg.registry.lookup_by_name("eth1").is_some());
}

#[tokio::test]
async fn test_pass_returns_last_error() {
    let cfg = Arc::new(FakeConfigurator::new().with_live(7, "obsolete", Kind::Virtual));
    cfg.fail_delete.lock().insert(Handle(7));
    cfg.fail_create.lock().insert("eth2".to_string());
    let store = Arc::new(MemorySnapshotStore::new());

    let result = resync(&cfg, &store)
        .run(&[virt("eth1"), virt("eth2"), virt("eth3")])
        .await;

    assert_eq!(result, Err(ReconcileError::rejected("eth2", "no memory")));
    assert_eq!(cfg.count(|c| matches!(c, Call::Create(_))), 3);
    assert_eq!(cfg.registry.names(), vec!["eth1", "eth3", "local0"]);
}

#[tokio::test]
async fn test_failed_modify_still_registers() {
    let cfg = Arc::new(FakeConfigurator::new().with_live(5, "tap0", Kind::Virtual));
    cfg.fail_modify.lock().insert("eth0".to_string());
    let store = Arc::new(MemorySnapshotStore::new());
    persisted(&store, &[("eth0", 5)]);

    let result = resync(&cfg, &store).run(&[virt("eth0")]).await;

    assert!(result.is_err());
    assert_eq!(
        cfg.registry.lookup_by_name("eth0").map(|(h, _)| h),
        Some(Handle(5))
    );
}

#[tokio::test]
async fn test_pending_object_not_registered_after_modify() {
    let cfg = Arc::new(FakeConfigurator::new().with_live(5, "host-veth", Kind::Virtual));
    cfg.pending.lock().insert("afp0".to_string());
    cfg.fail_modify.lock().insert("afp0".to_string());
    let store = Arc::new(MemorySnapshotStore::new());
    persisted(&store, &[("afp0", 5)]);

    let result = resync(&cfg, &store).run(&[virt("afp0")]).await;

    assert!(result.is_err());
    assert_eq!(cfg.calls(), vec![Call::Modify("afp0".to_string(), Handle(5))]);
    assert!(cfg.registry.lookup_by_name("afp0").is_none());
}

#[tokio::test]
async fn test_object_lost_by_failed_modify_not_registered() {
    let cfg = Arc::new(FakeConfigurator::new());
    let store = Arc::new(MemorySnapshotStore::new());
    let resync = resync(&cfg, &store);

    resync.run(&[virt("eth0")]).await.unwrap();
    cfg.fail_recreate.lock().insert("eth0".to_string());

    let result = resync.run(&[virt("eth0")]).await;

    assert_eq!(result, Err(ReconcileError::rejected("eth0", "no memory")));
    assert!(cfg.registry.lookup_by_name("eth0").is_none());
    assert!(cfg.registry.lookup_by_handle(Handle(100)).is_none());

    cfg.fail_recreate.lock().clear();
    cfg.take_calls();
    resync.run(&[virt("eth0")]).await.unwrap();
    assert_eq!(cfg.calls(), vec![Call::Create("eth0".to_string())]);
}

#[tokio::test]
async fn test_pending_objects_dropped_once_undesired() {
    let cfg = Arc::new(FakeConfigurator::new());
    cfg.pending.lock().insert("afp0".to_string());
    let store = Arc::new(MemorySnapshotStore::new());
    let resync = resync(&cfg, &store);

    resync.run(&[virt("afp0")]).await.unwrap();
    assert!(cfg.pending.lock().contains("afp0"));

    resync.run(&[]).await.unwrap();
    assert!(cfg.pending.lock().is_empty());
}

#[tokio::test]
async fn test_dump_failure_aborts_pass() {
    let cfg = Arc::new(FakeConfigurator::new().with_live(7, "obsolete", Kind::Virtual));
    cfg.fail_dump.store(true, Ordering::SeqCst);
    let store = Arc::new(MemorySnapshotStore::new());
    let resync = resync(&cfg, &store);

    let result = resync.run(&[virt("eth1")]).await;

    assert!(matches!(result, Err(ReconcileError::Transport(_))));
    assert!(cfg.calls().is_empty());
    assert!(!resync.first_pass_done().await);
    assert!(store.is_empty());
}

struct FailingStore;

impl SnapshotStore for FailingStore {
    fn save(&self, _label: &str, _snapshot: &Snapshot) -> Result<(), ReconcileError> {
        Err(ReconcileError::Persistence("read-only filesystem".into()))
    }

    fn load(&self, _label: &str) -> Result<Option<Snapshot>, ReconcileError> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_persistence_failure_aborts_first_pass() {
    let cfg = Arc::new(FakeConfigurator::new().with_live(7, "obsolete", Kind::Virtual));
    let resync = Resync::new(Arc::clone(&cfg), Arc::new(FailingStore), "agent-test");

    let result = resync.run(&[virt("eth1")]).await;

    assert!(matches!(result, Err(ReconcileError::Persistence(_))));
    assert!(cfg.calls().is_empty());
    assert!(!resync.first_pass_done().await);
}

#[tokio::test]
async fn test_vanished_object_is_recreated() {
    let cfg = Arc::new(FakeConfigurator::new());
    let store = Arc::new(MemorySnapshotStore::new());
    let resync = resync(&cfg, &store);

    resync.run(&[virt("eth1")]).await.unwrap();
    // Removed out of band.
    cfg.live.lock().remove(&Handle(100));
    cfg.take_calls();

    resync.run(&[virt("eth1")]).await.unwrap();

    assert_eq!(cfg.calls(), vec![Call::Create("eth1".to_string())]);
    assert_eq!(
        cfg.registry.lookup_by_name("eth1").map(|(h, _)| h),
        Some(Handle(101))
    );
}

#[tokio::test]
async fn test_vanished_binding_is_pruned() {
    let cfg = Arc::new(FakeConfigurator::new());
    let store = Arc::new(MemorySnapshotStore::new());
    let resync = resync(&cfg, &store);

    resync.run(&[virt("eth1")]).await.unwrap();
    cfg.live.lock().remove(&Handle(100));
    cfg.fail_create.lock().insert("eth1".to_string());

    let result = resync.run(&[virt("eth1")]).await;

    assert!(result.is_err());
    assert!(cfg.registry.lookup_by_name("eth1").is_none());
    assert_eq!(cfg.registry.names(), vec!["local0"]);
}

#[tokio::test]
async fn test_undesired_object_deleted_on_later_pass() {
    let cfg = Arc::new(FakeConfigurator::new());
    let store = Arc::new(MemorySnapshotStore::new());
    let resync = resync(&cfg, &store);

    resync.run(&[virt("eth1"), virt("eth2")]).await.unwrap();
    cfg.take_calls();

    let summary = resync.run(&[virt("eth1")]).await.unwrap();

    assert_eq!(summary.deleted, 1);
    assert!(cfg.registry.lookup_by_name("eth2").is_none());
    assert!(cfg.calls().contains(&Call::Delete(Handle(101))));
}

#[derive(Default)]
struct FakeKeyed {
    existing: Mutex<Vec<String>>,
    cached: Mutex<Vec<String>>,
    applied: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    fail: Mutex<HashSet<String>>,
}

#[async_trait]
impl KeyedConfigurator for FakeKeyed {
    type Desired = Obj;

    async fn refresh(&self) -> Result<(), ReconcileError> {
        *self.cached.lock() = self.existing.lock().clone();
        Ok(())
    }

    fn cached_names(&self) -> Vec<String> {
        self.cached.lock().clone()
    }

    async fn create_or_update(&self, desired: &Obj) -> Result<Applied, ReconcileError> {
        if self.fail.lock().contains(&desired.name) {
            return Err(ReconcileError::validation(&desired.name, "bad peer"));
        }
        if self.cached.lock().contains(&desired.name) {
            return Ok(Applied::Unchanged);
        }
        self.applied.lock().push(desired.name.clone());
        Ok(Applied::Created)
    }

    async fn remove(&self, name: &str) -> Result<(), ReconcileError> {
        self.removed.lock().push(name.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_keyed_resync_continues_and_removes_obsolete() {
    let cfg = Arc::new(FakeKeyed::default());
    *cfg.existing.lock() = vec!["s1".to_string(), "stale".to_string()];
    cfg.fail.lock().insert("s2".to_string());
    let resync = KeyedResync::new(Arc::clone(&cfg));

    let result = resync.run(&[virt("s1"), virt("s2"), virt("s3")]).await;

    assert_eq!(result, Err(ReconcileError::validation("s2", "bad peer")));
    assert_eq!(*cfg.applied.lock(), vec!["s3"]);
    assert_eq!(*cfg.removed.lock(), vec!["stale"]);
}

#[tokio::test]
async fn test_keyed_resync_counts_only_real_changes() {
    let cfg = Arc::new(FakeKeyed::default());
    *cfg.existing.lock() = vec!["s1".to_string()];
    let resync = KeyedResync::new(Arc::clone(&cfg));

    let summary = resync.run(&[virt("s1"), virt("s2")]).await.unwrap();

    assert_eq!(summary.created, 1);
    assert_eq!(summary.modified, 0);
    assert_eq!(summary.deleted, 0);
    assert_eq!(*cfg.applied.lock(), vec!["s2"]);
}
