//! dpsync dataplane agent library
//!
//! The agent converges a packet forwarder to a declarative desired state.
//! Resource kinds are driven by the orchestrators in `dpsync-reconcile`:
//!
//! ```text
//! DataplaneAgent
//! ├── Resync<InterfaceConfigurator>         (handle-addressed, correlated)
//! ├── KeyedResync<BfdAuthKeyConfigurator>
//! ├── KeyedResync<BfdSessionConfigurator>
//! └── KeyedResync<BfdEchoConfigurator>
//! ```
//!
//! ## Modules
//!
//! - `dataplane`: Forwarder API trait and the in-memory forwarder
//! - `ifplugin`: Interface configurator and AF_PACKET host-link tracking
//! - `bfdplugin`: BFD session, key and echo configurators
//! - `state`: SQLite snapshot persistence

pub mod agent;
pub mod bfdplugin;
pub mod config;
pub mod dataplane;
pub mod desired;
pub mod ifplugin;
pub mod model;
pub mod reconciler;
pub mod state;

// Re-export commonly used types
pub use agent::{DataplaneAgent, ResyncReport};
pub use dataplane::{Dataplane, DataplaneError, MockDataplane};
pub use desired::{DesiredState, DesiredStateSource, FileDesiredStateSource};
