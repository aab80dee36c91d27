//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Controller node orchestrator exports."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
//! Controller node built on the activity lifecycle engine.
//!
//! [`ControllerNode`] maps UUID-addressed commands onto instance controllers
//! and owns the heartbeat, watcher and sampler loops. Everything outside the
//! node is reached through [`collaborators`]; [`local`] provides the
//! implementations used by the daemon.

pub mod collaborators;
pub mod error;
pub mod heartbeat;
pub mod local;
pub mod node;
pub mod registry;

pub use collaborators::{
    ActivityRepository, AlertNotifier, ConfigurationProvider, NodeCollaborators, StatusNotifier,
    StorageProvider,
};
pub use error::{NodeError, Result};
pub use heartbeat::{spawn_heartbeat_task, ControllerHeartbeat, ControllerInfo};
pub use node::{ControllerNode, NodeSettings};
pub use registry::ActivityRegistry;
