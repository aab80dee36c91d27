//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Interfaces the node relies on outside the lifecycle engine."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
//! Boundaries between the node and the rest of the platform.
//!
//! The node never touches package storage, persisted configuration or the
//! master link directly. It reaches them through the traits below, bundled
//! in [`NodeCollaborators`]. Production implementations live in
//! [`crate::local`].

use std::fmt;
use std::sync::Arc;

use actrl_lifecycle::{
    ActivityConfiguration, ActivityFactory, ActivityFilesystem, ActivityStatus,
    InstalledActivity, InstanceController,
};

use crate::heartbeat::{ControllerHeartbeat, ControllerInfo};

/// Installed activities known to this node.
pub trait ActivityRepository: Send + Sync {
    /// Record for `uuid`, if installed.
    fn lookup(&self, uuid: &str) -> anyhow::Result<Option<InstalledActivity>>;

    /// Every installed activity.
    fn list_all(&self) -> anyhow::Result<Vec<InstalledActivity>>;
}

/// Owns the on-disk directories of each activity.
pub trait StorageProvider: Send + Sync {
    /// Directories for `uuid`, created when missing.
    fn filesystem_for(&self, uuid: &str) -> anyhow::Result<ActivityFilesystem>;

    /// Empty the temporary data directory.
    fn clean_temp_data(&self, uuid: &str) -> anyhow::Result<()>;

    /// Empty the permanent data directory.
    fn clean_permanent_data(&self, uuid: &str) -> anyhow::Result<()>;
}

/// Supplies the configuration store of an activity.
pub trait ConfigurationProvider: Send + Sync {
    /// Configuration for `activity`, not yet loaded.
    fn configuration_for(
        &self,
        activity: &InstalledActivity,
        filesystem: &ActivityFilesystem,
    ) -> anyhow::Result<Box<dyn ActivityConfiguration>>;
}

/// Outbound status channel towards the master. Fire and forget.
pub trait StatusNotifier: Send + Sync {
    /// Report the status of one activity.
    fn publish_status(&self, uuid: &str, status: &ActivityStatus) -> anyhow::Result<()>;

    /// Report node liveness.
    fn publish_heartbeat(&self, heartbeat: &ControllerHeartbeat) -> anyhow::Result<()>;

    /// Announce that the node came up.
    fn announce_startup(&self, info: &ControllerInfo) -> anyhow::Result<()>;
}

/// Operator alerting for activities that need attention. Best effort.
pub trait AlertNotifier: Send + Sync {
    /// Raise an alert about `controller`.
    fn announce(&self, controller: &InstanceController) -> anyhow::Result<()>;
}

/// Everything the node needs from the outside world.
#[derive(Clone)]
pub struct NodeCollaborators {
    pub repository: Arc<dyn ActivityRepository>,
    pub storage: Arc<dyn StorageProvider>,
    pub configuration: Arc<dyn ConfigurationProvider>,
    pub factory: Arc<dyn ActivityFactory>,
    pub notifier: Arc<dyn StatusNotifier>,
    pub alerts: Arc<dyn AlertNotifier>,
}

impl fmt::Debug for NodeCollaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCollaborators").finish_non_exhaustive()
    }
}
