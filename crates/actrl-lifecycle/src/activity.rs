//! ---
//! actrl_section: "02-lifecycle"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Managed activity contracts and installed activity records."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::state::ActivityStatus;

/// Configuration key holding the activity install directory.
pub const CONFIG_INSTALL_DIR: &str = "activity.installdir";
/// Configuration key holding the activity log directory.
pub const CONFIG_LOG_DIR: &str = "activity.logdir";
/// Configuration key holding the permanent data directory.
pub const CONFIG_DATA_DIR: &str = "activity.datadir";
/// Configuration key holding the temporary data directory.
pub const CONFIG_TMP_DIR: &str = "activity.tmpdir";

/// Whether an activity is brought up when the node starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutostartPolicy {
    /// Left alone.
    #[default]
    None,
    /// Started.
    Startup,
    /// Started and activated.
    Activate,
}

/// Durable record of an activity installed on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledActivity {
    /// Activity identifier.
    pub uuid: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Node startup behaviour.
    #[serde(default)]
    pub autostart: AutostartPolicy,
}

impl InstalledActivity {
    /// Record with no autostart.
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            autostart: AutostartPolicy::None,
        }
    }

    /// Builder setting the autostart policy.
    pub fn with_autostart(mut self, autostart: AutostartPolicy) -> Self {
        self.autostart = autostart;
        self
    }
}

/// Directories owned by one activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFilesystem {
    /// Unpacked activity contents.
    pub install_dir: PathBuf,
    /// Log output.
    pub log_dir: PathBuf,
    /// Data kept across restarts.
    pub permanent_data_dir: PathBuf,
    /// Scratch data.
    pub temp_data_dir: PathBuf,
}

impl ActivityFilesystem {
    /// Standard layout below `root`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            install_dir: root.join("install"),
            log_dir: root.join("log"),
            permanent_data_dir: root.join("data"),
            temp_data_dir: root.join("tmp"),
        }
    }
}

/// Key/value configuration of one activity.
pub trait ActivityConfiguration: Send {
    /// Reload from the backing store, discarding values set since the last load.
    fn load(&mut self) -> anyhow::Result<()>;

    /// Merge `update` and persist it where the store supports that.
    fn update(&mut self, update: &IndexMap<String, String>) -> anyhow::Result<()>;

    /// Set a single value in memory.
    fn set_value(&mut self, key: &str, value: String);

    /// Look up a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Copy of every value.
    fn snapshot(&self) -> IndexMap<String, String>;
}

/// In-memory configuration seeded from a fixed map.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfiguration {
    seed: IndexMap<String, String>,
    values: IndexMap<String, String>,
}

impl MemoryConfiguration {
    /// Configuration that reloads to `seed`.
    pub fn new(seed: IndexMap<String, String>) -> Self {
        Self {
            values: seed.clone(),
            seed,
        }
    }
}

impl ActivityConfiguration for MemoryConfiguration {
    fn load(&mut self) -> anyhow::Result<()> {
        self.values = self.seed.clone();
        Ok(())
    }

    fn update(&mut self, update: &IndexMap<String, String>) -> anyhow::Result<()> {
        for (key, value) in update {
            self.seed.insert(key.clone(), value.clone());
            self.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn set_value(&mut self, key: &str, value: String) {
        self.values.insert(key.to_owned(), value);
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn snapshot(&self) -> IndexMap<String, String> {
        self.values.clone()
    }
}

/// Everything a factory needs to build an instance.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Installed record.
    pub activity: InstalledActivity,
    /// Activity directories.
    pub filesystem: ActivityFilesystem,
    /// Configuration as loaded for this startup.
    pub configuration: IndexMap<String, String>,
}

impl ActivityContext {
    /// Activity identifier.
    pub fn uuid(&self) -> &str {
        &self.activity.uuid
    }
}

/// Receives status changes from inside a managed instance.
pub trait StatusListener: Send + Sync {
    /// Called after the instance changed its status.
    fn on_status_change(&self, old: &ActivityStatus, new: &ActivityStatus);
}

/// Receives status changes for activities, keyed by UUID.
pub trait ActivityStatusListener: Send + Sync {
    /// Called after the activity identified by `uuid` changed status.
    fn on_activity_status_change(&self, uuid: &str, old: &ActivityStatus, new: &ActivityStatus);
}

impl<F> ActivityStatusListener for F
where
    F: Fn(&str, &ActivityStatus, &ActivityStatus) + Send + Sync,
{
    fn on_activity_status_change(&self, uuid: &str, old: &ActivityStatus, new: &ActivityStatus) {
        self(uuid, old, new)
    }
}

/// A live activity instance.
///
/// Hooks are only ever invoked by the owning instance controller while it
/// holds the activity lock, so implementations see them one at a time.
/// Implementations report their own status changes to every registered
/// [`StatusListener`], including changes made through [`ManagedActivity::set_status`].
pub trait ManagedActivity: Send {
    /// Bring the activity up.
    fn startup(&mut self) -> anyhow::Result<()>;

    /// Tear the activity down.
    fn shutdown(&mut self) -> anyhow::Result<()>;

    /// Activate a running activity.
    fn activate(&mut self) -> anyhow::Result<()>;

    /// Deactivate an active activity.
    fn deactivate(&mut self) -> anyhow::Result<()>;

    /// Check liveness; an error marks the activity as crashed.
    fn check_health(&mut self) -> anyhow::Result<()>;

    /// Current status.
    fn status(&self) -> ActivityStatus;

    /// Replace the current status and notify listeners.
    fn set_status(&mut self, status: ActivityStatus);

    /// Apply a configuration update while running.
    fn update_configuration(&mut self, update: &IndexMap<String, String>) -> anyhow::Result<()>;

    /// Register a listener for status changes.
    fn register_status_listener(&mut self, listener: Arc<dyn StatusListener>);

    /// Clean up after a failed startup.
    fn handle_startup_failure(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds managed instances.
pub trait ActivityFactory: Send + Sync {
    /// Create a new, not yet started instance.
    fn create(&self, context: &ActivityContext) -> anyhow::Result<Box<dyn ManagedActivity>>;
}
