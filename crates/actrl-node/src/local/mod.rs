//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Local production collaborators for the daemon."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
//! File and process backed collaborators used by `actrld`.

mod configuration;
mod native;
mod notify;
mod repository;
mod storage;

use std::sync::Arc;

use actrl_common::NodeConfig;

use crate::collaborators::NodeCollaborators;

pub use configuration::{TomlActivityConfiguration, TomlConfigurationProvider};
pub use native::{NativeActivity, NativeActivityFactory, CONFIG_ARGS, CONFIG_EXECUTABLE};
pub use notify::{TracingAlerts, TracingNotifier};
pub use repository::ManifestActivityRepository;
pub use storage::DirectoryStorage;

/// Collaborators reading the manifest and storage root named in `config`.
pub fn collaborators(config: &NodeConfig) -> anyhow::Result<NodeCollaborators> {
    Ok(NodeCollaborators {
        repository: Arc::new(ManifestActivityRepository::open(&config.repository.manifest)?),
        storage: Arc::new(DirectoryStorage::new(&config.storage.root)),
        configuration: Arc::new(TomlConfigurationProvider),
        factory: Arc::new(NativeActivityFactory),
        notifier: Arc::new(TracingNotifier),
        alerts: Arc::new(TracingAlerts),
    })
}
