//! ---
//! actrl_section: "01-core-functionality"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Shared configuration and logging primitives."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
//! Shared primitives for the activity controller workspace.
//! This crate exposes node configuration loading and tracing setup
//! consumed by the node runtime and the daemon binary.

pub mod config;
pub mod logging;

pub use config::{
    ControllerConfig, LoadedNodeConfig, LoggingConfig, MetricsConfig, NodeConfig,
    RepositoryConfig, RuntimeConfig, StorageConfig,
};
pub use logging::{init_tracing, LogFormat};
