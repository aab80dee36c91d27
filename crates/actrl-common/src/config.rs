//! ---
//! actrl_section: "01-core-functionality"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Node configuration model and loader."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_controller_name() -> String {
    "actrl-node".to_owned()
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_millis(10_000)
}

fn default_watcher_interval() -> Duration {
    Duration::from_millis(1_000)
}

fn default_sampler_interval() -> Option<Duration> {
    Some(Duration::from_millis(5_000))
}

fn default_lock_wait() -> Duration {
    Duration::from_millis(20_000)
}

fn default_flush_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("target/activities")
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("configs/activities.toml")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Primary configuration object for a controller node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`NodeConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedNodeConfig {
    pub config: NodeConfig,
    pub source: PathBuf,
}

impl NodeConfig {
    pub const ENV_CONFIG_PATH: &str = "ACTRL_CONFIG";

    /// Load configuration from disk, respecting the `ACTRL_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedNodeConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedNodeConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedNodeConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<NodeConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.runtime.validate()?;
        if self.storage.root.as_os_str().is_empty() {
            return Err(anyhow!("storage root must not be empty"));
        }
        if self.repository.manifest.as_os_str().is_empty() {
            return Err(anyhow!("repository manifest path must not be empty"));
        }
        Ok(())
    }
}

impl std::str::FromStr for NodeConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: NodeConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity of the controller node. A missing `uuid` is generated at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default = "default_controller_name")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub host_id: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            uuid: None,
            name: default_controller_name(),
            description: None,
            host_id: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_heartbeat_interval", rename = "heartbeat_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_watcher_interval", rename = "watcher_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub watcher_interval: Duration,
    /// Set to `0` to disable the periodic status sampler.
    #[serde(default = "default_sampler_interval", rename = "sampler_interval_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub sampler_interval: Option<Duration>,
    #[serde(default = "default_lock_wait", rename = "lock_wait_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub lock_wait: Duration,
    #[serde(default = "default_flush_timeout", rename = "flush_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub flush_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            watcher_interval: default_watcher_interval(),
            sampler_interval: default_sampler_interval(),
            lock_wait: default_lock_wait(),
            flush_timeout: default_flush_timeout(),
        }
    }
}

impl RuntimeConfig {
    /// Effective sampler cadence; a zero interval disables sampling.
    pub fn sampler(&self) -> Option<Duration> {
        self.sampler_interval.filter(|interval| !interval.is_zero())
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(anyhow!("runtime.heartbeat_interval_ms must be greater than zero"));
        }
        if self.watcher_interval.is_zero() {
            return Err(anyhow!("runtime.watcher_interval_ms must be greater than zero"));
        }
        if self.lock_wait.is_zero() {
            return Err(anyhow!("runtime.lock_wait_ms must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_manifest_path")]
    pub manifest: PathBuf,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Base level for targets without an entry of their own.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Per-target levels, e.g. `actrl_lifecycle::instance = "debug"`.
    #[serde(default)]
    pub targets: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            level: default_log_level(),
            targets: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config: NodeConfig = "".parse().expect("defaults parse");
        assert_eq!(config.runtime.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.runtime.watcher_interval, Duration::from_secs(1));
        assert_eq!(config.runtime.lock_wait, Duration::from_secs(20));
        assert_eq!(config.runtime.sampler(), Some(Duration::from_secs(5)));
        assert!(config.controller.uuid.is_none());
        assert_eq!(config.controller.name, "actrl-node");
    }

    #[test]
    fn runtime_intervals_are_read_in_milliseconds() {
        let config: NodeConfig = r#"
            [controller]
            uuid = "c-1"
            name = "lab"

            [runtime]
            heartbeat_interval_ms = 250
            watcher_interval_ms = 20
            sampler_interval_ms = 0
            lock_wait_ms = 100
        "#
        .parse()
        .expect("config parses");
        assert_eq!(config.controller.uuid.as_deref(), Some("c-1"));
        assert_eq!(config.runtime.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.runtime.watcher_interval, Duration::from_millis(20));
        assert_eq!(config.runtime.sampler(), None);
        assert_eq!(config.runtime.lock_wait, Duration::from_millis(100));
    }

    #[test]
    fn logging_targets_are_read_as_a_table() {
        let config: NodeConfig = r#"
            [logging]
            level = "warn"

            [logging.targets]
            "actrl_lifecycle::instance" = "debug"
        "#
        .parse()
        .expect("config parses");
        assert_eq!(config.logging.level, "warn");
        assert_eq!(
            config
                .logging
                .targets
                .get("actrl_lifecycle::instance")
                .map(String::as_str),
            Some("debug")
        );
    }

    #[test]
    fn zero_watcher_interval_is_rejected() {
        let err = "[runtime]\nwatcher_interval_ms = 0\n"
            .parse::<NodeConfig>()
            .expect_err("zero interval must fail");
        assert!(err.to_string().contains("watcher_interval_ms"));
    }

    #[test]
    fn first_existing_candidate_is_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.toml");
        let mut file = fs::File::create(&path).expect("create config");
        writeln!(file, "[storage]\nroot = \"/srv/activities\"").expect("write config");

        let missing = dir.path().join("missing.toml");
        let loaded = NodeConfig::load_with_source(&[missing, path.clone()]).expect("loads");
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.storage.root, PathBuf::from("/srv/activities"));
    }
}
