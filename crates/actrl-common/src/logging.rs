//! ---
//! actrl_section: "01-core-functionality"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Tracing subscriber setup for node processes."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "ACTRL_LOG";

/// Per-target levels applied under the configured base level.
///
/// The watcher polls every activity on each tick, so its routine output stays below `warn`.
const NODE_TARGETS: &[(&str, &str)] = &[
    ("actrl_node", "info"),
    ("actrl_lifecycle", "info"),
    ("actrl_lifecycle::watcher", "warn"),
    ("actrl_metrics", "info"),
    ("hyper", "warn"),
];

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats for node processes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "structured-json" | "json" => Ok(LogFormat::StructuredJson),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Filter directive derived from the logging section.
///
/// Starts from `config.level`, adds the node target defaults and lets
/// `config.targets` override any of them.
pub fn node_directive(config: &LoggingConfig) -> String {
    let mut targets: BTreeMap<&str, &str> = NODE_TARGETS.iter().copied().collect();
    for (target, level) in &config.targets {
        targets.insert(target.as_str(), level.as_str());
    }
    let mut directive = config.level.clone();
    for (target, level) in targets {
        directive.push_str(&format!(",{target}={level}"));
    }
    directive
}

fn node_filter(config: &LoggingConfig) -> EnvFilter {
    let configured = node_directive(config);
    let from_env = std::env::var(LOG_ENV)
        .ok()
        .map(|directive| (LOG_ENV, directive))
        .or_else(|| {
            std::env::var(EnvFilter::DEFAULT_ENV)
                .ok()
                .map(|directive| (EnvFilter::DEFAULT_ENV, directive))
        });
    if let Some((source, directive)) = from_env {
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("invalid {source} directive ({err}); using {configured}"),
        }
    }
    EnvFilter::try_new(&configured).unwrap_or_else(|err| {
        eprintln!("invalid logging configuration ({err}); defaulting to info");
        EnvFilter::new("info")
    })
}

/// Initialize the tracing subscriber for a node process.
///
/// * `ACTRL_LOG`, then `RUST_LOG`, replace the configured filter entirely.
/// * Without either, [`node_directive`] builds the filter from `config`.
/// * Stdout receives JSON or pretty output per `config.format`; a daily rolling
///   JSON file named after `config.file_prefix` (or `service_name`) is always
///   written under `config.directory`.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);

    let file_appender = daily(&config.directory, format!("{prefix}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let filter = node_filter(config);

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_file = %config.directory.join(format!("{prefix}.log")).display(),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}
