//! ---
//! actrl_section: "03-observability"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Node metrics and the scrape endpoint."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the node.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Serve the registry at `/metrics` until the returned handle is shut down.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || render(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let local_addr = std_listener.local_addr().unwrap_or(addr);
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %local_addr, "metrics endpoint starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics endpoint encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn render(registry: SharedRegistry) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running scrape endpoint.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Counters and gauges maintained by a controller node.
#[derive(Clone, Debug)]
pub struct NodeMetrics {
    registry: SharedRegistry,
    commands: IntCounterVec,
    published: IntCounterVec,
    watcher_events: IntCounterVec,
    heartbeats: IntCounter,
    activities: IntGauge,
}

impl NodeMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let commands = IntCounterVec::new(
            Opts::new(
                "actrl_commands_total",
                "Lifecycle commands received by the node, by command",
            ),
            &["command"],
        )?;
        registry.register(Box::new(commands.clone()))?;

        let published = IntCounterVec::new(
            Opts::new(
                "actrl_status_published_total",
                "Activity statuses published to the notifier, by state",
            ),
            &["state"],
        )?;
        registry.register(Box::new(published.clone()))?;

        let watcher_events = IntCounterVec::new(
            Opts::new(
                "actrl_watcher_events_total",
                "Changes reported by the health watcher, by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(watcher_events.clone()))?;

        let heartbeats = IntCounter::with_opts(Opts::new(
            "actrl_heartbeats_total",
            "Controller heartbeats published",
        ))?;
        registry.register(Box::new(heartbeats.clone()))?;

        let activities = IntGauge::with_opts(Opts::new(
            "actrl_activities_registered",
            "Activities with an instance controller on this node",
        ))?;
        registry.register(Box::new(activities.clone()))?;

        Ok(Self {
            registry,
            commands,
            published,
            watcher_events,
            heartbeats,
            activities,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_command(&self, command: &str) {
        self.commands.with_label_values(&[command]).inc();
    }

    pub fn record_published(&self, state: &str) {
        self.published.with_label_values(&[state]).inc();
    }

    pub fn record_watcher_event(&self, kind: &str) {
        self.watcher_events.with_label_values(&[kind]).inc();
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats.inc();
    }

    pub fn set_activities(&self, count: usize) {
        self.activities.set(count as i64);
    }

    pub fn commands_total(&self, command: &str) -> u64 {
        self.commands.with_label_values(&[command]).get()
    }

    pub fn published_total(&self, state: &str) -> u64 {
        self.published.with_label_values(&[state]).get()
    }

    pub fn heartbeats_total(&self) -> u64 {
        self.heartbeats.get()
    }
}

pub use prometheus;
