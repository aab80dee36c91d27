//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Controller identity and the periodic heartbeat loop."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::time::Duration;

use actrl_common::ControllerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity of this controller node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub uuid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

impl ControllerInfo {
    /// Identity from configuration, generating a UUID when none is set.
    pub fn confirm(config: &ControllerConfig) -> Self {
        let uuid = match config.uuid.as_deref().map(str::trim) {
            Some(uuid) if !uuid.is_empty() => uuid.to_owned(),
            _ => {
                let generated = Uuid::new_v4().to_string();
                warn!(controller = %generated, "no controller uuid configured; generated one for this run");
                generated
            }
        };
        Self {
            uuid,
            name: config.name.clone(),
            description: config.description.clone(),
            host_id: config.host_id.clone(),
        }
    }
}

/// Liveness report published by the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerHeartbeat {
    pub controller_uuid: String,
    /// Monotonic per run, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Activities with an instance controller.
    pub activities: usize,
    /// Activities in a running state.
    pub running: usize,
}

/// Call `beat` with an increasing sequence number every `period` until `shutdown` fires.
pub fn spawn_heartbeat_task<F>(
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut beat: F,
) -> JoinHandle<()>
where
    F: FnMut(u64) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("heartbeat shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    sequence += 1;
                    beat(sequence);
                }
            }
        }
        debug!(sequence, "heartbeat loop exited");
    })
}
