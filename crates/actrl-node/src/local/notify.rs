//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Notifier and alerter writing structured tracing events."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use actrl_lifecycle::{ActivityStatus, InstanceController};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::collaborators::{AlertNotifier, StatusNotifier};
use crate::heartbeat::{ControllerHeartbeat, ControllerInfo};

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    activity: &'a str,
    status: &'a ActivityStatus,
    reported_at: DateTime<Utc>,
}

/// Emits every outbound message as a JSON payload on the `actrl::outbound` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl StatusNotifier for TracingNotifier {
    fn publish_status(&self, uuid: &str, status: &ActivityStatus) -> Result<()> {
        let payload = serde_json::to_string(&StatusReport {
            activity: uuid,
            status,
            reported_at: Utc::now(),
        })
        .context("failed to encode status report")?;
        info!(target: "actrl::outbound", activity = %uuid, state = %status.state(), %payload, "activity status");
        Ok(())
    }

    fn publish_heartbeat(&self, heartbeat: &ControllerHeartbeat) -> Result<()> {
        let payload = serde_json::to_string(heartbeat).context("failed to encode heartbeat")?;
        info!(target: "actrl::outbound", sequence = heartbeat.sequence, %payload, "controller heartbeat");
        Ok(())
    }

    fn announce_startup(&self, info: &ControllerInfo) -> Result<()> {
        let payload = serde_json::to_string(info).context("failed to encode controller info")?;
        info!(target: "actrl::outbound", controller = %info.uuid, %payload, "controller startup");
        Ok(())
    }
}

/// Raises alerts as warnings on the `actrl::alert` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlerts;

impl AlertNotifier for TracingAlerts {
    fn announce(&self, controller: &InstanceController) -> Result<()> {
        let status = controller.get_cached_status();
        warn!(
            target: "actrl::alert",
            activity = %controller.uuid(),
            name = %controller.activity().name,
            state = %status.state(),
            detail = status.detail().unwrap_or(""),
            cause = %status.cause().map(|cause| format!("{cause:#}")).unwrap_or_default(),
            "activity needs attention"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actrl_lifecycle::ActivityState;

    #[test]
    fn status_report_embeds_the_status() {
        let status = ActivityStatus::failure(
            ActivityState::Crashed,
            "health check failed",
            anyhow::anyhow!("exit 3"),
        );
        let value = serde_json::to_value(StatusReport {
            activity: "u1",
            status: &status,
            reported_at: Utc::now(),
        })
        .expect("encode");
        assert_eq!(value["activity"], "u1");
        assert_eq!(value["status"]["state"], "CRASHED");
        TracingNotifier.publish_status("u1", &status).expect("publish");
    }
}
