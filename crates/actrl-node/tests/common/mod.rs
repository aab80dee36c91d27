//! ---
//! actrl_section: "06-testing"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Recording collaborators shared by node integration tests."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use actrl_common::ControllerConfig;
use actrl_lifecycle::{
    ActivityConfiguration, ActivityFilesystem, ActivityState, ActivityStatus, InstalledActivity,
    InstanceController, MemoryConfiguration,
};
use actrl_node::{
    ActivityRepository, AlertNotifier, ConfigurationProvider, ControllerHeartbeat, ControllerInfo,
    ControllerNode, NodeCollaborators, NodeSettings, StatusNotifier, StorageProvider,
};
use actrl_testharness::ScriptedActivityFactory;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::time::sleep;

#[derive(Default)]
pub struct RecordingNotifier {
    statuses: Mutex<Vec<(String, ActivityStatus)>>,
    heartbeats: Mutex<Vec<ControllerHeartbeat>>,
    announced: Mutex<Vec<ControllerInfo>>,
}

impl RecordingNotifier {
    pub fn states_for(&self, uuid: &str) -> Vec<ActivityState> {
        self.statuses
            .lock()
            .iter()
            .filter(|(id, _)| id == uuid)
            .map(|(_, status)| status.state())
            .collect()
    }

    pub fn last_for(&self, uuid: &str) -> Option<ActivityStatus> {
        self.statuses
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == uuid)
            .map(|(_, status)| status.clone())
    }

    pub fn heartbeats(&self) -> Vec<ControllerHeartbeat> {
        self.heartbeats.lock().clone()
    }

    pub fn announced(&self) -> Vec<ControllerInfo> {
        self.announced.lock().clone()
    }
}

impl StatusNotifier for RecordingNotifier {
    fn publish_status(&self, uuid: &str, status: &ActivityStatus) -> anyhow::Result<()> {
        self.statuses.lock().push((uuid.to_owned(), status.clone()));
        Ok(())
    }

    fn publish_heartbeat(&self, heartbeat: &ControllerHeartbeat) -> anyhow::Result<()> {
        self.heartbeats.lock().push(heartbeat.clone());
        Ok(())
    }

    fn announce_startup(&self, info: &ControllerInfo) -> anyhow::Result<()> {
        self.announced.lock().push(info.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<(String, ActivityState)>>,
}

impl RecordingAlerts {
    pub fn for_activity(&self, uuid: &str) -> Vec<ActivityState> {
        self.alerts
            .lock()
            .iter()
            .filter(|(id, _)| id == uuid)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl AlertNotifier for RecordingAlerts {
    fn announce(&self, controller: &InstanceController) -> anyhow::Result<()> {
        self.alerts
            .lock()
            .push((controller.uuid().to_owned(), controller.get_cached_status().state()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    activities: Mutex<IndexMap<String, InstalledActivity>>,
}

impl MemoryRepository {
    pub fn install(&self, activity: InstalledActivity) {
        self.activities.lock().insert(activity.uuid.clone(), activity);
    }
}

impl ActivityRepository for MemoryRepository {
    fn lookup(&self, uuid: &str) -> anyhow::Result<Option<InstalledActivity>> {
        Ok(self.activities.lock().get(uuid).cloned())
    }

    fn list_all(&self) -> anyhow::Result<Vec<InstalledActivity>> {
        Ok(self.activities.lock().values().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    cleaned: Mutex<Vec<(String, &'static str)>>,
}

impl MemoryStorage {
    pub fn cleaned(&self) -> Vec<(String, &'static str)> {
        self.cleaned.lock().clone()
    }
}

impl StorageProvider for MemoryStorage {
    fn filesystem_for(&self, uuid: &str) -> anyhow::Result<ActivityFilesystem> {
        Ok(ActivityFilesystem::under(format!("/srv/activities/{uuid}")))
    }

    fn clean_temp_data(&self, uuid: &str) -> anyhow::Result<()> {
        self.cleaned.lock().push((uuid.to_owned(), "tmp"));
        Ok(())
    }

    fn clean_permanent_data(&self, uuid: &str) -> anyhow::Result<()> {
        self.cleaned.lock().push((uuid.to_owned(), "data"));
        Ok(())
    }
}

pub struct MemoryConfigurationProvider;

impl ConfigurationProvider for MemoryConfigurationProvider {
    fn configuration_for(
        &self,
        _activity: &InstalledActivity,
        _filesystem: &ActivityFilesystem,
    ) -> anyhow::Result<Box<dyn ActivityConfiguration>> {
        Ok(Box::new(MemoryConfiguration::default()))
    }
}

pub struct Fixture {
    pub node: ControllerNode,
    pub factory: ScriptedActivityFactory,
    pub repository: Arc<MemoryRepository>,
    pub storage: Arc<MemoryStorage>,
    pub notifier: Arc<RecordingNotifier>,
    pub alerts: Arc<RecordingAlerts>,
}

pub fn fast_settings() -> NodeSettings {
    NodeSettings {
        heartbeat_interval: Duration::from_millis(50),
        watcher_interval: Duration::from_millis(10),
        sampler_interval: None,
        lock_wait: Duration::from_secs(2),
        flush_timeout: Duration::from_secs(5),
    }
}

pub fn fixture(activities: Vec<InstalledActivity>, factory: ScriptedActivityFactory) -> Fixture {
    fixture_with(activities, factory, fast_settings())
}

pub fn fixture_with(
    activities: Vec<InstalledActivity>,
    factory: ScriptedActivityFactory,
    settings: NodeSettings,
) -> Fixture {
    let repository = Arc::new(MemoryRepository::default());
    for activity in activities {
        repository.install(activity);
    }
    let storage = Arc::new(MemoryStorage::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let alerts = Arc::new(RecordingAlerts::default());
    let collaborators = NodeCollaborators {
        repository: repository.clone(),
        storage: storage.clone(),
        configuration: Arc::new(MemoryConfigurationProvider),
        factory: Arc::new(factory.clone()),
        notifier: notifier.clone(),
        alerts: alerts.clone(),
    };
    let controller = ControllerConfig {
        uuid: Some("controller-1".into()),
        ..ControllerConfig::default()
    };
    Fixture {
        node: ControllerNode::new(controller, settings, collaborators, None),
        factory,
        repository,
        storage,
        notifier,
        alerts,
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
