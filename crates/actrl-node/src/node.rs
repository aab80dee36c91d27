//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Controller node orchestrating activity lifecycles."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
//! The controller node.
//!
//! Commands arrive addressed by activity UUID and run on the caller's
//! thread. Status notifications from instances, watcher events, sequence
//! advancement and outbound publication all run on the event serializer,
//! one at a time and in submission order. The heartbeat, watcher and
//! sampler loops run on the tokio runtime until the node shuts down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use actrl_common::{ControllerConfig, RuntimeConfig};
use actrl_lifecycle::{
    spawn_watcher_task, ActivityState, ActivityStatus, ActivityStatusListener, ActivityWatcher,
    Advance, AutostartPolicy, EventSerializer, InstalledActivity, InstanceController,
    LifecycleError, Transition, TransitionPlan, TransitionResult, TransitionSequencer,
    WatcherListener,
};
use actrl_metrics::NodeMetrics;
use anyhow::anyhow;
use chrono::Utc;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use strum::Display;
use tokio::sync::broadcast;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::collaborators::NodeCollaborators;
use crate::error::{NodeError, Result};
use crate::heartbeat::{spawn_heartbeat_task, ControllerHeartbeat, ControllerInfo};
use crate::registry::ActivityRegistry;

const MISSING_DETAIL: &str = "Activity does not exist";
const SERIALIZER_THREAD: &str = "actrl-events";

/// Which data directory a clean command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
enum DataKind {
    Temporary,
    Permanent,
}

/// Timing knobs of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub heartbeat_interval: Duration,
    pub watcher_interval: Duration,
    /// `None` disables periodic health sampling.
    pub sampler_interval: Option<Duration>,
    pub lock_wait: Duration,
    pub flush_timeout: Duration,
}

impl From<&RuntimeConfig> for NodeSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            watcher_interval: config.watcher_interval,
            sampler_interval: config.sampler(),
            lock_wait: config.lock_wait,
            flush_timeout: config.flush_timeout,
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

enum Found {
    Controller(Arc<InstanceController>),
    Installed(InstalledActivity),
}

/// Handle to a controller node. Clones share the node.
#[derive(Clone)]
pub struct ControllerNode {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for ControllerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerNode")
            .field("controller", &self.inner.controller.name)
            .field("accepting", &self.is_accepting())
            .field("activities", &self.inner.registry.len())
            .finish()
    }
}

struct NodeInner {
    me: Weak<NodeInner>,
    controller: ControllerConfig,
    info: RwLock<Option<ControllerInfo>>,
    settings: NodeSettings,
    collaborators: NodeCollaborators,
    metrics: Option<NodeMetrics>,
    registry: ActivityRegistry,
    sequencer: TransitionSequencer,
    watcher: Arc<ActivityWatcher<InstanceController>>,
    serializer: RwLock<Option<Arc<EventSerializer>>>,
    started: AtomicBool,
    accepting: AtomicBool,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ControllerNode {
    /// Build a stopped node. Nothing runs until [`ControllerNode::start`].
    pub fn new(
        controller: ControllerConfig,
        settings: NodeSettings,
        collaborators: NodeCollaborators,
        metrics: Option<NodeMetrics>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(4);
        let inner = Arc::new_cyclic(|me: &Weak<NodeInner>| {
            let watcher = Arc::new(ActivityWatcher::new());
            watcher.add_listener(Arc::new(NodeWatcherListener { node: me.clone() }));
            NodeInner {
                me: me.clone(),
                controller,
                info: RwLock::new(None),
                settings,
                collaborators,
                metrics,
                registry: ActivityRegistry::new(),
                sequencer: TransitionSequencer::new(),
                watcher,
                serializer: RwLock::new(None),
                started: AtomicBool::new(false),
                accepting: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }
        });
        Self { inner }
    }

    /// Bring the node up and rehydrate autostart activities.
    ///
    /// A node starts once; a second call fails with [`NodeError::AlreadyRunning`].
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(NodeError::AlreadyRunning);
        }

        let info = ControllerInfo::confirm(&inner.controller);
        *inner.info.write() = Some(info.clone());

        let serializer = Arc::new(EventSerializer::start(SERIALIZER_THREAD)?);
        *inner.serializer.write() = Some(serializer);

        let mut tasks = Vec::new();
        let beat_source = inner.me.clone();
        tasks.push((
            "heartbeat",
            spawn_heartbeat_task(
                inner.settings.heartbeat_interval,
                inner.shutdown.subscribe(),
                move |sequence| {
                    if let Some(node) = beat_source.upgrade() {
                        node.heartbeat(sequence);
                    }
                },
            ),
        ));
        tasks.push((
            "watcher",
            spawn_watcher_task(
                inner.watcher.clone(),
                inner.settings.watcher_interval,
                inner.shutdown.subscribe(),
            ),
        ));
        if let Some(period) = inner.settings.sampler_interval {
            tasks.push((
                "sampler",
                spawn_sampler_task(inner.me.clone(), period, inner.shutdown.subscribe()),
            ));
        }
        inner.tasks.lock().extend(tasks);
        inner.accepting.store(true, Ordering::Release);

        if let Err(err) = inner.collaborators.notifier.announce_startup(&info) {
            warn!(controller = %info.uuid, error = %format!("{err:#}"), "startup announcement failed");
        }
        info!(
            controller = %info.uuid,
            name = %info.name,
            heartbeat_ms = inner.settings.heartbeat_interval.as_millis() as u64,
            watcher_ms = inner.settings.watcher_interval.as_millis() as u64,
            "controller node started"
        );

        let node = inner.clone();
        task::spawn_blocking(move || node.autostart()).await??;
        Ok(())
    }

    /// Stop accepting commands, shut every activity down and stop the loops.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = self.inner.clone();
        if !inner.accepting.swap(false, Ordering::AcqRel) {
            debug!("controller node not running; nothing to shut down");
            return Ok(());
        }
        info!(activities = inner.registry.len(), "controller node shutting down");
        inner.sequencer.clear();
        for controller in inner.registry.snapshot() {
            controller.interrupt_waiters();
        }

        let node = inner.clone();
        let stopped = task::spawn_blocking(move || node.shutdown_all()).await;

        let _ = inner.shutdown.send(());
        let tasks: Vec<(&'static str, JoinHandle<()>)> = std::mem::take(&mut *inner.tasks.lock());
        for (name, task) in tasks {
            if let Err(err) = task.await {
                warn!(task = name, error = %err, "node task join error");
            }
        }

        let serializer = inner.serializer.read().clone();
        if let Some(serializer) = serializer {
            let timeout = inner.settings.flush_timeout;
            let flushed = task::spawn_blocking(move || {
                let flushed = serializer.flush(timeout);
                serializer.shutdown();
                flushed
            })
            .await?;
            if !flushed {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "pending events were not delivered before shutdown"
                );
            }
        }
        inner.serializer.write().take();
        inner.watcher.clear();

        stopped?;
        info!("controller node stopped");
        Ok(())
    }

    /// Start an activity.
    pub fn startup_activity(&self, uuid: &str) -> Result<()> {
        self.inner.accept("startup")?;
        self.inner.startup_now(uuid)
    }

    /// Activate an activity, starting it first when it is `READY`.
    pub fn activate_activity(&self, uuid: &str) -> Result<()> {
        self.inner.accept("activate")?;
        self.inner.activate_now(uuid)
    }

    pub fn deactivate_activity(&self, uuid: &str) -> Result<()> {
        self.inner.accept("deactivate")?;
        self.inner.deactivate_now(uuid)
    }

    pub fn shutdown_activity(&self, uuid: &str) -> Result<()> {
        self.inner.accept("shutdown")?;
        self.inner.shutdown_now(uuid)
    }

    /// Sample an activity and publish what was found.
    pub fn status_activity(&self, uuid: &str) -> Result<()> {
        self.inner.accept("status")?;
        self.inner.status_now(uuid)
    }

    pub fn configure_activity(&self, uuid: &str, update: &IndexMap<String, String>) -> Result<()> {
        self.inner.accept("configure")?;
        self.inner.configure_now(uuid, update)
    }

    /// Empty the temporary data directory. Refused while the activity runs.
    pub fn clean_activity_temp_data(&self, uuid: &str) -> Result<()> {
        self.inner.accept("clean_temp_data")?;
        self.inner.clean_now(uuid, DataKind::Temporary);
        Ok(())
    }

    /// Empty the permanent data directory. Refused while the activity runs.
    pub fn clean_activity_permanent_data(&self, uuid: &str) -> Result<()> {
        self.inner.accept("clean_permanent_data")?;
        self.inner.clean_now(uuid, DataKind::Permanent);
        Ok(())
    }

    /// Shut an activity down and forget it.
    pub fn remove_activity(&self, uuid: &str) -> Result<()> {
        self.inner.accept("remove")?;
        self.inner.remove_now(uuid)
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Identity confirmed at start.
    pub fn info(&self) -> Option<ControllerInfo> {
        self.inner.info.read().clone()
    }

    pub fn controller(&self, uuid: &str) -> Option<Arc<InstanceController>> {
        self.inner.registry.get(uuid)
    }

    /// Cached status of a registered activity.
    pub fn cached_status(&self, uuid: &str) -> Option<ActivityStatus> {
        self.inner
            .registry
            .get(uuid)
            .map(|controller| controller.get_cached_status())
    }

    /// UUIDs with an instance controller, in creation order.
    pub fn activities(&self) -> Vec<String> {
        self.inner.registry.uuids()
    }

    pub fn is_watching(&self, uuid: &str) -> bool {
        self.inner.watcher.is_watching(uuid)
    }

    pub fn has_sequence(&self, uuid: &str) -> bool {
        self.inner.sequencer.is_active(uuid)
    }

    /// Block until every event queued so far has been handled.
    pub fn flush(&self, timeout: Duration) -> bool {
        match self.inner.serializer() {
            Some(serializer) => serializer.flush(timeout),
            None => true,
        }
    }
}

impl NodeInner {
    fn accept(&self, command: &'static str) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            debug!(command, "command refused; node not running");
            return Err(NodeError::NodeStopped);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_command(command);
        }
        Ok(())
    }

    fn serializer(&self) -> Option<Arc<EventSerializer>> {
        self.serializer.read().clone()
    }

    fn autostart(&self) -> Result<()> {
        let activities = self
            .collaborators
            .repository
            .list_all()
            .map_err(NodeError::Collaborator)?;
        let mut started = 0usize;
        for activity in activities {
            let result = match activity.autostart {
                AutostartPolicy::None => continue,
                AutostartPolicy::Startup => self.startup_now(&activity.uuid),
                AutostartPolicy::Activate => self.activate_now(&activity.uuid),
            };
            if let Err(err) = result {
                warn!(activity = %activity.uuid, error = %err, "autostart abandoned");
                continue;
            }
            started += 1;
            debug!(activity = %activity.uuid, policy = ?activity.autostart, "autostart requested");
        }
        info!(activities = started, "autostart rehydration complete");
        Ok(())
    }

    fn shutdown_all(&self) {
        for controller in self.registry.snapshot() {
            if let Err(err) = self.shutdown_now(controller.uuid()) {
                warn!(activity = %controller.uuid(), error = %err, "activity left running at node shutdown");
            }
        }
    }

    fn startup_now(&self, uuid: &str) -> Result<()> {
        let Some(controller) = self.obtain_or_report(uuid, Some(ActivityState::StartupFailure))
        else {
            return Ok(());
        };
        let status = controller.get_cached_status();
        if status.state().is_running() {
            debug!(activity = %uuid, state = %status.state(), "startup requested for running activity");
            self.publish(uuid, status);
            return Ok(());
        }
        self.attempt(&controller, Transition::Startup, status.state())
    }

    fn activate_now(&self, uuid: &str) -> Result<()> {
        let Some(controller) = self.obtain_or_report(uuid, Some(ActivityState::ActivateFailure))
        else {
            return Ok(());
        };
        match controller.get_status() {
            Ok(status) => self.attempt(&controller, Transition::Activate, status.state()),
            Err(err) => self.lifecycle_failure(&controller, Transition::Activate, err),
        }
    }

    fn deactivate_now(&self, uuid: &str) -> Result<()> {
        match self.find_or_report(uuid, Some(ActivityState::DeactivateFailure)) {
            Some(Found::Controller(controller)) => {
                let state = controller.get_cached_status().state();
                self.attempt(&controller, Transition::Deactivate, state)
            }
            Some(Found::Installed(activity)) => {
                debug!(activity = %uuid, name = %activity.name, "deactivate requested for activity that never started");
                self.refuse(uuid, Transition::Deactivate, ActivityState::Ready);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn shutdown_now(&self, uuid: &str) -> Result<()> {
        if self.sequencer.abandon(uuid) {
            debug!(activity = %uuid, "shutdown cancels active transition sequence");
        }
        match self.find_or_report(uuid, Some(ActivityState::ShutdownFailure)) {
            Some(Found::Controller(controller)) => {
                let state = controller.get_cached_status().state();
                self.attempt(&controller, Transition::Shutdown, state)
            }
            Some(Found::Installed(activity)) => {
                debug!(activity = %uuid, name = %activity.name, "activity never started; reporting READY");
                self.publish(uuid, ActivityStatus::new(ActivityState::Ready));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn status_now(&self, uuid: &str) -> Result<()> {
        match self.find_or_report(uuid, Some(ActivityState::Unknown)) {
            Some(Found::Controller(controller)) => match controller.get_status() {
                Ok(status) => self.publish(uuid, status),
                Err(err @ LifecycleError::Interrupted { .. }) => return Err(err.into()),
                Err(err) => {
                    warn!(activity = %uuid, error = %err, "status unavailable");
                    let detail = err.to_string();
                    self.publish(
                        uuid,
                        ActivityStatus::failure(ActivityState::Unknown, detail, anyhow::Error::new(err)),
                    );
                }
            },
            Some(Found::Installed(activity)) => {
                debug!(activity = %uuid, name = %activity.name, "activity never started; reporting READY");
                self.publish(uuid, ActivityStatus::new(ActivityState::Ready));
            }
            None => {}
        }
        Ok(())
    }

    fn configure_now(&self, uuid: &str, update: &IndexMap<String, String>) -> Result<()> {
        let Some(controller) = self.obtain_or_report(uuid, None) else {
            return Ok(());
        };
        match controller.update_configuration(update) {
            Ok(()) => Ok(()),
            Err(err @ LifecycleError::Interrupted { .. }) => Err(err.into()),
            Err(err) => {
                error!(activity = %uuid, keys = update.len(), error = %format!("{err:#}"), "configuration update failed");
                Ok(())
            }
        }
    }

    fn clean_now(&self, uuid: &str, kind: DataKind) {
        let Some(found) = self.find_or_report(uuid, None) else {
            return;
        };
        if let Found::Controller(controller) = &found {
            let state = controller.get_cached_status().state();
            if state.is_running() {
                warn!(activity = %uuid, %state, "refusing to clean {kind} data of a running activity");
                return;
            }
        }
        let storage = &self.collaborators.storage;
        let result = match kind {
            DataKind::Temporary => storage.clean_temp_data(uuid),
            DataKind::Permanent => storage.clean_permanent_data(uuid),
        };
        match result {
            Ok(()) => info!(activity = %uuid, "cleaned {kind} data"),
            Err(err) => error!(activity = %uuid, error = %format!("{err:#}"), "failed to clean {kind} data"),
        }
    }

    fn remove_now(&self, uuid: &str) -> Result<()> {
        self.sequencer.abandon(uuid);
        if let Some(controller) = self.registry.get(uuid) {
            let state = controller.get_cached_status().state();
            self.attempt(&controller, Transition::Shutdown, state)?;
            let state = controller.get_cached_status().state();
            if state != ActivityState::Ready {
                warn!(activity = %uuid, %state, "removing activity that did not shut down cleanly");
            }
        }
        self.watcher.unwatch(uuid);
        if self.registry.remove(uuid).is_some() {
            info!(activity = %uuid, "activity removed from node");
            self.record_registry_size();
        }
        Ok(())
    }

    /// Registered controller for `uuid`, creating it from the repository on first use.
    fn obtain(&self, uuid: &str) -> anyhow::Result<Option<Arc<InstanceController>>> {
        if let Some(controller) = self.registry.get(uuid) {
            return Ok(Some(controller));
        }
        let Some(activity) = self.collaborators.repository.lookup(uuid)? else {
            return Ok(None);
        };
        let filesystem = self.collaborators.storage.filesystem_for(uuid)?;
        let configuration = self
            .collaborators
            .configuration
            .configuration_for(&activity, &filesystem)?;
        let controller = InstanceController::new(
            activity,
            filesystem,
            configuration,
            self.collaborators.factory.clone(),
            Arc::new(NodeStatusListener {
                node: self.me.clone(),
            }),
        )
        .with_lock_wait(self.settings.lock_wait);
        let (controller, inserted) = self.registry.insert_if_absent(Arc::new(controller));
        if inserted {
            debug!(activity = %uuid, "instance controller created");
            self.record_registry_size();
        }
        Ok(Some(controller))
    }

    fn obtain_or_report(
        &self,
        uuid: &str,
        failure: Option<ActivityState>,
    ) -> Option<Arc<InstanceController>> {
        match self.obtain(uuid) {
            Ok(Some(controller)) => Some(controller),
            Ok(None) => {
                self.report_missing(uuid);
                None
            }
            Err(err) => {
                self.report_collaborator_failure(uuid, failure, err);
                None
            }
        }
    }

    fn find_or_report(&self, uuid: &str, failure: Option<ActivityState>) -> Option<Found> {
        if let Some(controller) = self.registry.get(uuid) {
            return Some(Found::Controller(controller));
        }
        match self.collaborators.repository.lookup(uuid) {
            Ok(Some(activity)) => Some(Found::Installed(activity)),
            Ok(None) => {
                self.report_missing(uuid);
                None
            }
            Err(err) => {
                self.report_collaborator_failure(uuid, failure, err);
                None
            }
        }
    }

    fn report_missing(&self, uuid: &str) {
        warn!(activity = %uuid, "command for unknown activity");
        self.publish(
            uuid,
            ActivityStatus::with_detail(ActivityState::DoesntExist, MISSING_DETAIL),
        );
    }

    fn report_collaborator_failure(
        &self,
        uuid: &str,
        failure: Option<ActivityState>,
        err: anyhow::Error,
    ) {
        error!(activity = %uuid, error = %format!("{err:#}"), "could not prepare activity");
        if let Some(state) = failure {
            self.publish(
                uuid,
                ActivityStatus::failure(state, "could not prepare activity", err),
            );
        }
    }

    fn attempt(
        &self,
        controller: &Arc<InstanceController>,
        transition: Transition,
        state: ActivityState,
    ) -> Result<()> {
        let uuid = controller.uuid();
        match transition.attempt(state) {
            TransitionResult::Performed(TransitionPlan::Run(operation)) => {
                if transition == Transition::Startup {
                    self.watch(controller);
                }
                if let Err(err) = controller.perform(operation) {
                    return self.lifecycle_failure(controller, transition, err);
                }
            }
            TransitionResult::Performed(TransitionPlan::Sequence(steps)) => {
                self.watch(controller);
                self.sequencer.register(uuid, steps);
                return self.drive(controller, state);
            }
            TransitionResult::Noop => {
                debug!(activity = %uuid, %transition, %state, "transition already satisfied");
                self.publish(uuid, ActivityStatus::new(transition.expected_outcome()));
            }
            TransitionResult::Illegal => self.refuse(uuid, transition, state),
        }
        Ok(())
    }

    /// Feed `observed` to the sequencer and run whatever step it hands back.
    fn drive(&self, controller: &Arc<InstanceController>, observed: ActivityState) -> Result<()> {
        let uuid = controller.uuid();
        let mut observed = observed;
        loop {
            let Advance::Attempt(step) = self.sequencer.advance(uuid, observed) else {
                return Ok(());
            };
            let current = controller.get_cached_status().state();
            match step.attempt(current) {
                TransitionResult::Performed(TransitionPlan::Run(operation)) => {
                    debug!(activity = %uuid, %step, %operation, "running sequence step");
                    if let Err(err) = controller.perform(operation) {
                        self.sequencer.abandon(uuid);
                        return self.lifecycle_failure(controller, step, err);
                    }
                    return Ok(());
                }
                TransitionResult::Noop => {
                    debug!(activity = %uuid, %step, "sequence step already satisfied");
                    observed = step.expected_outcome();
                }
                TransitionResult::Performed(TransitionPlan::Sequence(_)) | TransitionResult::Illegal => {
                    self.refuse(uuid, step, current);
                    self.sequencer.abandon(uuid);
                    return Ok(());
                }
            }
        }
    }

    /// [`NodeInner::drive`] from the event serializer, where nobody awaits the result.
    fn advance(&self, controller: &Arc<InstanceController>, observed: ActivityState) {
        if let Err(err) = self.drive(controller, observed) {
            warn!(activity = %controller.uuid(), error = %err, "transition sequence step not run");
        }
    }

    fn refuse(&self, uuid: &str, transition: Transition, state: ActivityState) {
        let err = LifecycleError::IllegalTransition {
            uuid: uuid.to_owned(),
            transition,
            state,
        };
        warn!(activity = %uuid, %transition, %state, "{err}");
    }

    fn lifecycle_failure(
        &self,
        controller: &InstanceController,
        transition: Transition,
        err: LifecycleError,
    ) -> Result<()> {
        let uuid = controller.uuid();
        if let LifecycleError::Interrupted { .. } = err {
            warn!(activity = %uuid, %transition, error = %err, "lifecycle operation interrupted");
            return Err(err.into());
        }
        error!(activity = %uuid, %transition, error = %err, "lifecycle operation failed");
        let detail = err.to_string();
        self.publish(
            uuid,
            ActivityStatus::failure(transition.failure_state(), detail, anyhow::Error::new(err)),
        );
        Ok(())
    }

    fn watch(&self, controller: &Arc<InstanceController>) {
        if self.watcher.watch(controller.clone()) {
            debug!(activity = %controller.uuid(), "activity added to watcher");
        }
    }

    fn alert(&self, controller: &InstanceController) {
        if let Err(err) = self.collaborators.alerts.announce(controller) {
            debug!(activity = %controller.uuid(), error = %format!("{err:#}"), "alert could not be raised");
        }
    }

    /// Queue `task` on the event serializer.
    fn submit<F>(&self, what: &'static str, task: F)
    where
        F: FnOnce(&NodeInner) + Send + 'static,
    {
        let Some(serializer) = self.serializer() else {
            debug!(task = what, "event serializer not running; event dropped");
            return;
        };
        let node = self.me.clone();
        let queued = serializer.submit(move || {
            if let Some(node) = node.upgrade() {
                task(&node);
            }
        });
        if let Err(err) = queued {
            debug!(task = what, error = %err, "event dropped");
        }
    }

    /// Publish through the serializer so it stays ordered with status events.
    fn publish(&self, uuid: &str, status: ActivityStatus) {
        let on_worker = self
            .serializer()
            .map(|serializer| serializer.is_worker_thread())
            .unwrap_or(true);
        if on_worker {
            self.publish_now(uuid, &status);
            return;
        }
        let uuid = uuid.to_owned();
        self.submit("publish", move |node| node.publish_now(&uuid, &status));
    }

    fn publish_now(&self, uuid: &str, status: &ActivityStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_published(status.state().as_ref());
        }
        if let Err(err) = self.collaborators.notifier.publish_status(uuid, status) {
            warn!(activity = %uuid, state = %status.state(), error = %format!("{err:#}"), "status publication failed");
        }
    }

    fn handle_status_change(&self, uuid: &str, old: &ActivityStatus, new: &ActivityStatus) {
        let state = new.state();
        if state.is_failure() {
            error!(activity = %uuid, old = %old.state(), new = %new, "activity status changed");
        } else {
            info!(activity = %uuid, old = %old.state(), new = %new, "activity status changed");
        }

        let controller = self.registry.get(uuid);
        if let Some(controller) = &controller {
            if !old.state().is_running() && state.is_running() {
                self.watch(controller);
            }
        }
        self.publish_now(uuid, new);
        if let Some(controller) = &controller {
            self.advance(controller, state);
        }
    }

    /// Startup failed before the activity ever ran.
    fn handle_cant_start(&self, controller: &InstanceController) {
        let uuid = controller.uuid();
        warn!(activity = %uuid, "activity could not start; running startup failure handler");
        self.alert(controller);
        if let Err(err) = controller.handle_startup_failure() {
            warn!(activity = %uuid, error = %err, "startup failure handler did not run");
        }
        self.alert(controller);
        self.publish_now(uuid, &controller.get_cached_status());
    }

    fn heartbeat(&self, sequence: u64) {
        let Some(info) = self.info.read().clone() else {
            return;
        };
        let controllers = self.registry.snapshot();
        let running = controllers
            .iter()
            .filter(|controller| controller.get_cached_status().state().is_running())
            .count();
        let heartbeat = ControllerHeartbeat {
            controller_uuid: info.uuid,
            sequence,
            timestamp: Utc::now(),
            activities: controllers.len(),
            running,
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_heartbeat();
        }
        self.submit("heartbeat", move |node| {
            if let Err(err) = node.collaborators.notifier.publish_heartbeat(&heartbeat) {
                warn!(sequence = heartbeat.sequence, error = %format!("{err:#}"), "heartbeat publication failed");
            }
        });
    }

    fn record_registry_size(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_activities(self.registry.len());
        }
    }

    fn record_watcher_event(&self, kind: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_watcher_event(kind);
        }
    }
}

/// Forwards instance notifications onto the event serializer.
struct NodeStatusListener {
    node: Weak<NodeInner>,
}

impl ActivityStatusListener for NodeStatusListener {
    fn on_activity_status_change(&self, uuid: &str, old: &ActivityStatus, new: &ActivityStatus) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let (uuid, old, new) = (uuid.to_owned(), old.clone(), new.clone());
        node.submit("status-change", move |node| {
            node.handle_status_change(&uuid, &old, &new)
        });
    }
}

struct NodeWatcherListener {
    node: Weak<NodeInner>,
}

impl NodeWatcherListener {
    fn node(&self) -> anyhow::Result<Arc<NodeInner>> {
        self.node
            .upgrade()
            .ok_or_else(|| anyhow!("controller node is gone"))
    }
}

impl WatcherListener<InstanceController> for NodeWatcherListener {
    fn on_watcher_activity_status_change(
        &self,
        activity: &Arc<InstanceController>,
        _old: &ActivityStatus,
        new: &ActivityStatus,
    ) -> anyhow::Result<()> {
        let node = self.node()?;
        node.record_watcher_event("status_change");
        let controller = activity.clone();
        let state = new.state();
        node.submit("watcher-advance", move |node| node.advance(&controller, state));
        Ok(())
    }

    fn on_watcher_activity_error(
        &self,
        activity: &Arc<InstanceController>,
        old: &ActivityStatus,
        new: &ActivityStatus,
    ) -> anyhow::Result<()> {
        let node = self.node()?;
        node.record_watcher_event("error");
        let cant_start = new.state() == ActivityState::StartupFailure
            && matches!(
                old.state(),
                ActivityState::Ready | ActivityState::StartupAttempt
            );
        let controller = activity.clone();
        node.submit("watcher-error", move |node| {
            if cant_start {
                node.handle_cant_start(&controller);
            } else {
                node.alert(&controller);
            }
        });
        Ok(())
    }
}

/// Periodically sample running activities so crashes surface without a command.
fn spawn_sampler_task(
    node: Weak<NodeInner>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("sampler shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(inner) = node.upgrade() else {
                        break;
                    };
                    let running: Vec<Arc<InstanceController>> = inner
                        .registry
                        .snapshot()
                        .into_iter()
                        .filter(|controller| controller.get_cached_status().state().is_running())
                        .collect();
                    drop(inner);

                    let samples = running.into_iter().map(|controller| {
                        task::spawn_blocking(move || {
                            let sampled = controller.get_status();
                            (controller, sampled)
                        })
                    });
                    for joined in join_all(samples).await {
                        match joined {
                            Ok((controller, Err(err))) => {
                                debug!(activity = %controller.uuid(), error = %err, "sampling skipped");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "sampling task join error"),
                        }
                    }
                }
            }
        }
    })
}
