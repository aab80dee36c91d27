//! ---
//! actrl_section: "02-lifecycle"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Per-activity instance controller and its exclusive lock."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
//! The instance controller owns one managed activity.
//!
//! Every operation that touches the instance first takes the activity lock.
//! The lock records which operation holds it and on which thread, so a hook
//! that calls back into its own controller is refused with
//! [`LifecycleError::NestedLock`] instead of deadlocking. Waiters poll in
//! short slices, warn every `lock_wait`, and can be released early with
//! [`InstanceController::interrupt_waiters`].
//!
//! Failures raised by lifecycle hooks are converted into a failure
//! [`ActivityStatus`] and delivered through the normal listener path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use strum::Display;
use tracing::{debug, error, info, warn};

use crate::activity::{
    ActivityConfiguration, ActivityContext, ActivityFactory, ActivityFilesystem,
    ActivityStatusListener, InstalledActivity, ManagedActivity, StatusListener,
    CONFIG_DATA_DIR, CONFIG_INSTALL_DIR, CONFIG_LOG_DIR, CONFIG_TMP_DIR,
};
use crate::error::{LifecycleError, Result};
use crate::state::{ActivityState, ActivityStatus};
use crate::transition::{Operation, Transition};
use crate::watcher::WatchedActivity;

/// Default interval between "still waiting" warnings for the activity lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(20);

const LOCK_POLL: Duration = Duration::from_millis(50);

/// Operation currently holding an activity lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LockState {
    /// Lock is free.
    Neutral,
    /// Configuration update.
    Configure,
    /// Startup, including recovery restarts.
    Startup,
    /// Activation.
    Activate,
    /// Deactivation.
    Deactivate,
    /// Status sampling or override.
    Status,
    /// Shutdown.
    Shutdown,
    /// Startup failure cleanup.
    Recover,
}

#[derive(Debug, Clone, Copy)]
struct LockHolder {
    operation: LockState,
    thread: ThreadId,
    since: Instant,
}

struct Slot {
    instance: Option<Box<dyn ManagedActivity>>,
    configuration: Box<dyn ActivityConfiguration>,
}

struct SlotGuard<'a> {
    controller: &'a InstanceController,
    slot: MutexGuard<'a, Slot>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.controller.holder.lock().take();
    }
}

/// Refreshes the cached status and forwards instance notifications.
struct StatusForwarder {
    uuid: String,
    cache: Arc<RwLock<ActivityStatus>>,
    listener: Arc<dyn ActivityStatusListener>,
}

impl StatusListener for StatusForwarder {
    fn on_status_change(&self, old: &ActivityStatus, new: &ActivityStatus) {
        *self.cache.write() = new.clone();
        self.listener
            .on_activity_status_change(&self.uuid, old, new);
    }
}

/// Wrapper around one managed activity instance.
pub struct InstanceController {
    activity: InstalledActivity,
    filesystem: ActivityFilesystem,
    factory: Arc<dyn ActivityFactory>,
    listener: Arc<dyn ActivityStatusListener>,
    slot: Mutex<Slot>,
    holder: Mutex<Option<LockHolder>>,
    status: Arc<RwLock<ActivityStatus>>,
    interrupts: AtomicU64,
    lock_wait: Duration,
}

impl fmt::Debug for InstanceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceController")
            .field("uuid", &self.activity.uuid)
            .field("status", &self.status.read().state())
            .field("holder", &self.lock_holder())
            .finish()
    }
}

impl InstanceController {
    /// Create a controller with no instance and a `READY` cached status.
    pub fn new(
        activity: InstalledActivity,
        filesystem: ActivityFilesystem,
        configuration: Box<dyn ActivityConfiguration>,
        factory: Arc<dyn ActivityFactory>,
        listener: Arc<dyn ActivityStatusListener>,
    ) -> Self {
        Self {
            activity,
            filesystem,
            factory,
            listener,
            slot: Mutex::new(Slot {
                instance: None,
                configuration,
            }),
            holder: Mutex::new(None),
            status: Arc::new(RwLock::new(ActivityStatus::default())),
            interrupts: AtomicU64::new(0),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Override the interval between lock wait warnings.
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Activity identifier.
    pub fn uuid(&self) -> &str {
        &self.activity.uuid
    }

    /// Installed record backing this controller.
    pub fn activity(&self) -> &InstalledActivity {
        &self.activity
    }

    /// Activity directories.
    pub fn filesystem(&self) -> &ActivityFilesystem {
        &self.filesystem
    }

    /// Last known status. Never blocks on the activity lock.
    pub fn get_cached_status(&self) -> ActivityStatus {
        self.status.read().clone()
    }

    /// Operation holding the activity lock, if any.
    pub fn lock_holder(&self) -> Option<LockState> {
        self.holder.lock().map(|holder| holder.operation)
    }

    /// Create and start a new instance.
    ///
    /// Failures are reported as a `STARTUP_FAILURE` status; only an existing
    /// instance or a lock problem is returned as an error.
    pub fn startup(&self) -> Result<()> {
        let mut guard = self.acquire(LockState::Startup)?;
        let slot = &mut *guard.slot;
        if slot.instance.is_some() {
            return Err(LifecycleError::AlreadyStarted {
                uuid: self.uuid().to_owned(),
            });
        }
        self.startup_locked(slot);
        Ok(())
    }

    /// Shut down and discard the instance.
    ///
    /// Without an instance only the cached state is settled on `READY`.
    pub fn shutdown(&self) -> Result<()> {
        let mut guard = self.acquire(LockState::Shutdown)?;
        self.shutdown_locked(&mut guard.slot);
        Ok(())
    }

    /// Activate the running instance.
    pub fn activate(&self) -> Result<()> {
        let mut guard = self.acquire(LockState::Activate)?;
        self.run_hook(&mut guard.slot, Transition::Activate, |instance| {
            instance.activate()
        })
    }

    /// Deactivate the active instance.
    pub fn deactivate(&self) -> Result<()> {
        let mut guard = self.acquire(LockState::Deactivate)?;
        self.run_hook(&mut guard.slot, Transition::Deactivate, |instance| {
            instance.deactivate()
        })
    }

    /// Sample the instance and refresh the cache.
    ///
    /// A failing health check marks the activity `CRASHED`.
    pub fn get_status(&self) -> Result<ActivityStatus> {
        let mut guard = self.acquire(LockState::Status)?;
        let slot = &mut *guard.slot;
        let sampled = slot
            .instance
            .as_mut()
            .map(|instance| instance.check_health().map(|()| instance.status()));
        match sampled {
            None => {}
            Some(Ok(status)) => *self.status.write() = status,
            Some(Err(err)) => {
                if self.status.read().state() != ActivityState::Crashed {
                    warn!(activity = %self.uuid(), error = %format!("{err:#}"), "activity health check failed");
                    self.set_status_locked(
                        slot,
                        ActivityStatus::failure(ActivityState::Crashed, "health check failed", err),
                    );
                }
            }
        }
        Ok(self.get_cached_status())
    }

    /// Administrative status override.
    pub fn set_status(&self, status: ActivityStatus) -> Result<()> {
        let mut guard = self.acquire(LockState::Status)?;
        self.set_status_locked(&mut guard.slot, status);
        Ok(())
    }

    /// Apply a configuration update and forward it to a running instance.
    pub fn update_configuration(&self, update: &IndexMap<String, String>) -> Result<()> {
        let mut guard = self.acquire(LockState::Configure)?;
        let slot = &mut *guard.slot;
        slot.configuration.update(update)?;
        if let Some(instance) = slot.instance.as_mut() {
            instance.update_configuration(update)?;
        }
        info!(activity = %self.uuid(), keys = update.len(), "activity configuration updated");
        Ok(())
    }

    /// Copy of the current configuration values.
    pub fn configuration(&self) -> Result<IndexMap<String, String>> {
        let guard = self.acquire(LockState::Configure)?;
        Ok(guard.slot.configuration.snapshot())
    }

    /// Run the instance's cleanup hook after a failed startup.
    pub fn handle_startup_failure(&self) -> Result<()> {
        let mut guard = self.acquire(LockState::Recover)?;
        if let Some(instance) = guard.slot.instance.as_mut() {
            if let Err(err) = instance.handle_startup_failure() {
                warn!(activity = %self.uuid(), error = %format!("{err:#}"), "startup failure cleanup failed");
            }
        }
        Ok(())
    }

    /// Run the operation selected by the transition model.
    pub fn perform(&self, operation: Operation) -> Result<()> {
        debug!(activity = %self.uuid(), %operation, "performing operation");
        match operation {
            Operation::Startup => self.startup(),
            Operation::RecoverThenStartup => self.recover_then_startup(),
            Operation::Activate => self.activate(),
            Operation::Deactivate => self.deactivate(),
            Operation::Shutdown => self.shutdown(),
        }
    }

    /// Release every thread currently waiting for the activity lock.
    ///
    /// Waiters fail with [`LifecycleError::Interrupted`]; the holder is not affected.
    pub fn interrupt_waiters(&self) {
        self.interrupts.fetch_add(1, Ordering::AcqRel);
    }

    fn recover_then_startup(&self) -> Result<()> {
        let mut guard = self.acquire(LockState::Startup)?;
        let slot = &mut *guard.slot;
        self.shutdown_locked(slot);
        if slot.instance.is_some() {
            let failed = self
                .status
                .read()
                .with_state(ActivityState::StartupFailure, "recovery shutdown failed");
            warn!(activity = %self.uuid(), "previous instance did not shut down; not restarting");
            self.set_status_locked(slot, failed);
            return Ok(());
        }
        self.startup_locked(slot);
        Ok(())
    }

    fn startup_locked(&self, slot: &mut Slot) {
        info!(activity = %self.uuid(), name = %self.activity.name, "starting activity");
        let mut instance = match self.instantiate(slot) {
            Ok(instance) => instance,
            Err(err) => {
                error!(activity = %self.uuid(), error = %format!("{err:#}"), "activity could not be created");
                self.set_status_locked(
                    slot,
                    ActivityStatus::failure(
                        ActivityState::StartupFailure,
                        "activity could not be created",
                        err,
                    ),
                );
                return;
            }
        };
        let result = instance.startup();
        slot.instance = Some(instance);
        match result {
            Ok(()) => self.refresh_cache(slot),
            Err(err) => {
                error!(activity = %self.uuid(), error = %format!("{err:#}"), "activity startup failed");
                self.set_status_locked(
                    slot,
                    ActivityStatus::failure(ActivityState::StartupFailure, "startup failed", err),
                );
            }
        }
    }

    fn instantiate(&self, slot: &mut Slot) -> anyhow::Result<Box<dyn ManagedActivity>> {
        slot.configuration.load()?;
        for (key, dir) in [
            (CONFIG_INSTALL_DIR, &self.filesystem.install_dir),
            (CONFIG_LOG_DIR, &self.filesystem.log_dir),
            (CONFIG_DATA_DIR, &self.filesystem.permanent_data_dir),
            (CONFIG_TMP_DIR, &self.filesystem.temp_data_dir),
        ] {
            slot.configuration
                .set_value(key, dir.display().to_string());
        }
        let context = ActivityContext {
            activity: self.activity.clone(),
            filesystem: self.filesystem.clone(),
            configuration: slot.configuration.snapshot(),
        };
        let mut instance = self.factory.create(&context)?;
        instance.register_status_listener(Arc::new(StatusForwarder {
            uuid: self.uuid().to_owned(),
            cache: self.status.clone(),
            listener: self.listener.clone(),
        }));
        Ok(instance)
    }

    fn shutdown_locked(&self, slot: &mut Slot) {
        let Some(instance) = slot.instance.as_mut() else {
            let state = self.status.read().state();
            debug!(activity = %self.uuid(), %state, "shutdown requested without an instance");
            if state != ActivityState::Ready {
                self.set_status_locked(slot, ActivityStatus::new(ActivityState::Ready));
            }
            return;
        };
        info!(activity = %self.uuid(), "shutting down activity");
        let result = instance.shutdown().map(|()| instance.status());
        match result {
            Ok(last) => {
                slot.instance = None;
                if last.state() == ActivityState::Ready {
                    *self.status.write() = last;
                } else {
                    self.set_status_locked(slot, ActivityStatus::new(ActivityState::Ready));
                }
            }
            Err(err) => {
                error!(activity = %self.uuid(), error = %format!("{err:#}"), "activity shutdown failed");
                self.set_status_locked(
                    slot,
                    ActivityStatus::failure(ActivityState::ShutdownFailure, "shutdown failed", err),
                );
            }
        }
    }

    fn run_hook<F>(&self, slot: &mut Slot, transition: Transition, hook: F) -> Result<()>
    where
        F: FnOnce(&mut dyn ManagedActivity) -> anyhow::Result<()>,
    {
        let Some(instance) = slot.instance.as_mut() else {
            return Err(LifecycleError::NotStarted {
                uuid: self.uuid().to_owned(),
            });
        };
        match hook(&mut **instance) {
            Ok(()) => self.refresh_cache(slot),
            Err(err) => {
                error!(activity = %self.uuid(), %transition, error = %format!("{err:#}"), "activity hook failed");
                self.set_status_locked(
                    slot,
                    ActivityStatus::failure(
                        transition.failure_state(),
                        format!("{transition} failed"),
                        err,
                    ),
                );
            }
        }
        Ok(())
    }

    fn refresh_cache(&self, slot: &Slot) {
        if let Some(instance) = slot.instance.as_ref() {
            *self.status.write() = instance.status();
        }
    }

    /// Update the cache, then route the status through the instance so its
    /// listeners fire, or straight to the consumer when there is no instance.
    fn set_status_locked(&self, slot: &mut Slot, status: ActivityStatus) {
        let old = std::mem::replace(&mut *self.status.write(), status.clone());
        match slot.instance.as_mut() {
            Some(instance) => instance.set_status(status),
            None => self
                .listener
                .on_activity_status_change(self.uuid(), &old, &status),
        }
    }

    fn acquire(&self, operation: LockState) -> Result<SlotGuard<'_>> {
        let current = thread::current().id();
        let held = *self.holder.lock();
        if let Some(holder) = held {
            if holder.thread == current {
                error!(
                    activity = %self.uuid(),
                    requested = %operation,
                    held = %holder.operation,
                    "nested activity lock acquisition refused"
                );
                return Err(LifecycleError::NestedLock {
                    uuid: self.uuid().to_owned(),
                    held: holder.operation,
                });
            }
        }

        let generation = self.interrupts.load(Ordering::Acquire);
        let started = Instant::now();
        let mut next_warning = self.lock_wait;
        loop {
            if let Some(slot) = self.slot.try_lock_for(LOCK_POLL) {
                *self.holder.lock() = Some(LockHolder {
                    operation,
                    thread: current,
                    since: Instant::now(),
                });
                return Ok(SlotGuard {
                    controller: self,
                    slot,
                });
            }
            if self.interrupts.load(Ordering::Acquire) != generation {
                warn!(activity = %self.uuid(), requested = %operation, "interrupted while waiting for activity lock");
                return Err(LifecycleError::Interrupted {
                    uuid: self.uuid().to_owned(),
                    operation,
                });
            }
            let waited = started.elapsed();
            if waited >= next_warning {
                let holder = *self.holder.lock();
                let (held, held_ms) = holder
                    .map(|h| (h.operation, h.since.elapsed().as_millis() as u64))
                    .unwrap_or((LockState::Neutral, 0));
                warn!(
                    activity = %self.uuid(),
                    requested = %operation,
                    %held,
                    held_ms,
                    waited_ms = waited.as_millis() as u64,
                    "still waiting for activity lock"
                );
                next_warning += self.lock_wait;
            }
        }
    }
}

impl WatchedActivity for InstanceController {
    fn uuid(&self) -> &str {
        &self.activity.uuid
    }

    fn sample(&self) -> anyhow::Result<ActivityStatus> {
        Ok(self.get_cached_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::MemoryConfiguration;
    use crate::transition::TransitionResult;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Weak;
    use strum::IntoEnumIterator;

    #[derive(Default)]
    struct Plan {
        fail_startup: bool,
        fail_shutdown: bool,
        fail_health: bool,
        hook_delay: Duration,
    }

    #[derive(Default)]
    struct Shared {
        plan: Mutex<Plan>,
        calls: Mutex<Vec<&'static str>>,
        contexts: Mutex<Vec<ActivityContext>>,
        created: AtomicUsize,
        in_hook: AtomicUsize,
        overlapped: AtomicBool,
        reenter: Mutex<Option<Weak<InstanceController>>>,
        reentry_result: Mutex<Option<Result<ActivityStatus>>>,
    }

    struct TestActivity {
        shared: Arc<Shared>,
        status: ActivityStatus,
        listeners: Vec<Arc<dyn StatusListener>>,
    }

    impl TestActivity {
        fn enter(&self, name: &'static str) {
            if self.shared.in_hook.fetch_add(1, Ordering::SeqCst) > 0 {
                self.shared.overlapped.store(true, Ordering::SeqCst);
            }
            self.shared.calls.lock().push(name);
            let delay = self.shared.plan.lock().hook_delay;
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }

        fn leave(&self) {
            self.shared.in_hook.fetch_sub(1, Ordering::SeqCst);
        }

        fn change(&mut self, state: ActivityState) {
            self.set_status(ActivityStatus::new(state));
        }
    }

    impl ManagedActivity for TestActivity {
        fn startup(&mut self) -> anyhow::Result<()> {
            self.enter("startup");
            let reenter = self.shared.reenter.lock().clone();
            if let Some(controller) = reenter.and_then(|weak| weak.upgrade()) {
                *self.shared.reentry_result.lock() = Some(controller.get_status());
            }
            let fail = self.shared.plan.lock().fail_startup;
            self.leave();
            if fail {
                return Err(anyhow!("boom"));
            }
            self.change(ActivityState::Running);
            Ok(())
        }

        fn shutdown(&mut self) -> anyhow::Result<()> {
            self.enter("shutdown");
            let fail = self.shared.plan.lock().fail_shutdown;
            self.leave();
            if fail {
                return Err(anyhow!("stuck"));
            }
            self.change(ActivityState::Ready);
            Ok(())
        }

        fn activate(&mut self) -> anyhow::Result<()> {
            self.enter("activate");
            self.leave();
            self.change(ActivityState::Active);
            Ok(())
        }

        fn deactivate(&mut self) -> anyhow::Result<()> {
            self.enter("deactivate");
            self.leave();
            self.change(ActivityState::Running);
            Ok(())
        }

        fn check_health(&mut self) -> anyhow::Result<()> {
            self.enter("check_health");
            let fail = self.shared.plan.lock().fail_health;
            self.leave();
            if fail {
                Err(anyhow!("process exited"))
            } else {
                Ok(())
            }
        }

        fn status(&self) -> ActivityStatus {
            self.status.clone()
        }

        fn set_status(&mut self, status: ActivityStatus) {
            let old = std::mem::replace(&mut self.status, status.clone());
            for listener in &self.listeners {
                listener.on_status_change(&old, &status);
            }
        }

        fn update_configuration(
            &mut self,
            _update: &IndexMap<String, String>,
        ) -> anyhow::Result<()> {
            self.shared.calls.lock().push("update_configuration");
            Ok(())
        }

        fn register_status_listener(&mut self, listener: Arc<dyn StatusListener>) {
            self.listeners.push(listener);
        }

        fn handle_startup_failure(&mut self) -> anyhow::Result<()> {
            self.shared.calls.lock().push("handle_startup_failure");
            Ok(())
        }
    }

    struct TestFactory {
        shared: Arc<Shared>,
    }

    impl ActivityFactory for TestFactory {
        fn create(&self, context: &ActivityContext) -> anyhow::Result<Box<dyn ManagedActivity>> {
            self.shared.created.fetch_add(1, Ordering::SeqCst);
            self.shared.contexts.lock().push(context.clone());
            Ok(Box::new(TestActivity {
                shared: self.shared.clone(),
                status: ActivityStatus::default(),
                listeners: Vec::new(),
            }))
        }
    }

    type Events = Arc<Mutex<Vec<ActivityState>>>;

    fn controller(shared: &Arc<Shared>) -> (Arc<InstanceController>, Events) {
        let events: Events = Arc::default();
        let sink = events.clone();
        let listener = move |_uuid: &str, _old: &ActivityStatus, new: &ActivityStatus| {
            sink.lock().push(new.state());
        };
        let controller = InstanceController::new(
            InstalledActivity::new("u1", "demo"),
            ActivityFilesystem::under("/srv/activities/u1"),
            Box::new(MemoryConfiguration::default()),
            Arc::new(TestFactory {
                shared: shared.clone(),
            }),
            Arc::new(listener),
        );
        (Arc::new(controller), events)
    }

    #[test]
    fn startup_and_shutdown_follow_instance_notifications() {
        let shared = Arc::new(Shared::default());
        let (controller, events) = controller(&shared);

        controller.startup().expect("startup");
        assert_eq!(controller.get_cached_status().state(), ActivityState::Running);

        controller.shutdown().expect("shutdown");
        controller.shutdown().expect("second shutdown is a no-op");
        assert_eq!(controller.get_cached_status().state(), ActivityState::Ready);
        assert_eq!(
            *events.lock(),
            vec![ActivityState::Running, ActivityState::Ready]
        );
        assert_eq!(*shared.calls.lock(), vec!["startup", "shutdown"]);
    }

    #[test]
    fn shutdown_without_instance_settles_on_ready_from_every_state() {
        for state in ActivityState::iter() {
            let shared = Arc::new(Shared::default());
            let (controller, events) = controller(&shared);
            controller
                .set_status(ActivityStatus::new(state))
                .expect("seed state");
            events.lock().clear();

            controller.shutdown().expect("shutdown");
            controller.shutdown().expect("repeated shutdown");

            assert_eq!(
                controller.get_cached_status().state(),
                ActivityState::Ready,
                "from {state}"
            );
            let expected = if state == ActivityState::Ready {
                vec![]
            } else {
                vec![ActivityState::Ready]
            };
            assert_eq!(*events.lock(), expected, "from {state}");
            assert!(shared.calls.lock().is_empty(), "from {state}");
            assert_eq!(
                Transition::Shutdown.attempt(controller.get_cached_status().state()),
                TransitionResult::Noop
            );
        }
    }

    #[test]
    fn startup_passes_directories_through_configuration() {
        let shared = Arc::new(Shared::default());
        let (controller, _events) = controller(&shared);
        controller.startup().expect("startup");

        let contexts = shared.contexts.lock();
        let configuration = &contexts[0].configuration;
        assert_eq!(
            configuration.get(CONFIG_TMP_DIR).map(String::as_str),
            Some("/srv/activities/u1/tmp")
        );
        assert_eq!(
            configuration.get(CONFIG_INSTALL_DIR).map(String::as_str),
            Some("/srv/activities/u1/install")
        );
    }

    #[test]
    fn preconditions_are_reported_as_errors() {
        let shared = Arc::new(Shared::default());
        let (controller, _events) = controller(&shared);

        let err = controller.activate().expect_err("no instance yet");
        assert!(matches!(err, LifecycleError::NotStarted { .. }));

        controller.startup().expect("startup");
        let err = controller.startup().expect_err("already started");
        assert!(matches!(err, LifecycleError::AlreadyStarted { .. }));
        assert_eq!(shared.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_startup_becomes_status_and_recovery_restarts() {
        let shared = Arc::new(Shared::default());
        shared.plan.lock().fail_startup = true;
        let (controller, events) = controller(&shared);

        controller.startup().expect("hook errors are not returned");
        let status = controller.get_cached_status();
        assert_eq!(status.state(), ActivityState::StartupFailure);
        assert_eq!(status.cause().map(|c| c.to_string()).as_deref(), Some("boom"));

        shared.plan.lock().fail_startup = false;
        controller
            .perform(Operation::RecoverThenStartup)
            .expect("recovery");
        assert_eq!(controller.get_cached_status().state(), ActivityState::Running);
        assert_eq!(shared.created.load(Ordering::SeqCst), 2);
        assert_eq!(
            *events.lock(),
            vec![
                ActivityState::StartupFailure,
                ActivityState::Ready,
                ActivityState::Running
            ]
        );
    }

    #[test]
    fn recovery_stops_when_leftover_instance_will_not_shut_down() {
        let shared = Arc::new(Shared::default());
        {
            let mut plan = shared.plan.lock();
            plan.fail_startup = true;
            plan.fail_shutdown = true;
        }
        let (controller, _events) = controller(&shared);
        controller.startup().expect("startup");

        controller
            .perform(Operation::RecoverThenStartup)
            .expect("recovery");
        let status = controller.get_cached_status();
        assert_eq!(status.state(), ActivityState::StartupFailure);
        assert_eq!(status.detail(), Some("recovery shutdown failed"));
        assert_eq!(status.cause().map(|c| c.to_string()).as_deref(), Some("stuck"));
        assert_eq!(shared.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_health_check_reports_crash_once() {
        let shared = Arc::new(Shared::default());
        let (controller, events) = controller(&shared);
        controller.startup().expect("startup");
        shared.plan.lock().fail_health = true;

        let status = controller.get_status().expect("status");
        assert_eq!(status.state(), ActivityState::Crashed);
        controller.get_status().expect("status");
        let crashes = events
            .lock()
            .iter()
            .filter(|state| **state == ActivityState::Crashed)
            .count();
        assert_eq!(crashes, 1);
    }

    #[test]
    fn set_status_without_instance_notifies_directly() {
        let shared = Arc::new(Shared::default());
        let (controller, events) = controller(&shared);
        controller
            .set_status(ActivityStatus::new(ActivityState::Unknown))
            .expect("set status");
        assert_eq!(*events.lock(), vec![ActivityState::Unknown]);
        assert_eq!(controller.get_cached_status().state(), ActivityState::Unknown);
    }

    #[test]
    fn configuration_updates_reach_running_instance() {
        let shared = Arc::new(Shared::default());
        let (controller, _events) = controller(&shared);
        controller.startup().expect("startup");

        let mut update = IndexMap::new();
        update.insert("color".to_owned(), "blue".to_owned());
        controller.update_configuration(&update).expect("update");

        assert!(shared.calls.lock().contains(&"update_configuration"));
        let configuration = controller.configuration().expect("snapshot");
        assert_eq!(configuration.get("color").map(String::as_str), Some("blue"));
    }

    #[test]
    fn concurrent_operations_never_overlap() {
        let shared = Arc::new(Shared::default());
        shared.plan.lock().hook_delay = Duration::from_millis(5);
        let (controller, _events) = controller(&shared);
        controller.startup().expect("startup");

        thread::scope(|scope| {
            for worker in 0..6 {
                let controller = controller.clone();
                scope.spawn(move || {
                    for _ in 0..5 {
                        if worker % 2 == 0 {
                            controller.get_status().expect("status");
                        } else {
                            controller.activate().expect("activate");
                        }
                    }
                });
            }
        });

        assert!(!shared.overlapped.load(Ordering::SeqCst));
        assert_eq!(controller.lock_holder(), None);
    }

    #[test]
    fn reentrant_acquisition_is_refused_and_lock_released() {
        let shared = Arc::new(Shared::default());
        let (controller, _events) = controller(&shared);
        *shared.reenter.lock() = Some(Arc::downgrade(&controller));

        controller.startup().expect("outer startup completes");

        let nested = shared.reentry_result.lock().take().expect("hook re-entered");
        assert!(matches!(
            nested,
            Err(LifecycleError::NestedLock {
                held: LockState::Startup,
                ..
            })
        ));
        assert_eq!(controller.get_cached_status().state(), ActivityState::Running);
        assert_eq!(
            controller.get_status().expect("lock released").state(),
            ActivityState::Running
        );
    }

    #[test]
    fn interrupted_waiters_give_up() {
        let shared = Arc::new(Shared::default());
        shared.plan.lock().hook_delay = Duration::from_millis(400);
        let (controller, _events) = controller(&shared);

        thread::scope(|scope| {
            let holder = controller.clone();
            scope.spawn(move || holder.startup().expect("startup"));
            thread::sleep(Duration::from_millis(100));

            let waiter = controller.clone();
            let waiting = scope.spawn(move || waiter.get_status());
            thread::sleep(Duration::from_millis(100));
            controller.interrupt_waiters();

            let result = waiting.join().expect("waiter joins");
            assert!(matches!(
                result,
                Err(LifecycleError::Interrupted {
                    operation: LockState::Status,
                    ..
                })
            ));
        });
        assert_eq!(controller.get_cached_status().state(), ActivityState::Running);
    }
}
