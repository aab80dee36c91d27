//! ---
//! actrl_section: "02-lifecycle"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Periodic health watcher raising status change and failure events."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::state::ActivityStatus;

/// Something the watcher can sample.
pub trait WatchedActivity: Send + Sync {
    /// Activity identifier.
    fn uuid(&self) -> &str;

    /// Last known status. Must not block on lifecycle operations.
    fn sample(&self) -> anyhow::Result<ActivityStatus>;
}

/// Receives watcher events.
pub trait WatcherListener<A>: Send + Sync {
    /// The activity moved to a non-failure state.
    fn on_watcher_activity_status_change(
        &self,
        activity: &Arc<A>,
        old: &ActivityStatus,
        new: &ActivityStatus,
    ) -> anyhow::Result<()>;

    /// The activity moved to a failure state.
    fn on_watcher_activity_error(
        &self,
        activity: &Arc<A>,
        old: &ActivityStatus,
        new: &ActivityStatus,
    ) -> anyhow::Result<()>;
}

struct Watched<A> {
    activity: Arc<A>,
    last_seen: ActivityStatus,
}

/// Samples watched activities and reports state changes.
pub struct ActivityWatcher<A> {
    watched: Mutex<IndexMap<String, Watched<A>>>,
    listeners: RwLock<Vec<Arc<dyn WatcherListener<A>>>>,
}

impl<A: WatchedActivity> Default for ActivityWatcher<A> {
    fn default() -> Self {
        Self {
            watched: Mutex::new(IndexMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<A: WatchedActivity> ActivityWatcher<A> {
    /// Watcher with nothing to watch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for future events.
    pub fn add_listener(&self, listener: Arc<dyn WatcherListener<A>>) {
        self.listeners.write().push(listener);
    }

    /// Start watching `activity`, taking its current status as the baseline.
    ///
    /// Returns `false` when it was already watched; the baseline is kept.
    pub fn watch(&self, activity: Arc<A>) -> bool {
        let uuid = activity.uuid().to_owned();
        let mut watched = self.watched.lock();
        if watched.contains_key(&uuid) {
            return false;
        }
        let last_seen = activity.sample().unwrap_or_else(|err| {
            warn!(activity = %uuid, error = %format!("{err:#}"), "could not sample baseline status");
            ActivityStatus::new(crate::state::ActivityState::Unknown)
        });
        debug!(activity = %uuid, baseline = %last_seen.state(), "watching activity");
        watched.insert(
            uuid,
            Watched {
                activity,
                last_seen,
            },
        );
        true
    }

    /// Stop watching `uuid`.
    pub fn unwatch(&self, uuid: &str) -> bool {
        self.watched.lock().shift_remove(uuid).is_some()
    }

    /// Whether `uuid` is watched.
    pub fn is_watching(&self, uuid: &str) -> bool {
        self.watched.lock().contains_key(uuid)
    }

    /// Number of watched activities.
    pub fn len(&self) -> usize {
        self.watched.lock().len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.watched.lock().is_empty()
    }

    /// Stop watching everything.
    pub fn clear(&self) {
        self.watched.lock().clear();
    }

    /// Sample every watched activity once and dispatch events for changes.
    ///
    /// Returns the number of changes observed.
    pub fn scan(&self) -> usize {
        let snapshot: Vec<(String, Arc<A>, ActivityStatus)> = self
            .watched
            .lock()
            .iter()
            .map(|(uuid, entry)| (uuid.clone(), entry.activity.clone(), entry.last_seen.clone()))
            .collect();
        let listeners = self.listeners.read().clone();

        let mut changes = 0;
        for (uuid, activity, previous) in snapshot {
            let current = match activity.sample() {
                Ok(status) => status,
                Err(err) => {
                    warn!(activity = %uuid, error = %format!("{err:#}"), "could not sample activity status");
                    continue;
                }
            };
            if current.state() == previous.state() {
                continue;
            }
            match self.watched.lock().get_mut(&uuid) {
                Some(entry) => entry.last_seen = current.clone(),
                None => continue,
            }
            changes += 1;
            trace!(activity = %uuid, old = %previous.state(), new = %current.state(), "watcher observed change");

            for listener in &listeners {
                let result = if current.state().is_failure() {
                    listener.on_watcher_activity_error(&activity, &previous, &current)
                } else {
                    listener.on_watcher_activity_status_change(&activity, &previous, &current)
                };
                if let Err(err) = result {
                    warn!(activity = %uuid, error = %format!("{err:#}"), "watcher listener failed");
                }
            }
        }
        changes
    }
}

/// Run [`ActivityWatcher::scan`] every `scan_interval` until `shutdown` fires.
pub fn spawn_watcher_task<A>(
    watcher: Arc<ActivityWatcher<A>>,
    scan_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    A: WatchedActivity + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("watcher shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    watcher.scan();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ActivityState;
    use anyhow::anyhow;
    use tokio::time::sleep;

    struct FakeActivity {
        uuid: String,
        state: Mutex<Option<ActivityState>>,
    }

    impl FakeActivity {
        fn new(uuid: &str, state: ActivityState) -> Arc<Self> {
            Arc::new(Self {
                uuid: uuid.to_owned(),
                state: Mutex::new(Some(state)),
            })
        }

        fn set(&self, state: Option<ActivityState>) {
            *self.state.lock() = state;
        }
    }

    impl WatchedActivity for FakeActivity {
        fn uuid(&self) -> &str {
            &self.uuid
        }

        fn sample(&self) -> anyhow::Result<ActivityStatus> {
            let state = *self.state.lock();
            state
                .map(ActivityStatus::new)
                .ok_or_else(|| anyhow!("sampling failed"))
        }
    }

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<(String, ActivityState, ActivityState)>>,
        errors: Mutex<Vec<(String, ActivityState, ActivityState)>>,
        fail: bool,
    }

    impl WatcherListener<FakeActivity> for Recorder {
        fn on_watcher_activity_status_change(
            &self,
            activity: &Arc<FakeActivity>,
            old: &ActivityStatus,
            new: &ActivityStatus,
        ) -> anyhow::Result<()> {
            self.changes
                .lock()
                .push((activity.uuid.clone(), old.state(), new.state()));
            if self.fail {
                return Err(anyhow!("listener failed"));
            }
            Ok(())
        }

        fn on_watcher_activity_error(
            &self,
            activity: &Arc<FakeActivity>,
            old: &ActivityStatus,
            new: &ActivityStatus,
        ) -> anyhow::Result<()> {
            self.errors
                .lock()
                .push((activity.uuid.clone(), old.state(), new.state()));
            Ok(())
        }
    }

    fn watcher_with(recorder: Arc<Recorder>) -> ActivityWatcher<FakeActivity> {
        let watcher = ActivityWatcher::new();
        watcher.add_listener(recorder);
        watcher
    }

    #[test]
    fn failure_transition_raises_one_error_event() {
        let recorder = Arc::new(Recorder::default());
        let watcher = watcher_with(recorder.clone());
        let activity = FakeActivity::new("u1", ActivityState::StartupAttempt);
        assert!(watcher.watch(activity.clone()));

        assert_eq!(watcher.scan(), 0);
        activity.set(Some(ActivityState::StartupFailure));
        assert_eq!(watcher.scan(), 1);
        assert_eq!(watcher.scan(), 0);

        assert_eq!(
            *recorder.errors.lock(),
            vec![(
                "u1".to_owned(),
                ActivityState::StartupAttempt,
                ActivityState::StartupFailure
            )]
        );
        assert!(recorder.changes.lock().is_empty());
    }

    #[test]
    fn ordinary_changes_raise_status_change_events() {
        let recorder = Arc::new(Recorder::default());
        let watcher = watcher_with(recorder.clone());
        let activity = FakeActivity::new("u1", ActivityState::Ready);
        watcher.watch(activity.clone());
        assert!(!watcher.watch(activity.clone()), "second watch keeps the baseline");

        activity.set(Some(ActivityState::Running));
        watcher.scan();
        activity.set(Some(ActivityState::Active));
        watcher.scan();

        let changes = recorder.changes.lock();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].1, ActivityState::Running);
        assert_eq!(changes[1].2, ActivityState::Active);
    }

    #[test]
    fn sampling_and_listener_errors_do_not_stop_the_scan() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let watcher = watcher_with(recorder.clone());
        let broken = FakeActivity::new("broken", ActivityState::Running);
        let healthy = FakeActivity::new("healthy", ActivityState::Running);
        let other = FakeActivity::new("other", ActivityState::Running);
        watcher.watch(broken.clone());
        watcher.watch(healthy.clone());
        watcher.watch(other.clone());

        broken.set(None);
        healthy.set(Some(ActivityState::Active));
        other.set(Some(ActivityState::Active));
        assert_eq!(watcher.scan(), 2);

        let seen: Vec<String> = recorder
            .changes
            .lock()
            .iter()
            .map(|(uuid, _, _)| uuid.clone())
            .collect();
        assert_eq!(seen, vec!["healthy".to_owned(), "other".to_owned()]);
    }

    #[test]
    fn unwatched_activities_are_not_sampled() {
        let recorder = Arc::new(Recorder::default());
        let watcher = watcher_with(recorder.clone());
        let activity = FakeActivity::new("u1", ActivityState::Running);
        watcher.watch(activity.clone());
        assert!(watcher.unwatch("u1"));
        activity.set(Some(ActivityState::Crashed));
        assert_eq!(watcher.scan(), 0);
        assert!(watcher.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn background_task_scans_until_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let watcher = Arc::new(watcher_with(recorder.clone()));
        let activity = FakeActivity::new("u1", ActivityState::Running);
        watcher.watch(activity.clone());

        let (shutdown, _) = broadcast::channel(1);
        let task = spawn_watcher_task(watcher.clone(), Duration::from_millis(10), shutdown.subscribe());
        activity.set(Some(ActivityState::Crashed));
        sleep(Duration::from_millis(100)).await;

        let _ = shutdown.send(());
        task.await.expect("watcher task joins");
        assert_eq!(recorder.errors.lock().len(), 1);
    }
}
