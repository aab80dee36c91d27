//! ---
//! actrl_section: "06-testing"
//! actrl_subsection: "01-bootstrap"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Scripted managed activities for lifecycle tests."
//! actrl_version: "v0.1.0"
//! actrl_owner: "tbd"
//! ---
//! Scripted stand-ins for managed activities.
//!
//! A [`ScriptedActivityFactory`] hands out [`ScriptedActivity`] instances whose
//! hooks succeed or fail according to an [`ActivityScript`]. Scripts are read
//! when a hook runs, so a test can change behaviour between calls. Every hook
//! call is recorded, together with whether two hooks of the same activity
//! ever ran at the same time.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use actrl_lifecycle::{
    ActivityContext, ActivityFactory, ActivityState, ActivityStatus, ManagedActivity,
    StatusListener,
};
use anyhow::anyhow;
use indexmap::IndexMap;
use parking_lot::Mutex;
use strum::Display;
use tracing::debug;

/// Behaviour of scripted activities.
#[derive(Debug, Clone, Default)]
pub struct ActivityScript {
    /// The factory refuses to build the instance.
    pub fail_create: bool,
    /// `startup` fails.
    pub fail_startup: bool,
    /// `shutdown` fails.
    pub fail_shutdown: bool,
    /// `activate` fails.
    pub fail_activate: bool,
    /// `deactivate` fails.
    pub fail_deactivate: bool,
    /// `check_health` fails.
    pub fail_health: bool,
    /// Report `*_ATTEMPT` states before each transition.
    pub emit_attempts: bool,
    /// Time spent inside each lifecycle hook.
    pub hook_delay: Duration,
}

/// Hooks recorded by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Hook {
    /// `ManagedActivity::startup`.
    Startup,
    /// `ManagedActivity::shutdown`.
    Shutdown,
    /// `ManagedActivity::activate`.
    Activate,
    /// `ManagedActivity::deactivate`.
    Deactivate,
    /// `ManagedActivity::check_health`.
    CheckHealth,
    /// `ManagedActivity::update_configuration`.
    UpdateConfiguration,
    /// `ManagedActivity::handle_startup_failure`.
    HandleStartupFailure,
}

#[derive(Debug, Default)]
struct HarnessState {
    default_script: ActivityScript,
    scripts: HashMap<String, ActivityScript>,
    calls: Vec<(String, Hook)>,
    created: HashMap<String, usize>,
    contexts: HashMap<String, ActivityContext>,
    active: HashMap<String, usize>,
    overlapped: HashMap<String, bool>,
}

impl HarnessState {
    fn script_for(&self, uuid: &str) -> ActivityScript {
        self.scripts
            .get(uuid)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }
}

/// Factory producing [`ScriptedActivity`] instances. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedActivityFactory {
    state: Arc<Mutex<HarnessState>>,
}

impl ScriptedActivityFactory {
    /// Factory whose activities always succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory using `script` for every activity without its own script.
    pub fn with_default(script: ActivityScript) -> Self {
        let factory = Self::default();
        factory.state.lock().default_script = script;
        factory
    }

    /// Set the script for one activity.
    pub fn script(&self, uuid: &str, script: ActivityScript) {
        self.state.lock().scripts.insert(uuid.to_owned(), script);
    }

    /// Edit the script for one activity in place.
    pub fn update_script(&self, uuid: &str, edit: impl FnOnce(&mut ActivityScript)) {
        let mut state = self.state.lock();
        let mut script = state.script_for(uuid);
        edit(&mut script);
        state.scripts.insert(uuid.to_owned(), script);
    }

    /// Every recorded hook call, in order.
    pub fn calls(&self) -> Vec<(String, Hook)> {
        self.state.lock().calls.clone()
    }

    /// Hook calls for one activity, in order.
    pub fn calls_for(&self, uuid: &str) -> Vec<Hook> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(id, _)| id == uuid)
            .map(|(_, hook)| *hook)
            .collect()
    }

    /// Number of instances created for `uuid`.
    pub fn created(&self, uuid: &str) -> usize {
        self.state.lock().created.get(uuid).copied().unwrap_or(0)
    }

    /// Context passed to the most recent creation for `uuid`.
    pub fn last_context(&self, uuid: &str) -> Option<ActivityContext> {
        self.state.lock().contexts.get(uuid).cloned()
    }

    /// Whether two hooks of `uuid` ever ran at the same time.
    pub fn overlapped(&self, uuid: &str) -> bool {
        self.state
            .lock()
            .overlapped
            .get(uuid)
            .copied()
            .unwrap_or(false)
    }
}

impl ActivityFactory for ScriptedActivityFactory {
    fn create(&self, context: &ActivityContext) -> anyhow::Result<Box<dyn ManagedActivity>> {
        let uuid = context.uuid().to_owned();
        {
            let mut state = self.state.lock();
            if state.script_for(&uuid).fail_create {
                return Err(anyhow!("scripted creation failure for {uuid}"));
            }
            *state.created.entry(uuid.clone()).or_default() += 1;
            state.contexts.insert(uuid.clone(), context.clone());
        }
        debug!(activity = %uuid, "scripted activity created");
        Ok(Box::new(ScriptedActivity {
            uuid,
            state: self.state.clone(),
            status: ActivityStatus::default(),
            listeners: Vec::new(),
        }))
    }
}

/// Managed activity driven by an [`ActivityScript`].
pub struct ScriptedActivity {
    uuid: String,
    state: Arc<Mutex<HarnessState>>,
    status: ActivityStatus,
    listeners: Vec<Arc<dyn StatusListener>>,
}

impl ScriptedActivity {
    fn enter(&self, hook: Hook) -> ActivityScript {
        let mut state = self.state.lock();
        state.calls.push((self.uuid.clone(), hook));
        let active = state.active.entry(self.uuid.clone()).or_default();
        *active += 1;
        if *active > 1 {
            state.overlapped.insert(self.uuid.clone(), true);
        }
        state.script_for(&self.uuid)
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        if let Some(active) = state.active.get_mut(&self.uuid) {
            *active = active.saturating_sub(1);
        }
    }

    fn change(&mut self, state: ActivityState) {
        self.set_status(ActivityStatus::new(state));
    }

    fn transition(
        &mut self,
        hook: Hook,
        attempt: ActivityState,
        outcome: ActivityState,
        fails: impl FnOnce(&ActivityScript) -> bool,
    ) -> anyhow::Result<()> {
        let script = self.enter(hook);
        if script.emit_attempts {
            self.change(attempt);
        }
        if !script.hook_delay.is_zero() {
            thread::sleep(script.hook_delay);
        }
        self.leave();
        if fails(&script) {
            return Err(anyhow!("scripted {hook} failure for {}", self.uuid));
        }
        self.change(outcome);
        Ok(())
    }
}

impl ManagedActivity for ScriptedActivity {
    fn startup(&mut self) -> anyhow::Result<()> {
        self.transition(
            Hook::Startup,
            ActivityState::StartupAttempt,
            ActivityState::Running,
            |script| script.fail_startup,
        )
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        self.transition(
            Hook::Shutdown,
            ActivityState::ShutdownAttempt,
            ActivityState::Ready,
            |script| script.fail_shutdown,
        )
    }

    fn activate(&mut self) -> anyhow::Result<()> {
        self.transition(
            Hook::Activate,
            ActivityState::ActivateAttempt,
            ActivityState::Active,
            |script| script.fail_activate,
        )
    }

    fn deactivate(&mut self) -> anyhow::Result<()> {
        self.transition(
            Hook::Deactivate,
            ActivityState::DeactivateAttempt,
            ActivityState::Running,
            |script| script.fail_deactivate,
        )
    }

    fn check_health(&mut self) -> anyhow::Result<()> {
        let script = self.enter(Hook::CheckHealth);
        self.leave();
        if script.fail_health {
            return Err(anyhow!("scripted health failure for {}", self.uuid));
        }
        Ok(())
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

    fn update_configuration(&mut self, _update: &IndexMap<String, String>) -> anyhow::Result<()> {
        self.enter(Hook::UpdateConfiguration);
        self.leave();
        Ok(())
    }

    fn register_status_listener(&mut self, listener: Arc<dyn StatusListener>) {
        self.listeners.push(listener);
    }

    fn handle_startup_failure(&mut self) -> anyhow::Result<()> {
        self.enter(Hook::HandleStartupFailure);
        self.leave();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actrl_lifecycle::{ActivityFilesystem, InstalledActivity};

    fn context(uuid: &str) -> ActivityContext {
        ActivityContext {
            activity: InstalledActivity::new(uuid, "demo"),
            filesystem: ActivityFilesystem::under(format!("/tmp/{uuid}")),
            configuration: IndexMap::new(),
        }
    }

    #[test]
    fn scripted_hooks_report_outcomes_and_record_calls() {
        let factory = ScriptedActivityFactory::new();
        factory.update_script("u1", |script| script.fail_activate = true);

        let mut activity = factory.create(&context("u1")).expect("create");
        activity.startup().expect("startup");
        assert_eq!(activity.status().state(), ActivityState::Running);
        assert!(activity.activate().is_err());
        assert_eq!(activity.status().state(), ActivityState::Running);

        assert_eq!(factory.calls_for("u1"), vec![Hook::Startup, Hook::Activate]);
        assert_eq!(factory.created("u1"), 1);
        assert!(!factory.overlapped("u1"));
    }

    #[test]
    fn creation_can_be_refused() {
        let factory = ScriptedActivityFactory::with_default(ActivityScript {
            fail_create: true,
            ..ActivityScript::default()
        });
        assert!(factory.create(&context("u2")).is_err());
        assert_eq!(factory.created("u2"), 0);
    }
}
