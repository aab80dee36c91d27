//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Managed activities running as native child processes."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use actrl_lifecycle::{
    ActivityContext, ActivityFactory, ActivityFilesystem, ActivityState, ActivityStatus,
    ManagedActivity, StatusListener,
};
use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

/// Configuration key naming the program to run.
pub const CONFIG_EXECUTABLE: &str = "activity.executable";
/// Configuration key with whitespace separated program arguments.
pub const CONFIG_ARGS: &str = "activity.args";

/// Builds [`NativeActivity`] instances from the activity configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeActivityFactory;

impl ActivityFactory for NativeActivityFactory {
    fn create(&self, context: &ActivityContext) -> Result<Box<dyn ManagedActivity>> {
        let executable = context
            .configuration
            .get(CONFIG_EXECUTABLE)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("activity {} has no {CONFIG_EXECUTABLE} configured", context.uuid()))?;
        let args: Vec<String> = context
            .configuration
            .get(CONFIG_ARGS)
            .map(|args| args.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        Ok(Box::new(NativeActivity {
            uuid: context.uuid().to_owned(),
            executable: PathBuf::from(executable),
            args,
            filesystem: context.filesystem.clone(),
            child: None,
            status: ActivityStatus::default(),
            listeners: Vec::new(),
        }))
    }
}

/// One child process per run. Activation only changes the reported state.
pub struct NativeActivity {
    uuid: String,
    executable: PathBuf,
    args: Vec<String>,
    filesystem: ActivityFilesystem,
    child: Option<Child>,
    status: ActivityStatus,
    listeners: Vec<Arc<dyn StatusListener>>,
}

impl NativeActivity {
    fn change(&mut self, state: ActivityState) {
        self.set_status(ActivityStatus::new(state));
    }

    fn log_file(dir: &Path, name: &str) -> Result<File> {
        let path = dir.join(name);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))
    }

    fn spawn(&self) -> Result<Child> {
        let mut command = Command::new(&self.executable);
        command
            .args(&self.args)
            .env("ACTRL_ACTIVITY_UUID", &self.uuid)
            .env("ACTRL_ACTIVITY_LOGDIR", &self.filesystem.log_dir)
            .env("ACTRL_ACTIVITY_DATADIR", &self.filesystem.permanent_data_dir)
            .env("ACTRL_ACTIVITY_TMPDIR", &self.filesystem.temp_data_dir)
            .stdin(Stdio::null())
            .stdout(Self::log_file(&self.filesystem.log_dir, "stdout.log")?)
            .stderr(Self::log_file(&self.filesystem.log_dir, "stderr.log")?);
        if self.filesystem.install_dir.is_dir() {
            command.current_dir(&self.filesystem.install_dir);
        }
        command
            .spawn()
            .with_context(|| format!("failed to launch {}", self.executable.display()))
    }

    /// Kill the child if it is still running and reap it.
    fn stop_child(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Some(exit) = child.try_wait()? {
            debug!(activity = %self.uuid, %exit, "process had already exited");
            return Ok(());
        }
        child.kill().context("failed to kill activity process")?;
        let exit = child.wait().context("failed to reap activity process")?;
        debug!(activity = %self.uuid, %exit, "process stopped");
        Ok(())
    }
}

impl ManagedActivity for NativeActivity {
    fn startup(&mut self) -> Result<()> {
        self.change(ActivityState::StartupAttempt);
        let child = self.spawn()?;
        info!(activity = %self.uuid, pid = child.id(), executable = %self.executable.display(), "activity process started");
        self.child = Some(child);
        self.change(ActivityState::Running);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.change(ActivityState::ShutdownAttempt);
        self.stop_child()?;
        self.change(ActivityState::Ready);
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        self.change(ActivityState::ActivateAttempt);
        self.change(ActivityState::Active);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        self.change(ActivityState::DeactivateAttempt);
        self.change(ActivityState::Running);
        Ok(())
    }

    fn check_health(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        if let Some(exit) = child.try_wait()? {
            bail!("activity process exited with {exit}");
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

    fn update_configuration(&mut self, update: &IndexMap<String, String>) -> Result<()> {
        debug!(activity = %self.uuid, keys = update.len(), "configuration applies from the next startup");
        Ok(())
    }

    fn register_status_listener(&mut self, listener: Arc<dyn StatusListener>) {
        self.listeners.push(listener);
    }

    fn handle_startup_failure(&mut self) -> Result<()> {
        self.stop_child()
    }
}

impl Drop for NativeActivity {
    fn drop(&mut self) {
        if let Err(err) = self.stop_child() {
            warn!(activity = %self.uuid, error = %format!("{err:#}"), "could not stop orphaned activity process");
        }
    }
}
