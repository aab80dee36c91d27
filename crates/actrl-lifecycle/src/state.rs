//! ---
//! actrl_section: "02-lifecycle"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Activity states and status snapshots."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Lifecycle state of an activity as observed through its instance controller.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityState {
    /// Installed and ready to be started.
    Ready,
    /// Startup has been requested.
    StartupAttempt,
    /// Started but not activated.
    Running,
    /// Startup failed.
    StartupFailure,
    /// Activation has been requested.
    ActivateAttempt,
    /// Started and activated.
    Active,
    /// Activation failed; the instance is still running.
    ActivateFailure,
    /// Deactivation has been requested.
    DeactivateAttempt,
    /// Deactivation failed; the instance is still running.
    DeactivateFailure,
    /// Shutdown has been requested.
    ShutdownAttempt,
    /// Shutdown failed.
    ShutdownFailure,
    /// The instance stopped without being asked to.
    Crashed,
    /// The activity is not installed on this node.
    DoesntExist,
    /// The state could not be determined.
    Unknown,
}

impl ActivityState {
    /// Human readable description.
    pub fn description(&self) -> &'static str {
        match self {
            ActivityState::Ready => "Ready",
            ActivityState::StartupAttempt => "Attempting startup",
            ActivityState::Running => "Running",
            ActivityState::StartupFailure => "Startup failed",
            ActivityState::ActivateAttempt => "Attempting activation",
            ActivityState::Active => "Activated",
            ActivityState::ActivateFailure => "Activation failed",
            ActivityState::DeactivateAttempt => "Attempting deactivation",
            ActivityState::DeactivateFailure => "Deactivation failed",
            ActivityState::ShutdownAttempt => "Attempting shutdown",
            ActivityState::ShutdownFailure => "Shutdown failed",
            ActivityState::Crashed => "Crashed",
            ActivityState::DoesntExist => "Does not exist",
            ActivityState::Unknown => "Unknown",
        }
    }

    /// Whether an instance exists and is at least partially live.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ActivityState::StartupAttempt
                | ActivityState::Running
                | ActivityState::ActivateAttempt
                | ActivityState::Active
                | ActivityState::ActivateFailure
                | ActivityState::DeactivateAttempt
                | ActivityState::DeactivateFailure
                | ActivityState::ShutdownAttempt
        )
    }

    /// Whether the state reports a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ActivityState::StartupFailure
                | ActivityState::ActivateFailure
                | ActivityState::DeactivateFailure
                | ActivityState::ShutdownFailure
                | ActivityState::Crashed
                | ActivityState::DoesntExist
        )
    }
}

/// Immutable snapshot of an activity's status.
///
/// Equality compares the state only; `detail` and `cause` are diagnostic.
#[derive(Debug, Clone)]
pub struct ActivityStatus {
    state: ActivityState,
    detail: Option<String>,
    cause: Option<Arc<anyhow::Error>>,
}

impl ActivityStatus {
    /// Status carrying only a state.
    pub fn new(state: ActivityState) -> Self {
        Self {
            state,
            detail: None,
            cause: None,
        }
    }

    /// Status with a human readable detail.
    pub fn with_detail(state: ActivityState, detail: impl Into<String>) -> Self {
        Self {
            state,
            detail: Some(detail.into()),
            cause: None,
        }
    }

    /// Failure status keeping the originating error.
    pub fn failure(state: ActivityState, detail: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            state,
            detail: Some(detail.into()),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Copy of this status moved to `state`, keeping the cause.
    pub fn with_state(&self, state: ActivityState, detail: impl Into<String>) -> Self {
        Self {
            state,
            detail: Some(detail.into()),
            cause: self.cause.clone(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ActivityState {
        self.state
    }

    /// Optional detail message.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Optional underlying error.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }
}

impl Default for ActivityStatus {
    fn default() -> Self {
        Self::new(ActivityState::Ready)
    }
}

impl From<ActivityState> for ActivityStatus {
    fn from(state: ActivityState) -> Self {
        Self::new(state)
    }
}

impl PartialEq for ActivityStatus {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl Eq for ActivityStatus {}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({})", self.state, detail),
            None => write!(f, "{}", self.state),
        }
    }
}

impl Serialize for ActivityStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_struct("ActivityStatus", 3)?;
        out.serialize_field("state", &self.state)?;
        out.serialize_field("detail", &self.detail)?;
        out.serialize_field("cause", &self.cause.as_ref().map(|err| format!("{err:#}")))?;
        out.end()
    }
}
