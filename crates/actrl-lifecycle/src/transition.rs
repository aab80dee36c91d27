//! ---
//! actrl_section: "02-lifecycle"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Legality rules for lifecycle transitions."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::state::ActivityState;

/// The four canonical lifecycle transitions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Transition {
    /// READY to RUNNING.
    Startup,
    /// RUNNING to ACTIVE.
    Activate,
    /// ACTIVE to RUNNING.
    Deactivate,
    /// Any live state to READY.
    Shutdown,
}

/// Operation the instance controller runs for a performed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    /// Create and start a new instance.
    Startup,
    /// Shut down the leftover instance of a failed run, then start a new one.
    RecoverThenStartup,
    /// Activate the running instance.
    Activate,
    /// Deactivate the active instance.
    Deactivate,
    /// Shut down and discard the instance.
    Shutdown,
}

/// What performing a transition entails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionPlan {
    /// A single operation on the instance controller.
    Run(Operation),
    /// A chain of transitions driven by observed status changes.
    Sequence(Vec<Transition>),
}

/// Outcome of evaluating a transition against the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// The transition applies; run the plan.
    Performed(TransitionPlan),
    /// The activity is already where the transition leads.
    Noop,
    /// The transition is not valid from the current state.
    Illegal,
}

impl Transition {
    /// State the activity settles in when the transition succeeds.
    pub fn expected_outcome(&self) -> ActivityState {
        match self {
            Transition::Startup => ActivityState::Running,
            Transition::Activate => ActivityState::Active,
            Transition::Deactivate => ActivityState::Running,
            Transition::Shutdown => ActivityState::Ready,
        }
    }

    /// Intermediate state reported while the transition is in progress.
    pub fn attempt_state(&self) -> ActivityState {
        match self {
            Transition::Startup => ActivityState::StartupAttempt,
            Transition::Activate => ActivityState::ActivateAttempt,
            Transition::Deactivate => ActivityState::DeactivateAttempt,
            Transition::Shutdown => ActivityState::ShutdownAttempt,
        }
    }

    /// State reported when the transition fails.
    pub fn failure_state(&self) -> ActivityState {
        match self {
            Transition::Startup => ActivityState::StartupFailure,
            Transition::Activate => ActivityState::ActivateFailure,
            Transition::Deactivate => ActivityState::DeactivateFailure,
            Transition::Shutdown => ActivityState::ShutdownFailure,
        }
    }

    /// Evaluate the transition from `current`.
    pub fn attempt(&self, current: ActivityState) -> TransitionResult {
        use ActivityState as S;
        use TransitionResult::{Illegal, Noop, Performed};

        match (self, current) {
            (Transition::Startup, S::Ready) => Performed(TransitionPlan::Run(Operation::Startup)),
            (Transition::Startup, S::StartupFailure | S::ShutdownFailure | S::Crashed) => {
                Performed(TransitionPlan::Run(Operation::RecoverThenStartup))
            }
            (Transition::Startup, S::Running) => Noop,
            (Transition::Startup, _) => Illegal,

            (Transition::Activate, S::Running | S::ActivateFailure) => {
                Performed(TransitionPlan::Run(Operation::Activate))
            }
            (Transition::Activate, S::Ready) => Performed(TransitionPlan::Sequence(vec![
                Transition::Startup,
                Transition::Activate,
            ])),
            (Transition::Activate, S::Active) => Noop,
            (Transition::Activate, _) => Illegal,

            (Transition::Deactivate, S::Active | S::DeactivateFailure) => {
                Performed(TransitionPlan::Run(Operation::Deactivate))
            }
            (Transition::Deactivate, _) => Illegal,

            (Transition::Shutdown, S::Ready) => Noop,
            (Transition::Shutdown, S::DoesntExist | S::Unknown) => Illegal,
            (Transition::Shutdown, _) => Performed(TransitionPlan::Run(Operation::Shutdown)),
        }
    }
}
