//! ---
//! actrl_section: "02-lifecycle"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Error taxonomy for the lifecycle engine."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use crate::instance::LockState;
use crate::state::ActivityState;
use crate::transition::Transition;

/// Convenience result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Error type for the lifecycle engine.
///
/// Hook failures never leave the instance controller as errors; they are
/// folded into a failure [`crate::ActivityStatus`]. The variants below cover
/// preconditions and locking outcomes.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Startup requested while an instance already exists.
    #[error("activity {uuid} already has a running instance")]
    AlreadyStarted {
        /// Activity identifier.
        uuid: String,
    },
    /// Operation requires an instance but none exists.
    #[error("activity {uuid} has no running instance")]
    NotStarted {
        /// Activity identifier.
        uuid: String,
    },
    /// The calling thread already holds the activity lock.
    #[error("nested lock acquisition on activity {uuid} while already holding it for {held}")]
    NestedLock {
        /// Activity identifier.
        uuid: String,
        /// Operation the current holder is performing.
        held: LockState,
    },
    /// Lock waiters were interrupted before the lock was obtained.
    #[error("interrupted while waiting to {operation} activity {uuid}")]
    Interrupted {
        /// Activity identifier.
        uuid: String,
        /// Operation that was waiting.
        operation: LockState,
    },
    /// The requested transition is not valid from the current state.
    #[error("cannot {transition} activity {uuid} while {state}")]
    IllegalTransition {
        /// Activity identifier.
        uuid: String,
        /// Requested transition.
        transition: Transition,
        /// State observed at the time of the request.
        state: ActivityState,
    },
    /// The event serializer has been shut down.
    #[error("event serializer is no longer accepting tasks")]
    SerializerClosed,
    /// Failure raised by a managed activity or one of its collaborators.
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_activity() {
        let err = LifecycleError::NestedLock {
            uuid: "u1".into(),
            held: LockState::Startup,
        };
        assert_eq!(
            err.to_string(),
            "nested lock acquisition on activity u1 while already holding it for startup"
        );
        let err = LifecycleError::IllegalTransition {
            uuid: "u1".into(),
            transition: Transition::Deactivate,
            state: ActivityState::Ready,
        };
        assert_eq!(err.to_string(), "cannot deactivate activity u1 while READY");
    }
}
