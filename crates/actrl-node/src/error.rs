//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Errors raised by the controller node."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use actrl_lifecycle::LifecycleError;
use tokio::task::JoinError;

/// Result alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors returned by [`crate::ControllerNode`].
///
/// Activity failures are published as statuses and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Lifecycle engine failure outside any single activity.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// The node is not accepting commands.
    #[error("controller node is not running")]
    NodeStopped,
    /// `start` was called twice.
    #[error("controller node already started")]
    AlreadyRunning,
    /// A collaborator could not be reached or set up.
    #[error("collaborator failure: {0:#}")]
    Collaborator(anyhow::Error),
    /// Node infrastructure could not be spawned.
    #[error("failed to spawn node infrastructure: {0}")]
    Spawn(#[from] std::io::Error),
    /// A blocking node task panicked or was cancelled.
    #[error("node task failed: {0}")]
    Task(#[from] JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_errors_keep_their_context() {
        let err = NodeError::Collaborator(
            anyhow::anyhow!("manifest unreadable").context("loading repository"),
        );
        assert_eq!(
            err.to_string(),
            "collaborator failure: loading repository: manifest unreadable"
        );
        let err: NodeError = LifecycleError::SerializerClosed.into();
        assert!(matches!(err, NodeError::Lifecycle(_)));
    }
}
