//! Error types for the sync engine and its collaborators.

use pinwall_types::{CommandId, ObjectError, ObjectId};

use crate::agent::OperationOutcome;

/// Failure reported by an external collaborator (document store,
/// coordination store, tool service).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Engine errors surfaced to the presentation layer. None of them are
/// process-fatal.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A collaborator call failed. Surfaced to the caller, never retried
    /// automatically.
    #[error("network: {0}")]
    Network(#[from] BackendError),

    #[error("object {object_id} is locked by {holder_name}")]
    LockContention { object_id: ObjectId, holder_name: String },

    /// An event arrived for a subscription generation that is no longer
    /// current.
    #[error("stale subscription event (generation {got}, current {current})")]
    StaleSubscription { got: u64, current: u64 },

    /// An agent command failed. `outcomes` holds the operations that ran
    /// before the failure.
    #[error("agent command {command_id} failed: {message}")]
    AgentCommand {
        command_id: CommandId,
        message: String,
        outcomes: Vec<OperationOutcome>,
    },

    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("invalid object: {0}")]
    Invalid(#[from] ObjectError),

    #[error("service shut down")]
    Shutdown,
}

impl SyncError {
    /// Whether this error left the local view unchanged (caller may retry
    /// the gesture).
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
