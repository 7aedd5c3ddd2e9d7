//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the orchestrator, worker and scheduler.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed definition or request. Surfaced verbatim, nothing persisted.
    #[error("validation error: {0}")]
    Validation(String),

    /// Entity lookup by id failed.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filter referenced a field the entity does not have.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Operation attempted while the entity is outside its allowed state set.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Requested transition is absent from the entity's table.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Dependency or successor graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// `depends_on` names a stage that does not exist.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// A step cannot be reached from its stage's initial steps.
    #[error("unreachable step: {0}")]
    UnreachableStep(String),

    /// No reply arrived before the deadline.
    #[error("rpc timeout: {0}")]
    RpcTimeout(String),

    /// Broker or scheduler unreachable.
    #[error("connection error: {0}")]
    Connection(String),

    /// Generic failure reported by the scheduler channel.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation cancelled (shutdown, killed task).
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code carried in broker error frames and control replies.
    pub fn to_ipc_error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidFilter(_) => "INVALID_FILTER",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::StateTransition(_) => "FAILED_PRECONDITION",
            Error::CycleDetected(_) => "CYCLE_DETECTED",
            Error::UnknownDependency(_) => "UNKNOWN_DEPENDENCY",
            Error::UnreachableStep(_) => "UNREACHABLE_STEP",
            Error::RpcTimeout(_) => "DEADLINE_EXCEEDED",
            Error::Connection(_) => "UNAVAILABLE",
            Error::Scheduler(_) => "SCHEDULER_FAILURE",
            Error::Cancelled(_) => "CANCELLED",
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => "INTERNAL",
        }
    }

    /// Whether retrying the operation after a reconnect can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_filter(msg: impl Into<String>) -> Self {
        Self::InvalidFilter(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn cycle_detected(msg: impl Into<String>) -> Self {
        Self::CycleDetected(msg.into())
    }

    pub fn unknown_dependency(msg: impl Into<String>) -> Self {
        Self::UnknownDependency(msg.into())
    }

    pub fn unreachable_step(msg: impl Into<String>) -> Self {
        Self::UnreachableStep(msg.into())
    }

    pub fn rpc_timeout(msg: impl Into<String>) -> Self {
        Self::RpcTimeout(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }
}
