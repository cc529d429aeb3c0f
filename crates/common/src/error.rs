//! Common error types for Lockstep
//!
//! One error enum is shared by the coordinator and the workers. The HTTP
//! layer maps variants onto status codes; workers report them as `Failed`
//! events.

use thiserror::Error;

/// Main error type for Lockstep
#[derive(Error, Debug)]
pub enum LockstepError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Model build or generation errors
    #[error("Model error: {0}")]
    Model(String),

    /// Group rendezvous errors
    #[error("Rendezvous error: {0}")]
    Rendezvous(String),

    /// A rank answered out of step or with an unexpected message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Ranks disagreed on input or output
    #[error("Rank divergence: {0}")]
    Divergence(String),


    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A single worker stopped answering
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The execution group can no longer serve requests
    #[error("Group unavailable: {0}")]
    GroupUnavailable(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<::config::ConfigError> for LockstepError {
    fn from(err: ::config::ConfigError) -> Self {
        LockstepError::Config(err.to_string())
    }
}

impl LockstepError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        LockstepError::Config(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        LockstepError::Model(msg.into())
    }

    /// Create a rendezvous error
    pub fn rendezvous(msg: impl Into<String>) -> Self {
        LockstepError::Rendezvous(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        LockstepError::Protocol(msg.into())
    }

    /// Create a divergence error
    pub fn divergence(msg: impl Into<String>) -> Self {
        LockstepError::Divergence(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        LockstepError::Timeout(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        LockstepError::WorkerUnavailable(msg.into())
    }

    /// Create a group unavailable error
    pub fn group_unavailable(msg: impl Into<String>) -> Self {
        LockstepError::GroupUnavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        LockstepError::Internal(msg.into())
    }

    /// Whether the group must stop serving after this error
    ///
    /// A collective that was interrupted half way cannot be resumed, so
    /// anything that leaves ranks in an unknown position is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LockstepError::Protocol(_)
                | LockstepError::Timeout(_)
                | LockstepError::WorkerUnavailable(_)
                | LockstepError::GroupUnavailable(_)
                | LockstepError::Model(_)
        )
    }
}

/// Result type alias for Lockstep operations
pub type Result<T> = std::result::Result<T, LockstepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(LockstepError::timeout("fan-in").is_fatal());
        assert!(LockstepError::protocol("seq mismatch").is_fatal());
        assert!(!LockstepError::divergence("ranks 0 and 1").is_fatal());
        assert!(!LockstepError::divergence("digest").is_fatal());
    }

    #[test]
    fn test_display_prefix() {
        let err = LockstepError::worker_unavailable("rank 2 exited");
        assert_eq!(err.to_string(), "Worker unavailable: rank 2 exited");
    }
}
