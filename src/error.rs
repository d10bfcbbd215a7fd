//! Error Types
//!
//! Errors raised by the engine, its repositories and the resource manager
//! client. Failures inside a running workflow are not reported through these
//! types; they surface in the instance's persisted status.

use thiserror::Error;

/// Error type returned by task handler bodies.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from an instance repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("workflow instance '{0}' not found")]
    NotFound(String),

    #[error("workflow instance has no id; add it before updating")]
    MissingId,

    #[error("invalid workflow instance id '{0}'")]
    InvalidId(String),

    #[error("repository I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize workflow instance: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("repository lock poisoned")]
    Poisoned,
}

/// Errors reported by a resource manager client.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job submission failed: {0}")]
    Submission(String),

    #[error("resource manager unreachable: {0}")]
    Transport(String),

    #[error("job '{0}' rejected by resource manager")]
    Rejected(String),
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("invalid workflow: {0}")]
    Validation(String),

    #[error("no task handler registered as '{0}'")]
    UnknownHandler(String),

    #[error("no condition evaluator registered as '{0}'")]
    UnknownCondition(String),

    #[error("engine is not tracking workflow instance '{0}'")]
    UnknownInstance(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("condition evaluation failed: {0}")]
    Condition(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_converts() {
        let err: EngineError = RepositoryError::NotFound("abc".to_string()).into();
        assert_eq!(err.to_string(), "workflow instance 'abc' not found");
    }

    #[test]
    fn test_job_error_converts() {
        let err: EngineError = JobError::Submission("queue full".to_string()).into();
        assert!(err.to_string().contains("queue full"));
    }

    #[test]
    fn test_unknown_handler_message() {
        let err = EngineError::UnknownHandler("shell".to_string());
        assert_eq!(err.to_string(), "no task handler registered as 'shell'");
    }
}
