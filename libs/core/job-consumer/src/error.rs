//! Consumer error types and error categorization
//!
//! Per-message failures (`ParseError`, `JobError`) are turned into logging and
//! routing decisions inside the consumer. Only `ConsumerError` ever leaves
//! [`JobConsumer::wait`](crate::JobConsumer::wait).

use std::time::Duration;
use thiserror::Error;

/// Category of a business failure, deciding whether the retry budget applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - retried through the delayed destination until the limit
    Transient,
    /// Unrecoverable failure - marked failed and dead-lettered immediately
    Permanent,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure raised by caller-supplied business logic.
#[derive(Debug, Error)]
#[error("{category} job error: {message}")]
pub struct JobError {
    message: String,
    category: ErrorCategory,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl JobError {
    /// Create a transient (retryable) error
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Transient,
            source: None,
        }
    }

    /// Create a permanent error, skipping the retry budget
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Permanent,
            source: None,
        }
    }

    /// Attach the underlying cause
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn is_permanent(&self) -> bool {
        self.category == ErrorCategory::Permanent
    }
}

impl From<AccessError> for JobError {
    fn from(err: AccessError) -> Self {
        JobError::permanent(err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::permanent(err.to_string()).with_source(err)
    }
}

/// The delivered payload cannot be turned into a runnable job
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload must be a JSON object with 'meta' and 'data'")]
    NotAnObject,

    #[error("payload is missing the '{0}' field")]
    MissingField(&'static str),

    /// The job reached the terminal failed status and is never run again
    #[error("job '{job_id}' of worker '{worker}' is marked as failed")]
    JobFailed { worker: String, job_id: String },
}

/// Typed lookup into `meta` or `data` failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("member '{path}' does not exist")]
    Missing { path: String },

    #[error("member '{path}' is {found}, expected {expected}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Outgoing payload could not be serialized
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("'{0}' must not be null")]
    NullField(&'static str),
}

/// Broker collaborator failure
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("consume failed: {0}")]
    Consume(String),
}

/// Key-value store collaborator failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("value under '{key}' is not an integer: {value}")]
    NotAnInteger { key: String, value: String },
}

/// Errors escaping the consumption loop
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Expected termination signal once the processed-message limit is hit
    #[error("processed message limit of {limit} reached")]
    ProcessedLimitExceeded { limit: u64 },

    /// No delivery arrived within the idle timeout; the caller may wait again
    #[error("no message delivered within {0:?}")]
    Timeout(Duration),

    #[error("consumer is not consuming from any queue")]
    NotConsuming,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ConsumerError {
    /// Recoverable conditions after which the caller keeps waiting
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConsumerError::Timeout(_))
    }

    pub fn is_limit_reached(&self) -> bool {
        matches!(self, ConsumerError::ProcessedLimitExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_categories() {
        let transient = JobError::transient("timeout");
        assert_eq!(transient.category(), ErrorCategory::Transient);
        assert!(!transient.is_permanent());

        let permanent = JobError::permanent("invalid email");
        assert!(permanent.is_permanent());
        assert_eq!(permanent.to_string(), "permanent job error: invalid email");
    }

    #[test]
    fn test_access_error_is_permanent_job_error() {
        let err: JobError = AccessError::Missing {
            path: "data.id".to_string(),
        }
        .into();
        assert!(err.is_permanent());
        assert!(err.message().contains("data.id"));
    }

    #[test]
    fn test_consumer_error_predicates() {
        assert!(ConsumerError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(ConsumerError::ProcessedLimitExceeded { limit: 3 }.is_limit_reached());
        assert!(!ConsumerError::NotConsuming.is_timeout());
    }
}
