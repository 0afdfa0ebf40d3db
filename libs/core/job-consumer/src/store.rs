//! Key-value store collaborator and job record keys
//!
//! The idempotency layer keeps three entries per job:
//! `status:<worker>:<jobId>`, `retry:<worker>:<jobId>` and
//! `lock:<worker>:<jobId>`.

use crate::envelope::JobId;
use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};

/// Minimal key-value contract needed for locks, status and retry counters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write with expiry
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomic create-if-absent with expiry; `true` when the key was created
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomic increment, returning the new value
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Delete `key` only while it still holds `expected`.
    ///
    /// The default is a non-atomic get-then-delete; adapters with server-side
    /// scripting override it.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        match self.get(key).await? {
            Some(current) if current == expected => {
                self.delete(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Persisted job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
pub enum JobStatus {
    #[strum(serialize = "WAIT")]
    Waiting,
    #[strum(serialize = "OK")]
    Complete,
    #[strum(serialize = "FAIL")]
    Failed,
}

impl JobStatus {
    /// Parse a stored value; absent or unknown values read as `Waiting`
    pub fn from_stored(value: Option<&str>) -> Self {
        value
            .and_then(|v| v.parse().ok())
            .unwrap_or(JobStatus::Waiting)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

/// Store keys for one `(worker, jobId)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKeys {
    pub status: String,
    pub retry: String,
    pub lock: String,
}

impl JobKeys {
    pub fn new(worker: &str, job_id: &JobId) -> Self {
        Self {
            status: format!("status:{worker}:{job_id}"),
            retry: format!("retry:{worker}:{job_id}"),
            lock: format!("lock:{worker}:{job_id}"),
        }
    }
}
