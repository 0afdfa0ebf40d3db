//! Consumer and idempotency configuration
//!
//! Both structs are built with `new` plus `with_*` setters, or loaded with
//! [`FromEnv`].

use crate::broker::Destination;
use core_config::{ConfigError, FromEnv, env_optional, env_parse, env_required};
use std::time::Duration;
use uuid::Uuid;

/// Default lock TTL: 180 days
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15_552_000);

/// Default status and retry-counter TTL: 24 hours
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(86_400);

pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Configuration for one [`JobConsumer`](crate::JobConsumer)
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to consume from
    pub queue: String,

    /// Unique consumer ID (auto-generated if not provided)
    pub consumer_id: String,

    /// Broker prefetch count
    pub prefetch: u16,

    /// Let the broker settle deliveries itself; ack/reject become no-ops
    pub no_ack: bool,

    /// Stop after this many messages (None = unlimited)
    pub max_processed: Option<u64>,

    /// Where unparseable and failed messages are copied
    pub failed_destination: Option<Destination>,

    /// Idle timeout for each `wait` call
    pub wait_timeout: Duration,
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            consumer_id: format!("consumer-{}", Uuid::new_v4()),
            prefetch: 1,
            no_ack: false,
            max_processed: None,
            failed_destination: None,
            wait_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    pub fn with_max_processed(mut self, max: u64) -> Self {
        self.max_processed = Some(max);
        self
    }

    pub fn with_failed_destination(mut self, destination: Destination) -> Self {
        self.failed_destination = Some(destination);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

impl FromEnv for ConsumerConfig {
    /// Reads from environment variables:
    /// - JOB_QUEUE: required
    /// - JOB_CONSUMER_ID: defaults to a generated id
    /// - JOB_PREFETCH: defaults to 1
    /// - JOB_NO_ACK: defaults to false
    /// - JOB_MAX_PROCESSED: defaults to -1 (unlimited)
    /// - JOB_FAILED_EXCHANGE / JOB_FAILED_ROUTING_KEY: unset by default
    /// - JOB_WAIT_TIMEOUT_SECS: defaults to 5
    fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(env_required("JOB_QUEUE")?);

        if let Some(id) = env_optional("JOB_CONSUMER_ID") {
            config.consumer_id = id;
        }
        config.prefetch = env_parse("JOB_PREFETCH", config.prefetch)?;
        config.no_ack = env_parse("JOB_NO_ACK", config.no_ack)?;
        config.max_processed = parse_max_processed(env_parse("JOB_MAX_PROCESSED", -1i64)?)?;
        config.failed_destination =
            destination_from_env("JOB_FAILED_EXCHANGE", "JOB_FAILED_ROUTING_KEY");
        config.wait_timeout = Duration::from_secs(env_parse("JOB_WAIT_TIMEOUT_SECS", 5u64)?);

        Ok(config)
    }
}

/// Configuration for [`IdempotencyGuard`](crate::IdempotencyGuard)
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Namespaces store keys; workers sharing an id deduplicate together
    pub worker_id: String,

    /// Failures allowed before the job is marked failed
    pub retry_limit: u32,

    pub lock_ttl: Duration,

    /// TTL of the status record and the retry counter
    pub status_ttl: Duration,

    /// Retry target for transient failures; requeue when unset
    pub delayed_destination: Option<Destination>,

    /// Initial per-message mark-complete flag
    pub mark_complete: bool,
}

impl IdempotencyConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            lock_ttl: DEFAULT_LOCK_TTL,
            status_ttl: DEFAULT_STATUS_TTL,
            delayed_destination: None,
            mark_complete: true,
        }
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    pub fn with_delayed_destination(mut self, destination: Destination) -> Self {
        self.delayed_destination = Some(destination);
        self
    }

    pub fn with_mark_complete(mut self, mark_complete: bool) -> Self {
        self.mark_complete = mark_complete;
        self
    }
}

impl FromEnv for IdempotencyConfig {
    /// Reads from environment variables:
    /// - JOB_WORKER_ID: required
    /// - JOB_RETRY_LIMIT: defaults to 3
    /// - JOB_LOCK_TTL_SECS: defaults to 15552000 (180 days)
    /// - JOB_STATUS_TTL_SECS: defaults to 86400 (24 hours)
    /// - JOB_DELAYED_EXCHANGE / JOB_DELAYED_ROUTING_KEY: unset by default
    /// - JOB_MARK_COMPLETE: defaults to true
    fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(env_required("JOB_WORKER_ID")?);

        config.retry_limit = env_parse("JOB_RETRY_LIMIT", config.retry_limit)?;
        config.lock_ttl = Duration::from_secs(env_parse(
            "JOB_LOCK_TTL_SECS",
            DEFAULT_LOCK_TTL.as_secs(),
        )?);
        config.status_ttl = Duration::from_secs(env_parse(
            "JOB_STATUS_TTL_SECS",
            DEFAULT_STATUS_TTL.as_secs(),
        )?);
        config.delayed_destination =
            destination_from_env("JOB_DELAYED_EXCHANGE", "JOB_DELAYED_ROUTING_KEY");
        config.mark_complete = env_parse("JOB_MARK_COMPLETE", config.mark_complete)?;

        Ok(config)
    }
}

/// `-1` means unlimited; any other negative value is rejected
fn parse_max_processed(raw: i64) -> Result<Option<u64>, ConfigError> {
    match raw {
        -1 => Ok(None),
        n if n < 0 => Err(ConfigError::ParseError {
            key: "JOB_MAX_PROCESSED".to_string(),
            details: format!("expected -1 or a non-negative count, got {n}"),
        }),
        n => Ok(Some(n as u64)),
    }
}

fn destination_from_env(exchange_key: &str, routing_key: &str) -> Option<Destination> {
    let exchange = env_optional(exchange_key);
    let routing = env_optional(routing_key);
    if exchange.is_none() && routing.is_none() {
        return None;
    }
    Some(Destination::new(
        exchange.unwrap_or_default(),
        routing.unwrap_or_default(),
    ))
}
