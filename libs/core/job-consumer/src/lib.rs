//! Job Consumer Framework
//!
//! Consumes JSON job messages from a broker queue, runs a handler per message
//! and settles each delivery exactly once.
//!
//! ## Features
//!
//! - **Envelope codec**: `{"meta": {...}, "data": {...}}` bodies with `meta._id` as job id
//! - **Consumer lifecycle**: prefetch, bounded waits, processed-count limit, graceful shutdown
//! - **Idempotency guard**: per-job status, retry counter and lock in a key-value store
//! - **Dead lettering**: unparseable and exhausted jobs go to a failed destination
//! - **Publisher**: send new jobs or forward copies to another exchange
//! - **Prometheus metrics**: Built-in observability
//! - **Adapters**: Redis store, AMQP broker, in-memory broker and store for tests
//!
//! ## Example
//!
//! ```ignore
//! use job_consumer::{
//!     ConsumerConfig, IdempotencyConfig, IdempotencyGuard, JobConsumer, JobContext, JobError,
//!     JobHandler,
//! };
//!
//! struct SendEmail;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for SendEmail {
//!     fn name(&self) -> &'static str {
//!         "send_email"
//!     }
//!
//!     async fn run(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
//!         let to = ctx.envelope().data_fields().str(&["to"])?;
//!         // ... deliver ...
//!         Ok(())
//!     }
//! }
//!
//! let guard = IdempotencyGuard::new(store, IdempotencyConfig::new("mailer"));
//! let mut consumer = JobConsumer::new(broker, SendEmail, ConsumerConfig::new("emails"))
//!     .with_guard(guard);
//! consumer.start().await?;
//! consumer.run(shutdown_rx).await?;
//! ```

mod access;
#[cfg(feature = "amqp")]
mod amqp;
mod broker;
pub mod codec;
mod config;
mod consumer;
mod envelope;
mod error;
mod guard;
mod idempotency;
mod lifecycle;
mod lock;
mod memory;
pub mod metrics;
mod publisher;
#[cfg(feature = "redis")]
mod redis_store;
mod store;

// Re-export main types
pub use access::Fields;
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use broker::{Broker, Destination};
pub use config::{
    ConsumerConfig, DEFAULT_LOCK_TTL, DEFAULT_RETRY_LIMIT, DEFAULT_STATUS_TTL, IdempotencyConfig,
};
pub use consumer::{ConsumerSession, JobConsumer, ProcessedMessage, ProcessedStatus};
pub use envelope::{
    Delivery, DeliveryHandle, JobId, MessageEnvelope, MessageProperties, OutgoingMessage,
};
pub use error::{
    AccessError, BrokerError, CodecError, ConsumerError, ErrorCategory, JobError, ParseError,
    StoreError,
};
pub use guard::{Decision, Disposition, ExecutionGuard, Outcome, PassThrough, SkipReason};
pub use idempotency::{GuardTicket, IdempotencyGuard};
pub use lifecycle::{AckState, Acknowledger, JobContext, JobHandler};
pub use lock::JobLock;
pub use memory::{MemoryBroker, MemoryStore, Settlement};
pub use metrics::{ConsumerMetrics, init_metrics};
pub use publisher::Publisher;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use store::{JobKeys, JobStatus, KeyValueStore};
