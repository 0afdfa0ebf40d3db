//! Effectively-once execution on top of at-least-once delivery
//!
//! For every message carrying `meta._id` the guard keeps a status record, a
//! retry counter and a lock in the key-value store:
//!
//! - `FAIL` status: the message is reported unparseable and dead-lettered
//! - `OK` status: acknowledged without running
//! - lock held elsewhere: skipped, and dead-lettered when redelivered
//! - otherwise the handler runs under the lock
//!
//! Failures increment the retry counter. Once it reaches the retry limit (or
//! the failure is permanent) the job is marked `FAIL` and dead-lettered;
//! below the limit the message goes to the delayed destination, or back to the
//! queue when none is configured.
//!
//! Messages without a job id run unconditionally.

use crate::config::IdempotencyConfig;
use crate::envelope::JobId;
use crate::error::{ConsumerError, ParseError};
use crate::guard::{Decision, Disposition, ExecutionGuard, Outcome, SkipReason};
use crate::lifecycle::JobContext;
use crate::lock::JobLock;
use crate::store::{JobKeys, JobStatus, KeyValueStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// State handed from `check_and_prepare` to `finalize`
#[derive(Debug, Default)]
pub struct GuardTicket {
    keys: Option<JobKeys>,
    lock: Option<JobLock>,
}

impl GuardTicket {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

/// Deduplicating [`ExecutionGuard`] backed by a [`KeyValueStore`]
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn KeyValueStore>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn KeyValueStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Current status of a job, `Waiting` when unknown
    pub async fn status(&self, keys: &JobKeys) -> Result<JobStatus, ConsumerError> {
        let stored = self.store.get(&keys.status).await?;
        Ok(JobStatus::from_stored(stored.as_deref()))
    }

    async fn set_status(&self, keys: &JobKeys, status: JobStatus) -> Result<(), ConsumerError> {
        self.store
            .set(&keys.status, status.as_ref(), self.config.status_ttl)
            .await?;
        Ok(())
    }

    /// Create the status record and retry counter if this is the first sighting
    async fn register(&self, keys: &JobKeys) -> Result<(), ConsumerError> {
        let ttl = self.config.status_ttl;
        self.store
            .set_if_absent(&keys.status, JobStatus::Waiting.as_ref(), ttl)
            .await?;
        self.store.set_if_absent(&keys.retry, "0", ttl).await?;
        Ok(())
    }

    /// Decision for a job that already reached a terminal status
    async fn settled_decision(
        &self,
        keys: &JobKeys,
        job_id: &JobId,
    ) -> Result<Option<Decision>, ConsumerError> {
        let worker = &self.config.worker_id;
        let status = self.status(keys).await?;
        if !status.is_terminal() {
            return Ok(None);
        }
        match status {
            JobStatus::Failed => Ok(Some(Decision::Unparseable(ParseError::JobFailed {
                worker: worker.clone(),
                job_id: job_id.to_string(),
            }))),
            JobStatus::Complete => {
                info!(worker = %worker, job_id = %job_id, "Job already completed, skipping");
                Ok(Some(Decision::Skip(SkipReason::Complete)))
            }
            JobStatus::Waiting => Ok(None),
        }
    }

    async fn route(
        &self,
        ctx: &mut JobContext<'_>,
        keys: &JobKeys,
        outcome: &Outcome,
    ) -> Result<Disposition, ConsumerError> {
        let worker = &self.config.worker_id;

        match outcome {
            Outcome::Succeeded => {
                if ctx.mark_complete() {
                    self.set_status(keys, JobStatus::Complete).await?;
                    info!(worker = %worker, job_id = %display_id(ctx), "Job completed");
                }
                Ok(Disposition::Handled)
            }
            Outcome::Failed(err) => {
                let attempts = self.store.incr(&keys.retry).await?;
                let limit = i64::from(self.config.retry_limit);

                if err.is_permanent() || attempts >= limit {
                    self.set_status(keys, JobStatus::Failed).await?;
                    error!(
                        worker = %worker,
                        job_id = %display_id(ctx),
                        attempts,
                        retry_limit = limit,
                        category = %err.category(),
                        error = %err,
                        "Job failed, giving up"
                    );
                    ctx.dead_letter().await?;
                } else {
                    warn!(
                        worker = %worker,
                        job_id = %display_id(ctx),
                        attempts,
                        retry_limit = limit,
                        error = %err,
                        "Job failed, scheduling retry"
                    );
                    ctx.metrics().job_retried();
                    match &self.config.delayed_destination {
                        Some(destination) => ctx.publish_copy_to(destination).await?,
                        None => ctx.reject(true).await?,
                    }
                }
                Ok(Disposition::Handled)
            }
            Outcome::Skipped(_) | Outcome::Unparsed(_) => Ok(Disposition::Default),
        }
    }
}

fn display_id(ctx: &JobContext<'_>) -> String {
    ctx.job_id().map(ToString::to_string).unwrap_or_default()
}

#[async_trait]
impl ExecutionGuard for IdempotencyGuard {
    type Ticket = GuardTicket;

    async fn check_and_prepare(
        &self,
        ctx: &mut JobContext<'_>,
    ) -> Result<(Decision, GuardTicket), ConsumerError> {
        ctx.set_mark_complete(self.config.mark_complete);
        let worker = &self.config.worker_id;

        let Some(job_id) = ctx.job_id().cloned() else {
            warn!(
                worker = %worker,
                queue = %ctx.queue(),
                "Message has no job id, running without deduplication"
            );
            return Ok((Decision::Proceed, GuardTicket::default()));
        };

        let keys = JobKeys::new(worker, &job_id);
        self.register(&keys).await?;

        if let Some(decision) = self.settled_decision(&keys, &job_id).await? {
            let ticket = GuardTicket {
                keys: Some(keys),
                lock: None,
            };
            return Ok((decision, ticket));
        }

        let lock = JobLock::acquire(
            self.store.as_ref(),
            &keys.lock,
            worker,
            self.config.lock_ttl,
        )
        .await?;

        let Some(lock) = lock else {
            ctx.metrics().lock_contended();
            if ctx.is_redelivered() {
                error!(
                    worker = %worker,
                    job_id = %job_id,
                    lock = %keys.lock,
                    "Redelivered job is locked by another worker, dead-lettering"
                );
                ctx.dead_letter().await?;
            } else {
                info!(
                    worker = %worker,
                    job_id = %job_id,
                    lock = %keys.lock,
                    "Job is locked by another worker, skipping"
                );
            }
            let ticket = GuardTicket {
                keys: Some(keys),
                lock: None,
            };
            return Ok((Decision::Skip(SkipReason::Locked), ticket));
        };

        // The previous holder may have settled the job between our status read and the lock
        let settled = match self.settled_decision(&keys, &job_id).await {
            Ok(settled) => settled,
            Err(err) => {
                if let Err(release_err) = lock.release(self.store.as_ref()).await {
                    warn!(
                        worker = %worker,
                        job_id = %job_id,
                        error = %release_err,
                        "Failed to release lock after status check error"
                    );
                }
                return Err(err);
            }
        };

        if let Some(decision) = settled {
            lock.release(self.store.as_ref()).await?;
            let ticket = GuardTicket {
                keys: Some(keys),
                lock: None,
            };
            return Ok((decision, ticket));
        }

        Ok((
            Decision::Proceed,
            GuardTicket {
                keys: Some(keys),
                lock: Some(lock),
            },
        ))
    }

    async fn finalize(
        &self,
        ctx: &mut JobContext<'_>,
        ticket: GuardTicket,
        outcome: &Outcome,
    ) -> Result<Disposition, ConsumerError> {
        let GuardTicket { keys, lock } = ticket;
        let Some(keys) = keys else {
            return Ok(Disposition::Default);
        };

        let routed = self.route(ctx, &keys, outcome).await;

        let released = match lock {
            Some(lock) => lock.release(self.store.as_ref()).await.map(|_| ()),
            None => Ok(()),
        };

        let disposition = routed?;
        released?;
        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, Destination};
    use crate::codec;
    use crate::envelope::MessageEnvelope;
    use crate::error::{JobError, StoreError};
    use crate::lifecycle::Acknowledger;
    use crate::memory::{MemoryBroker, MemoryStore};
    use crate::metrics::ConsumerMetrics;
    use crate::publisher::Publisher;
    use crate::store::MockKeyValueStore;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        broker: Arc<MemoryBroker>,
        store: Arc<MemoryStore>,
        publisher: Publisher,
        metrics: ConsumerMetrics,
        failed: Destination,
    }

    impl Fixture {
        fn new() -> Self {
            let broker = Arc::new(MemoryBroker::new());
            Self {
                publisher: Publisher::new(broker.clone()),
                broker,
                store: Arc::new(MemoryStore::new()),
                metrics: ConsumerMetrics::new("jobs", "test"),
                failed: Destination::queue("jobs.failed"),
            }
        }

        fn guard(&self, config: IdempotencyConfig) -> IdempotencyGuard {
            IdempotencyGuard::new(self.store.clone(), config)
        }

        async fn envelope(&self, meta: serde_json::Value, redelivered: bool) -> MessageEnvelope {
            self.broker.consume("jobs", false).await.unwrap();
            let message = codec::encode(&meta, &json!({"n": 1})).unwrap();
            if redelivered {
                self.broker.push_redelivered("jobs", message.body);
            } else {
                self.broker.push_message("jobs", &message);
            }
            let delivery = self
                .broker
                .next_delivery(Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            codec::decode(delivery).unwrap()
        }
    }

    #[tokio::test]
    async fn test_first_sighting_registers_and_locks() {
        let fx = Fixture::new();
        let guard = fx.guard(IdempotencyConfig::new("mailer"));
        let envelope = fx.envelope(json!({"_id": "42"}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), envelope.handle(), true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &fx.publisher, &fx.metrics, "jobs", Some(&fx.failed));

        let (decision, ticket) = guard.check_and_prepare(&mut ctx).await.unwrap();
        assert!(matches!(decision, Decision::Proceed));
        assert!(ticket.is_locked());
        assert_eq!(fx.store.get("status:mailer:42").await.unwrap().as_deref(), Some("WAIT"));
        assert_eq!(fx.store.get("retry:mailer:42").await.unwrap().as_deref(), Some("0"));
        assert!(fx.store.get("lock:mailer:42").await.unwrap().is_some());

        let disposition = guard
            .finalize(&mut ctx, ticket, &Outcome::Succeeded)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Handled);
        assert_eq!(fx.store.get("status:mailer:42").await.unwrap().as_deref(), Some("OK"));
        assert!(fx.store.get("lock:mailer:42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_complete_disabled_keeps_waiting() {
        let fx = Fixture::new();
        let guard = fx.guard(IdempotencyConfig::new("mailer"));
        let envelope = fx.envelope(json!({"_id": "7"}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), envelope.handle(), true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &fx.publisher, &fx.metrics, "jobs", None);

        let (_, ticket) = guard.check_and_prepare(&mut ctx).await.unwrap();
        ctx.set_mark_complete(false);
        guard.finalize(&mut ctx, ticket, &Outcome::Succeeded).await.unwrap();

        assert_eq!(fx.store.get("status:mailer:7").await.unwrap().as_deref(), Some("WAIT"));
    }

    #[tokio::test]
    async fn test_failed_status_is_unparseable() {
        let fx = Fixture::new();
        fx.store
            .set("status:mailer:42", "FAIL", Duration::from_secs(60))
            .await
            .unwrap();
        let guard = fx.guard(IdempotencyConfig::new("mailer"));
        let envelope = fx.envelope(json!({"_id": "42"}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), envelope.handle(), true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &fx.publisher, &fx.metrics, "jobs", Some(&fx.failed));

        let (decision, ticket) = guard.check_and_prepare(&mut ctx).await.unwrap();
        assert!(matches!(decision, Decision::Unparseable(ParseError::JobFailed { .. })));
        assert!(!ticket.is_locked());
        assert!(fx.store.get("lock:mailer:42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_contention_split_on_redelivered() {
        let fx = Fixture::new();
        fx.store
            .set("lock:mailer:42", "someone-else", Duration::from_secs(60))
            .await
            .unwrap();
        let guard = fx.guard(IdempotencyConfig::new("mailer"));

        let fresh = fx.envelope(json!({"_id": "42"}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), fresh.handle(), true);
        let mut ctx = JobContext::new(&fresh, &mut acker, &fx.publisher, &fx.metrics, "jobs", Some(&fx.failed));
        let (decision, _) = guard.check_and_prepare(&mut ctx).await.unwrap();
        assert!(matches!(decision, Decision::Skip(SkipReason::Locked)));
        assert!(fx.broker.published_to(&fx.failed).is_empty());

        let redelivered = fx.envelope(json!({"_id": "42"}), true).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), redelivered.handle(), true);
        let mut ctx = JobContext::new(&redelivered, &mut acker, &fx.publisher, &fx.metrics, "jobs", Some(&fx.failed));
        let (decision, _) = guard.check_and_prepare(&mut ctx).await.unwrap();
        assert!(matches!(decision, Decision::Skip(SkipReason::Locked)));
        assert_eq!(fx.broker.published_to(&fx.failed).len(), 1);
        assert_eq!(
            fx.store.get("lock:mailer:42").await.unwrap().as_deref(),
            Some("someone-else")
        );
    }

    #[tokio::test]
    async fn test_transient_failure_goes_to_delayed_destination() {
        let fx = Fixture::new();
        let delayed = Destination::new("delayed", "jobs");
        let guard = fx.guard(
            IdempotencyConfig::new("mailer")
                .with_retry_limit(3)
                .with_delayed_destination(delayed.clone()),
        );
        let envelope = fx.envelope(json!({"_id": "42"}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), envelope.handle(), true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &fx.publisher, &fx.metrics, "jobs", Some(&fx.failed));

        let (_, ticket) = guard.check_and_prepare(&mut ctx).await.unwrap();
        let outcome = Outcome::Failed(JobError::transient("smtp timeout"));
        let disposition = guard.finalize(&mut ctx, ticket, &outcome).await.unwrap();

        assert_eq!(disposition, Disposition::Handled);
        assert_eq!(fx.store.get("retry:mailer:42").await.unwrap().as_deref(), Some("1"));
        assert_eq!(fx.store.get("status:mailer:42").await.unwrap().as_deref(), Some("WAIT"));
        let retried = fx.broker.published_to(&delayed);
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].body, envelope.raw_body());
        assert!(ctx.ack_state().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_without_delayed_destination_requeues() {
        let fx = Fixture::new();
        let guard = fx.guard(IdempotencyConfig::new("mailer"));
        let envelope = fx.envelope(json!({"_id": "42"}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), envelope.handle(), true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &fx.publisher, &fx.metrics, "jobs", None);

        let (_, ticket) = guard.check_and_prepare(&mut ctx).await.unwrap();
        let outcome = Outcome::Failed(JobError::transient("smtp timeout"));
        guard.finalize(&mut ctx, ticket, &outcome).await.unwrap();

        assert_eq!(
            ctx.ack_state(),
            Some(crate::lifecycle::AckState::Rejected { requeue: true })
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retry_budget() {
        let fx = Fixture::new();
        let guard = fx.guard(IdempotencyConfig::new("mailer").with_retry_limit(10));
        let envelope = fx.envelope(json!({"_id": "42"}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), envelope.handle(), true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &fx.publisher, &fx.metrics, "jobs", Some(&fx.failed));

        let (_, ticket) = guard.check_and_prepare(&mut ctx).await.unwrap();
        let outcome = Outcome::Failed(JobError::permanent("invalid address"));
        guard.finalize(&mut ctx, ticket, &outcome).await.unwrap();

        assert_eq!(fx.store.get("status:mailer:42").await.unwrap().as_deref(), Some("FAIL"));
        assert_eq!(fx.store.get("retry:mailer:42").await.unwrap().as_deref(), Some("1"));
        assert_eq!(fx.broker.published_to(&fx.failed).len(), 1);
        assert!(fx.store.get("lock:mailer:42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_degraded_mode_without_job_id() {
        let fx = Fixture::new();
        let guard = fx.guard(IdempotencyConfig::new("mailer"));
        let envelope = fx.envelope(json!({"_id": ""}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), envelope.handle(), true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &fx.publisher, &fx.metrics, "jobs", None);

        let (decision, ticket) = guard.check_and_prepare(&mut ctx).await.unwrap();
        assert!(matches!(decision, Decision::Proceed));
        assert!(!ticket.is_locked());

        let outcome = Outcome::Failed(JobError::transient("boom"));
        let disposition = guard.finalize(&mut ctx, ticket, &outcome).await.unwrap();
        assert_eq!(disposition, Disposition::Default);
    }

    #[tokio::test]
    async fn test_lock_released_when_status_write_fails() {
        let fx = Fixture::new();
        let mut store = MockKeyValueStore::new();
        store.expect_set_if_absent().returning(|_, _, _| Ok(true));
        store.expect_get().returning(|_| Ok(None));
        store
            .expect_set()
            .returning(|_, _, _| Err(StoreError::Unavailable("connection reset".to_string())));
        store
            .expect_delete_if_equals()
            .times(1)
            .returning(|_, _| Ok(true));

        let guard = IdempotencyGuard::new(Arc::new(store), IdempotencyConfig::new("mailer"));
        let envelope = fx.envelope(json!({"_id": "42"}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), envelope.handle(), true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &fx.publisher, &fx.metrics, "jobs", None);

        let (_, ticket) = guard.check_and_prepare(&mut ctx).await.unwrap();
        let err = guard
            .finalize(&mut ctx, ticket, &Outcome::Succeeded)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_completed_while_acquiring_lock_is_skipped() {
        let fx = Fixture::new();
        let mut store = MockKeyValueStore::new();
        let mut seq = mockall::Sequence::new();
        store.expect_set_if_absent().returning(|_, _, _| Ok(true));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some("WAIT".to_string())));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some("OK".to_string())));
        store
            .expect_delete_if_equals()
            .times(1)
            .returning(|_, _| Ok(true));

        let guard = IdempotencyGuard::new(Arc::new(store), IdempotencyConfig::new("mailer"));
        let envelope = fx.envelope(json!({"_id": "42"}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), envelope.handle(), true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &fx.publisher, &fx.metrics, "jobs", None);

        let (decision, ticket) = guard.check_and_prepare(&mut ctx).await.unwrap();
        assert!(matches!(decision, Decision::Skip(SkipReason::Complete)));
        assert!(!ticket.is_locked());
    }

    #[tokio::test]
    async fn test_lock_released_when_status_recheck_fails() {
        let fx = Fixture::new();
        let mut store = MockKeyValueStore::new();
        let mut seq = mockall::Sequence::new();
        store.expect_set_if_absent().returning(|_, _, _| Ok(true));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some("WAIT".to_string())));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(StoreError::Unavailable("connection reset".to_string())));
        store
            .expect_delete_if_equals()
            .withf(|key, _| key == "lock:mailer:42")
            .times(1)
            .returning(|_, _| Ok(true));

        let guard = IdempotencyGuard::new(Arc::new(store), IdempotencyConfig::new("mailer"));
        let envelope = fx.envelope(json!({"_id": "42"}), false).await;
        let mut acker = Acknowledger::new(fx.broker.clone(), envelope.handle(), true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &fx.publisher, &fx.metrics, "jobs", None);

        let err = guard.check_and_prepare(&mut ctx).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Store(StoreError::Unavailable(_))));
    }
}
