//! The job consumer loop
//!
//! [`JobConsumer`] owns one [`ConsumerSession`], a [`JobHandler`] and an
//! [`ExecutionGuard`]. Each [`wait`](JobConsumer::wait) call receives one
//! delivery and drives it through:
//!
//! 1. decode into a [`MessageEnvelope`](crate::MessageEnvelope) (dead-letter on failure)
//! 2. guard check
//! 3. `before_run`, `run`, `after_run`
//! 4. guard finalize, then default routing unless the guard handled it
//! 5. ack (a no-op if the message was already settled)
//! 6. post-processing callback and processed-count check
//!
//! Store and broker failures escape `wait` after the delivery was rejected
//! with requeue.

use crate::broker::{Broker, Destination};
use crate::codec::{self, Unparsed};
use crate::config::ConsumerConfig;
use crate::envelope::{Delivery, JobId};
use crate::error::ConsumerError;
use crate::guard::{Decision, Disposition, ExecutionGuard, Outcome, PassThrough};
use crate::lifecycle::{self, Acknowledger, JobContext, JobHandler};
use crate::metrics::ConsumerMetrics;
use crate::publisher::Publisher;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Mutable per-consumer state
#[derive(Debug, Clone, Default)]
pub struct ConsumerSession {
    processed_count: u64,
    max_processed: Option<u64>,
    prefetch: Option<u16>,
    consuming_queue: Option<String>,
    expecting_ack: bool,
    failed_destination: Option<Destination>,
}

impl ConsumerSession {
    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    pub fn max_processed(&self) -> Option<u64> {
        self.max_processed
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.prefetch
    }

    pub fn consuming_queue(&self) -> Option<&str> {
        self.consuming_queue.as_deref()
    }

    pub fn expecting_ack(&self) -> bool {
        self.expecting_ack
    }

    pub fn failed_destination(&self) -> Option<&Destination> {
        self.failed_destination.as_ref()
    }
}

/// How one message ended, as seen by the post-processing callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedStatus {
    Succeeded,
    Failed,
    Skipped,
    Unparsed,
}

/// Summary passed to the post-processing callback
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub job_id: Option<JobId>,
    pub status: ProcessedStatus,
    /// Messages handled so far, this one included
    pub processed_count: u64,
}

type AfterProcessing = Box<dyn FnMut(&ProcessedMessage) + Send + Sync>;

struct Report {
    job_id: Option<JobId>,
    status: ProcessedStatus,
    response: Option<Value>,
}

/// Queue consumer running a [`JobHandler`] behind an [`ExecutionGuard`].
pub struct JobConsumer<H, G = PassThrough> {
    broker: Arc<dyn Broker>,
    publisher: Publisher,
    handler: H,
    guard: G,
    config: ConsumerConfig,
    session: ConsumerSession,
    metrics: ConsumerMetrics,
    after_processing: Option<AfterProcessing>,
    last_response: Option<Value>,
}

impl<H: JobHandler> JobConsumer<H, PassThrough> {
    pub fn new(broker: Arc<dyn Broker>, handler: H, config: ConsumerConfig) -> Self {
        let metrics = ConsumerMetrics::new(config.queue.clone(), handler.name());
        let session = ConsumerSession {
            max_processed: config.max_processed,
            failed_destination: config.failed_destination.clone(),
            ..ConsumerSession::default()
        };

        Self {
            publisher: Publisher::new(broker.clone()),
            broker,
            handler,
            guard: PassThrough,
            config,
            session,
            metrics,
            after_processing: None,
            last_response: None,
        }
    }
}

impl<H, G> JobConsumer<H, G>
where
    H: JobHandler,
    G: ExecutionGuard,
{
    /// Replace the execution guard
    pub fn with_guard<T: ExecutionGuard>(self, guard: T) -> JobConsumer<H, T> {
        JobConsumer {
            broker: self.broker,
            publisher: self.publisher,
            handler: self.handler,
            guard,
            config: self.config,
            session: self.session,
            metrics: self.metrics,
            after_processing: self.after_processing,
            last_response: self.last_response,
        }
    }

    /// Callback fired after every handled message, before the count check
    pub fn on_processed<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&ProcessedMessage) + Send + Sync + 'static,
    {
        self.after_processing = Some(Box::new(callback));
        self
    }

    /// Register with the broker. With `no_ack`, ack and reject become no-ops.
    pub async fn consume(&mut self, queue: &str, no_ack: bool) -> Result<(), ConsumerError> {
        self.broker.consume(queue, no_ack).await?;
        self.session.consuming_queue = Some(queue.to_string());
        self.session.expecting_ack = !no_ack;

        info!(
            queue = %queue,
            consumer_id = %self.config.consumer_id,
            handler = %self.handler.name(),
            no_ack,
            "Consuming"
        );
        Ok(())
    }

    /// Apply the configured prefetch, then consume the configured queue
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        self.set_prefetch(self.config.prefetch).await?;
        let queue = self.config.queue.clone();
        self.consume(&queue, self.config.no_ack).await
    }

    pub async fn set_prefetch(&mut self, count: u16) -> Result<(), ConsumerError> {
        self.broker.set_prefetch(count).await?;
        self.session.prefetch = Some(count);
        Ok(())
    }

    /// Whether the broker is still consuming
    pub fn has_more(&self) -> bool {
        self.broker.is_consuming()
    }

    pub fn session(&self) -> &ConsumerSession {
        &self.session
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Response set by the handler for the most recent message
    pub fn last_response(&self) -> Option<&Value> {
        self.last_response.as_ref()
    }

    /// Publish an arbitrary `{meta, data}` envelope
    pub async fn publish_message<D, M>(
        &self,
        data: &D,
        destination: &Destination,
        meta: &M,
    ) -> Result<(), ConsumerError>
    where
        D: Serialize + ?Sized + Sync,
        M: Serialize + ?Sized + Sync,
    {
        self.publisher.send(data, destination, meta).await
    }

    /// Receive and fully handle one delivery.
    ///
    /// Fails with [`ConsumerError::Timeout`] when nothing arrives in time and
    /// with [`ConsumerError::ProcessedLimitExceeded`] right after the message
    /// that reached the configured limit was acknowledged.
    pub async fn wait(&mut self, timeout: Duration) -> Result<(), ConsumerError> {
        let delivery = self.receive(timeout).await?;
        self.handle(delivery).await
    }

    /// Run until the processed limit, the broker stops consuming, or `shutdown`
    /// flips to `true`. Returns the number of handled messages.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<u64, ConsumerError> {
        let timeout = self.config.wait_timeout;

        while self.has_more() {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping consumer");
                break;
            }

            let received = tokio::select! {
                received = self.receive(timeout) => received,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, stopping consumer");
                        break;
                    }
                    continue;
                }
            };

            let delivery = match received {
                Ok(delivery) => delivery,
                Err(ConsumerError::Timeout(_)) => {
                    debug!("No message within timeout, waiting again");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.handle(delivery).await {
                Ok(()) => {}
                Err(ConsumerError::ProcessedLimitExceeded { limit }) => {
                    info!(limit, "Processed message limit reached, stopping consumer");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            processed = self.session.processed_count,
            "Job consumer stopped"
        );
        Ok(self.session.processed_count)
    }

    async fn receive(&self, timeout: Duration) -> Result<Delivery, ConsumerError> {
        if self.session.consuming_queue.is_none() {
            return Err(ConsumerError::NotConsuming);
        }
        self.broker
            .next_delivery(timeout)
            .await?
            .ok_or(ConsumerError::Timeout(timeout))
    }

    async fn handle(&mut self, delivery: Delivery) -> Result<(), ConsumerError> {
        self.metrics.message_received();
        let mut acker = Acknowledger::new(
            self.broker.clone(),
            delivery.handle,
            self.session.expecting_ack,
        );

        let report = match self.process(delivery, &mut acker).await {
            Ok(report) => report,
            Err(err) => {
                if let Err(reject_err) = acker.reject(true).await {
                    warn!(error = %reject_err, "Failed to requeue message after error");
                }
                return Err(err);
            }
        };

        acker.ack().await?;
        self.last_response = report.response;
        self.session.processed_count += 1;

        let processed = ProcessedMessage {
            job_id: report.job_id,
            status: report.status,
            processed_count: self.session.processed_count,
        };
        if let Some(callback) = self.after_processing.as_mut() {
            callback(&processed);
        }

        match self.session.max_processed {
            Some(limit) if self.session.processed_count >= limit => {
                Err(ConsumerError::ProcessedLimitExceeded { limit })
            }
            _ => Ok(()),
        }
    }

    async fn process(
        &self,
        delivery: Delivery,
        acker: &mut Acknowledger,
    ) -> Result<Report, ConsumerError> {
        let queue = self.session.consuming_queue.as_deref().unwrap_or_default();

        let envelope = match codec::decode(delivery) {
            Ok(envelope) => envelope,
            Err(Unparsed { error, delivery }) => {
                error!(
                    queue = %queue,
                    delivery_tag = delivery.handle.tag(),
                    error = %error,
                    "Message cannot be parsed"
                );
                self.metrics.job_skipped("unparsed");
                if let Some(destination) = &self.session.failed_destination {
                    self.publisher.publish_copy(&delivery, destination).await?;
                    self.metrics.message_dead_lettered();
                }
                return Ok(Report {
                    job_id: None,
                    status: ProcessedStatus::Unparsed,
                    response: None,
                });
            }
        };

        let mut ctx = JobContext::new(
            &envelope,
            acker,
            &self.publisher,
            &self.metrics,
            queue,
            self.session.failed_destination.as_ref(),
        );

        let (decision, ticket) = self.guard.check_and_prepare(&mut ctx).await?;
        let outcome = match decision {
            Decision::Proceed => {
                let started = Instant::now();
                match lifecycle::run_hooks(&self.handler, &mut ctx).await {
                    Ok(()) => {
                        self.metrics.job_succeeded(started.elapsed());
                        Outcome::Succeeded
                    }
                    Err(err) => {
                        self.metrics.job_failed(&err.category().to_string());
                        Outcome::Failed(err)
                    }
                }
            }
            Decision::Skip(reason) => {
                self.metrics.job_skipped(reason.as_ref());
                Outcome::Skipped(reason)
            }
            Decision::Unparseable(err) => Outcome::Unparsed(err),
        };

        let disposition = self.guard.finalize(&mut ctx, ticket, &outcome).await?;
        if disposition == Disposition::Default {
            self.route_failure(&ctx, &outcome).await?;
        }

        let status = match outcome {
            Outcome::Succeeded => ProcessedStatus::Succeeded,
            Outcome::Failed(_) => ProcessedStatus::Failed,
            Outcome::Skipped(_) => ProcessedStatus::Skipped,
            Outcome::Unparsed(_) => ProcessedStatus::Unparsed,
        };
        Ok(Report {
            job_id: envelope.job_id().cloned(),
            status,
            response: ctx.take_response(),
        })
    }

    /// Default routing: log and dead-letter failed or unparseable messages
    async fn route_failure(
        &self,
        ctx: &JobContext<'_>,
        outcome: &Outcome,
    ) -> Result<(), ConsumerError> {
        let job_id = ctx.job_id().map(ToString::to_string).unwrap_or_default();

        match outcome {
            Outcome::Failed(err) => {
                error!(
                    handler = %self.handler.name(),
                    job_id = %job_id,
                    category = %err.category(),
                    error = %err,
                    "Job failed"
                );
                ctx.dead_letter().await
            }
            Outcome::Unparsed(err) => {
                error!(
                    handler = %self.handler.name(),
                    job_id = %job_id,
                    error = %err,
                    "Message cannot be processed"
                );
                ctx.dead_letter().await
            }
            Outcome::Succeeded | Outcome::Skipped(_) => Ok(()),
        }
    }
}
