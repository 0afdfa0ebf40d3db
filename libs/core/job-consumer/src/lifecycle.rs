//! Per-message lifecycle: acknowledgement, handler context and hooks
//!
//! Every delivery gets exactly one ack or reject. [`Acknowledger`] enforces
//! this: the first settlement is sent to the broker, any later call is a
//! no-op. When the consumer was registered with `no_ack`, nothing is ever
//! sent.

use crate::broker::{Broker, Destination};
use crate::codec;
use crate::envelope::{DeliveryHandle, JobId, MessageEnvelope};
use crate::error::{BrokerError, ConsumerError, JobError};
use crate::metrics::ConsumerMetrics;
use crate::publisher::Publisher;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Acked,
    Rejected { requeue: bool },
}

/// Idempotent ack/reject for one delivery.
pub struct Acknowledger {
    broker: Arc<dyn Broker>,
    handle: DeliveryHandle,
    expecting_ack: bool,
    state: Option<AckState>,
}

impl Acknowledger {
    pub fn new(broker: Arc<dyn Broker>, handle: DeliveryHandle, expecting_ack: bool) -> Self {
        Self {
            broker,
            handle,
            expecting_ack,
            state: None,
        }
    }

    pub async fn ack(&mut self) -> Result<(), BrokerError> {
        self.settle(AckState::Acked).await
    }

    pub async fn reject(&mut self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(AckState::Rejected { requeue }).await
    }

    pub fn state(&self) -> Option<AckState> {
        self.state
    }

    pub fn is_settled(&self) -> bool {
        self.state.is_some()
    }

    async fn settle(&mut self, decision: AckState) -> Result<(), BrokerError> {
        if let Some(previous) = self.state {
            debug!(
                delivery_tag = self.handle.tag(),
                previous = ?previous,
                ignored = ?decision,
                "Delivery already settled"
            );
            return Ok(());
        }
        self.state = Some(decision);

        if !self.expecting_ack {
            return Ok(());
        }
        match decision {
            AckState::Acked => self.broker.ack(self.handle).await,
            AckState::Rejected { requeue } => self.broker.reject(self.handle, requeue).await,
        }
    }
}

/// Everything a handler (and the execution guard) may do with the current
/// message.
pub struct JobContext<'a> {
    envelope: &'a MessageEnvelope,
    acker: &'a mut Acknowledger,
    publisher: &'a Publisher,
    metrics: &'a ConsumerMetrics,
    queue: &'a str,
    failed_destination: Option<&'a Destination>,
    mark_complete: bool,
    response: Option<Value>,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(
        envelope: &'a MessageEnvelope,
        acker: &'a mut Acknowledger,
        publisher: &'a Publisher,
        metrics: &'a ConsumerMetrics,
        queue: &'a str,
        failed_destination: Option<&'a Destination>,
    ) -> Self {
        Self {
            envelope,
            acker,
            publisher,
            metrics,
            queue,
            failed_destination,
            mark_complete: true,
            response: None,
        }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        self.envelope
    }

    pub fn meta(&self) -> &Value {
        self.envelope.meta()
    }

    pub fn data(&self) -> &Value {
        self.envelope.data()
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.envelope.job_id()
    }

    pub fn is_redelivered(&self) -> bool {
        self.envelope.is_redelivered()
    }

    /// Queue this message was consumed from
    pub fn queue(&self) -> &str {
        self.queue
    }

    pub async fn ack(&mut self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(&mut self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }

    pub fn ack_state(&self) -> Option<AckState> {
        self.acker.state()
    }

    /// Whether a successful run marks the job complete (default `true`).
    ///
    /// Reset per message.
    pub fn set_mark_complete(&mut self, mark_complete: bool) {
        self.mark_complete = mark_complete;
    }

    pub fn mark_complete(&self) -> bool {
        self.mark_complete
    }

    pub fn set_response(&mut self, response: Value) {
        self.response = Some(response);
    }

    pub fn response(&self) -> Option<&Value> {
        self.response.as_ref()
    }

    pub(crate) fn take_response(&mut self) -> Option<Value> {
        self.response.take()
    }

    pub(crate) fn metrics(&self) -> &ConsumerMetrics {
        self.metrics
    }

    /// Publish the current `{meta, data}` to another destination
    pub async fn forward_to(&self, destination: &Destination) -> Result<(), ConsumerError> {
        let message = codec::encode(self.envelope.meta(), self.envelope.data())?;
        self.publisher.publish(&message, destination).await
    }

    /// Ack the current delivery and put its `{meta, data}` back on the
    /// consuming queue.
    pub async fn republish(&mut self) -> Result<(), ConsumerError> {
        self.acker.ack().await?;
        self.forward_to(&Destination::queue(self.queue)).await
    }

    /// Publish an unchanged copy of the delivery to `destination`
    pub async fn publish_copy_to(&self, destination: &Destination) -> Result<(), ConsumerError> {
        self.publisher
            .publish_copy(self.envelope.delivery(), destination)
            .await
    }

    /// Copy the delivery to the failed-message destination, if one is set
    pub async fn dead_letter(&self) -> Result<(), ConsumerError> {
        let Some(destination) = self.failed_destination else {
            warn!(
                queue = %self.queue,
                delivery_tag = self.envelope.handle().tag(),
                "No failed destination configured, dropping message"
            );
            return Ok(());
        };
        self.publish_copy_to(destination).await?;
        self.metrics.message_dead_lettered();
        Ok(())
    }
}

/// Business logic bound to a consumer.
///
/// `before_run`, `run` and `after_run` execute in that order. An error from
/// any of them counts as a failure of the job.
///
/// # Example
///
/// ```rust,ignore
/// struct SendWelcomeEmail { mailer: Mailer }
///
/// #[async_trait]
/// impl JobHandler for SendWelcomeEmail {
///     async fn run(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
///         let email = ctx.envelope().data_fields().str(&["email"])?;
///         self.mailer.send(email).await.map_err(|e| JobError::transient(e.to_string()))
///     }
///
///     fn name(&self) -> &'static str {
///         "send_welcome_email"
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError>;

    /// Used for logging and metrics labels.
    fn name(&self) -> &'static str {
        "job"
    }

    async fn before_run(&self, _ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        Ok(())
    }

    async fn after_run(&self, _ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        Ok(())
    }
}

pub(crate) async fn run_hooks<H>(handler: &H, ctx: &mut JobContext<'_>) -> Result<(), JobError>
where
    H: JobHandler + ?Sized,
{
    handler.before_run(ctx).await?;
    handler.run(ctx).await?;
    handler.after_run(ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::codec;
    use crate::envelope::Delivery;
    use crate::memory::{MemoryBroker, Settlement};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_settlement_is_not_sent() {
        let mut broker = MockBroker::new();
        broker.expect_ack().times(1).returning(|_| Ok(()));
        broker.expect_reject().never();

        let mut acker = Acknowledger::new(Arc::new(broker), DeliveryHandle::new(3), true);
        acker.ack().await.unwrap();
        acker.ack().await.unwrap();
        acker.reject(true).await.unwrap();

        assert_eq!(acker.state(), Some(AckState::Acked));
    }

    #[tokio::test]
    async fn test_no_ack_mode_sends_nothing() {
        let mut broker = MockBroker::new();
        broker.expect_ack().never();
        broker.expect_reject().never();

        let mut acker = Acknowledger::new(Arc::new(broker), DeliveryHandle::new(3), false);
        acker.reject(false).await.unwrap();
        assert!(acker.is_settled());
    }

    #[tokio::test]
    async fn test_republish_acks_and_requeues_payload() {
        let broker = Arc::new(MemoryBroker::new());
        broker.consume("jobs", false).await.unwrap();
        let message = codec::encode(&json!({"_id": "1"}), &json!({"n": 1})).unwrap();
        broker.push_message("jobs", &message);
        let delivery: Delivery = broker
            .next_delivery(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let handle = delivery.handle;
        let envelope = codec::decode(delivery).unwrap();

        let publisher = Publisher::new(broker.clone());
        let metrics = ConsumerMetrics::new("jobs", "test");
        let mut acker = Acknowledger::new(broker.clone(), handle, true);
        let mut ctx = JobContext::new(&envelope, &mut acker, &publisher, &metrics, "jobs", None);

        ctx.republish().await.unwrap();
        ctx.ack().await.unwrap();

        assert_eq!(broker.settlements(), vec![Settlement::Ack(handle)]);
        assert_eq!(broker.queue_len("jobs"), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_without_destination_is_noop() {
        let broker = Arc::new(MemoryBroker::new());
        let envelope =
            codec::decode(Delivery::new(DeliveryHandle::new(1), br#"{"meta":{},"data":1}"#.to_vec()))
                .unwrap();
        let publisher = Publisher::new(broker.clone());
        let metrics = ConsumerMetrics::new("jobs", "test");
        let mut acker = Acknowledger::new(broker.clone(), envelope.handle(), true);
        let ctx = JobContext::new(&envelope, &mut acker, &publisher, &metrics, "jobs", None);

        ctx.dead_letter().await.unwrap();
        assert!(broker.published().is_empty());
    }
}
