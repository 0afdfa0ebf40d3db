//! Message broker collaborator
//!
//! The consumer only talks to the queue through [`Broker`]. Adapters live in
//! [`crate::memory`] (tests, local runs) and `crate::amqp` (feature `amqp`).

use crate::envelope::{Delivery, DeliveryHandle, OutgoingMessage};
use crate::error::BrokerError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Publish target: an exchange plus a routing key.
///
/// The empty exchange is the broker's default exchange, which routes
/// directly to the queue named by the routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    exchange: String,
    routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Route straight to `queue` through the default exchange
    pub fn queue(queue: impl Into<String>) -> Self {
        Self::new("", queue)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn is_default_exchange(&self) -> bool {
        self.exchange.is_empty()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exchange.is_empty() {
            write!(f, "(default)/{}", self.routing_key)
        } else {
            write!(f, "{}/{}", self.exchange, self.routing_key)
        }
    }
}

/// Queue client used by the consumer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Start consuming `queue`; with `no_ack` the broker settles deliveries itself
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<(), BrokerError>;

    /// Next delivery, or `None` once `timeout` elapses without one
    async fn next_delivery(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, handle: DeliveryHandle) -> Result<(), BrokerError>;

    async fn reject(&self, handle: DeliveryHandle, requeue: bool) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        message: &OutgoingMessage,
        destination: &Destination,
    ) -> Result<(), BrokerError>;

    /// Per-consumer prefetch (QoS)
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Whether a consumer is registered and the channel is still open
    fn is_consuming(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_display() {
        assert_eq!(Destination::queue("jobs").to_string(), "(default)/jobs");
        assert_eq!(
            Destination::new("retry", "jobs.delayed").to_string(),
            "retry/jobs.delayed"
        );
        assert!(Destination::queue("jobs").is_default_exchange());
    }
}
