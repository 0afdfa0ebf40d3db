//! Envelope publisher
//!
//! Thin layer over [`Broker::publish`] that encodes `{meta, data}` and sends
//! it to a destination.

use crate::broker::{Broker, Destination};
use crate::codec;
use crate::envelope::{Delivery, OutgoingMessage};
use crate::error::ConsumerError;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Publishes job envelopes through a broker
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Encode `{meta, data}` as a persistent message and publish it.
    pub async fn send<D, M>(
        &self,
        data: &D,
        destination: &Destination,
        meta: &M,
    ) -> Result<(), ConsumerError>
    where
        D: Serialize + ?Sized + Sync,
        M: Serialize + ?Sized + Sync,
    {
        let message = codec::encode(meta, data)?;
        self.publish(&message, destination).await
    }

    /// Publish an already encoded message
    pub async fn publish(
        &self,
        message: &OutgoingMessage,
        destination: &Destination,
    ) -> Result<(), ConsumerError> {
        self.broker.publish(message, destination).await?;
        debug!(
            destination = %destination,
            bytes = message.body.len(),
            "Message published"
        );
        Ok(())
    }

    /// Publish an unchanged copy of a delivery, body and properties included
    pub async fn publish_copy(
        &self,
        delivery: &Delivery,
        destination: &Destination,
    ) -> Result<(), ConsumerError> {
        self.publish(&OutgoingMessage::copy_of(delivery), destination)
            .await
    }
}
