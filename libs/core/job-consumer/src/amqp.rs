//! AMQP (RabbitMQ) [`Broker`] adapter over `lapin`
//!
//! One connection, one channel. Deliveries are pulled from the channel's
//! consumer stream with a per-call timeout; ack and reject go through the
//! channel by delivery tag.

use crate::broker::{Broker, Destination};
use crate::envelope::{Delivery, DeliveryHandle, MessageProperties, OutgoingMessage};
use crate::error::BrokerError;
use async_trait::async_trait;
use core_config::amqp::AmqpConfig;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PERSISTENT: u8 = 2;

/// RabbitMQ broker connection
pub struct AmqpBroker {
    // Closing the connection closes the channel
    _connection: Connection,
    channel: Channel,
    consumer: Mutex<Option<Consumer>>,
    consumer_tag: String,
    consuming: AtomicBool,
}

impl AmqpBroker {
    pub async fn connect(config: &AmqpConfig) -> Result<Self, BrokerError> {
        let connection = Connection::connect(&config.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))?;

        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            "Connected to AMQP"
        );

        Ok(Self {
            _connection: connection,
            channel,
            consumer: Mutex::new(None),
            consumer_tag: format!("job-consumer-{}", Uuid::new_v4()),
            consuming: AtomicBool::new(false),
        })
    }

    /// Declare a durable queue
    pub async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to declare queue: {}", e)))?;
        debug!(queue = %queue, "Queue declared");
        Ok(())
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_content_type("application/json".into());
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT);
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    basic
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = MessageProperties {
        persistent: *delivery.properties.delivery_mode() == Some(PERSISTENT),
        priority: *delivery.properties.priority(),
    };
    Delivery::new(DeliveryHandle::new(delivery.delivery_tag), delivery.data)
        .redelivered(delivery.redelivered)
        .with_properties(properties)
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<(), BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        *self.consumer.lock().await = Some(consumer);
        self.consuming.store(true, Ordering::SeqCst);
        info!(queue = %queue, consumer_tag = %self.consumer_tag, "AMQP consumer started");
        Ok(())
    }

    async fn next_delivery(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let mut guard = self.consumer.lock().await;
        let consumer = guard
            .as_mut()
            .ok_or_else(|| BrokerError::Consume("no consumer registered".to_string()))?;

        match tokio::time::timeout(timeout, consumer.next()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(delivery))) => Ok(Some(into_delivery(delivery))),
            Ok(Some(Err(e))) => Err(BrokerError::Consume(format!("Delivery error: {}", e))),
            Ok(None) => {
                warn!(consumer_tag = %self.consumer_tag, "AMQP consumer stream ended");
                self.consuming.store(false, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    async fn ack(&self, handle: DeliveryHandle) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(handle.tag(), BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, handle: DeliveryHandle, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(handle.tag(), BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Ack(format!("Failed to reject: {}", e)))
    }

    async fn publish(
        &self,
        message: &OutgoingMessage,
        destination: &Destination,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                destination.exchange(),
                destination.routing_key(),
                BasicPublishOptions::default(),
                &message.body,
                basic_properties(&message.properties),
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to set prefetch: {}", e)))
    }

    fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst) && self.channel.status().connected()
    }
}
