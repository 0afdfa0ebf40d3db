//! Delivered messages and their parsed `{meta, data}` view
//!
//! A [`Delivery`] is what the broker hands over: raw bytes plus delivery
//! metadata. A [`MessageEnvelope`] is the parsed, immutable view of one
//! delivery and is rebuilt from scratch for every message.

use crate::access::Fields;
use serde_json::Value;
use std::fmt;

/// Opaque broker delivery tag used to ack or reject one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(u64);

impl DeliveryHandle {
    pub fn new(tag: u64) -> Self {
        Self(tag)
    }

    pub fn tag(&self) -> u64 {
        self.0
    }
}

/// Broker-level message properties carried alongside the body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Survive a broker restart (AMQP delivery mode 2)
    pub persistent: bool,

    /// Broker priority, 1..=255
    pub priority: Option<u8>,
}

/// One message as delivered by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub properties: MessageProperties,
}

impl Delivery {
    pub fn new(handle: DeliveryHandle, body: impl Into<Vec<u8>>) -> Self {
        Self {
            handle,
            body: body.into(),
            redelivered: false,
            properties: MessageProperties::default(),
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// A message ready to be handed to the broker for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Vec<u8>>, properties: MessageProperties) -> Self {
        Self {
            body: body.into(),
            properties,
        }
    }

    /// Byte-for-byte copy of a delivered message, properties included
    pub fn copy_of(delivery: &Delivery) -> Self {
        Self {
            body: delivery.body.clone(),
            properties: delivery.properties.clone(),
        }
    }
}

/// Stable job identifier taken from `meta._id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Reads `_id` from `meta`; strings and integers qualify, `""` does not.
    pub fn from_meta(meta: &Value) -> Option<Self> {
        match meta.get(crate::codec::JOB_ID_FIELD)? {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed view of one delivered message.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    meta: Value,
    data: Value,
    job_id: Option<JobId>,
    delivery: Delivery,
}

impl MessageEnvelope {
    pub(crate) fn new(meta: Value, data: Value, delivery: Delivery) -> Self {
        let job_id = JobId::from_meta(&meta);
        Self {
            meta,
            data,
            job_id,
            delivery,
        }
    }

    pub fn meta(&self) -> &Value {
        &self.meta
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Typed access into `meta`
    pub fn meta_fields(&self) -> Fields<'_> {
        Fields::new("meta", &self.meta)
    }

    /// Typed access into `data`
    pub fn data_fields(&self) -> Fields<'_> {
        Fields::new("data", &self.data)
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    pub fn raw_body(&self) -> &[u8] {
        &self.delivery.body
    }

    pub fn is_redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn handle(&self) -> DeliveryHandle {
        self.delivery.handle
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.delivery.properties
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_id_from_meta() {
        assert_eq!(
            JobId::from_meta(&json!({"_id": "42"})),
            Some(JobId::new("42"))
        );
        assert_eq!(JobId::from_meta(&json!({"_id": 42})), Some(JobId::new("42")));
        assert_eq!(JobId::from_meta(&json!({"_id": ""})), None);
        assert_eq!(JobId::from_meta(&json!({"_id": null})), None);
        assert_eq!(JobId::from_meta(&json!({})), None);
        assert_eq!(JobId::from_meta(&json!([])), None);
    }

    #[test]
    fn test_outgoing_copy_keeps_properties() {
        let delivery = Delivery::new(DeliveryHandle::new(7), b"{}".to_vec()).with_properties(
            MessageProperties {
                persistent: true,
                priority: Some(5),
            },
        );

        let copy = OutgoingMessage::copy_of(&delivery);
        assert_eq!(copy.body, b"{}");
        assert_eq!(copy.properties.priority, Some(5));
        assert!(copy.properties.persistent);
    }

    #[test]
    fn test_envelope_accessors() {
        let delivery = Delivery::new(DeliveryHandle::new(1), b"raw".to_vec()).redelivered(true);
        let envelope = MessageEnvelope::new(json!({"_id": 9}), json!({"id": 1}), delivery);

        assert_eq!(envelope.job_id().map(JobId::as_str), Some("9"));
        assert!(envelope.is_redelivered());
        assert_eq!(envelope.handle().tag(), 1);
        assert_eq!(envelope.raw_body(), b"raw");
        assert_eq!(envelope.data_fields().i64(&["id"]), Ok(1));
    }
}
