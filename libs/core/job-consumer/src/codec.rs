//! The two-field wire envelope: `{"meta": <value>, "data": <value>}`
//!
//! `meta._id` carries the job identifier and `meta._priority` (numeric) is
//! mapped onto the broker priority.

use crate::envelope::{Delivery, MessageEnvelope, MessageProperties, OutgoingMessage};
use crate::error::{CodecError, ParseError};
use serde::Serialize;
use serde_json::Value;

pub const META_FIELD: &str = "meta";
pub const DATA_FIELD: &str = "data";
pub const JOB_ID_FIELD: &str = "_id";
pub const PRIORITY_FIELD: &str = "_priority";

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 255;

/// A delivery whose payload could not be parsed, kept for dead-lettering.
#[derive(Debug)]
pub struct Unparsed {
    pub error: ParseError,
    pub delivery: Delivery,
}

#[derive(Serialize)]
struct Wire<'a, M: ?Sized, D: ?Sized> {
    meta: &'a M,
    data: &'a D,
}

/// Encode a persistent `{meta, data}` message.
///
/// `meta` and `data` must not serialize to `null`; [`decode`] would reject
/// such a message, so it is refused here with [`CodecError::NullField`].
pub fn encode<M, D>(meta: &M, data: &D) -> Result<OutgoingMessage, CodecError>
where
    M: Serialize + ?Sized,
    D: Serialize + ?Sized,
{
    encode_with(meta, data, true)
}

/// Encode a `{meta, data}` message with an explicit persistence flag.
pub fn encode_with<M, D>(meta: &M, data: &D, persistent: bool) -> Result<OutgoingMessage, CodecError>
where
    M: Serialize + ?Sized,
    D: Serialize + ?Sized,
{
    let meta = non_null(META_FIELD, serde_json::to_value(meta)?)?;
    let data = non_null(DATA_FIELD, serde_json::to_value(data)?)?;
    let body = serde_json::to_vec(&Wire {
        meta: &meta,
        data: &data,
    })?;

    Ok(OutgoingMessage::new(
        body,
        MessageProperties {
            persistent,
            priority: priority_of(&meta),
        },
    ))
}

fn non_null(field: &'static str, value: Value) -> Result<Value, CodecError> {
    match value {
        Value::Null => Err(CodecError::NullField(field)),
        value => Ok(value),
    }
}

/// Parse a delivery into its envelope.
///
/// Fails when the body is not JSON, not an object, or when `meta` or `data`
/// is absent or `null`. The delivery is handed back on failure.
pub fn decode(delivery: Delivery) -> Result<MessageEnvelope, Unparsed> {
    match split(&delivery.body) {
        Ok((meta, data)) => Ok(MessageEnvelope::new(meta, data, delivery)),
        Err(error) => Err(Unparsed { error, delivery }),
    }
}

fn split(body: &[u8]) -> Result<(Value, Value), ParseError> {
    let value: Value = serde_json::from_slice(body)?;
    let Value::Object(mut object) = value else {
        return Err(ParseError::NotAnObject);
    };

    let meta = take_field(&mut object, META_FIELD)?;
    let data = take_field(&mut object, DATA_FIELD)?;
    Ok((meta, data))
}

fn take_field(
    object: &mut serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Value, ParseError> {
    match object.remove(field) {
        None | Some(Value::Null) => Err(ParseError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

/// Broker priority from `meta._priority`, clamped into 1..=255.
///
/// Numbers and numeric strings are accepted; anything else yields no priority.
pub fn priority_of(meta: &Value) -> Option<u8> {
    let raw = match meta.get(PRIORITY_FIELD)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if raw.is_nan() {
        return None;
    }

    let clamped = raw.round().clamp(f64::from(MIN_PRIORITY), f64::from(MAX_PRIORITY));
    Some(clamped as u8)
}
