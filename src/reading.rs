use crate::error::DecodeError;
use bytes::Bytes;
use serde_json::{Map, Value};

/// Decoded sensor reading: field name to value, keys are not validated.
pub type Reading = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

pub fn decode(raw: &[u8]) -> Result<Reading, DecodeError> {
    if raw.iter().all(|byte| byte.is_ascii_whitespace()) {
        return Err(DecodeError::Empty);
    }

    // simd-json parses in place, so it gets its own copy of the payload.
    let mut buf = raw.to_vec();
    let value: Value = simd_json::serde::from_slice(&mut buf)
        .map_err(|err| DecodeError::Malformed(err.to_string()))?;

    match value {
        Value::Object(reading) => Ok(reading),
        Value::Array(_) => Err(DecodeError::NotAnObject("array")),
        Value::String(_) => Err(DecodeError::NotAnObject("string")),
        Value::Number(_) => Err(DecodeError::NotAnObject("number")),
        Value::Bool(_) => Err(DecodeError::NotAnObject("boolean")),
        Value::Null => Err(DecodeError::NotAnObject("null")),
    }
}

pub fn encode(reading: &Reading) -> Vec<u8> {
    // A map of JSON values always serializes.
    serde_json::to_vec(reading).unwrap_or_default()
}
