//! Payload serialization.
//!
//! Job bodies are opaque bytes on the wire. A [`Codec`] turns them into a
//! `serde_json::Value`, from which each worker deserializes its own params
//! type. The stop sentinel is a plain string value that every codec can carry.

use serde_json::Value;
use thiserror::Error;

/// Payload used to unblock a runner's own pending reservation at shutdown.
pub const STOP_SENTINEL: &str = "__STOP__";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Pluggable payload serializer.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, body: &[u8]) -> Result<Value, CodecError>;
}

/// JSON bodies. The default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, body: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// The stop sentinel as a value.
pub fn stop_sentinel() -> Value {
    Value::String(STOP_SENTINEL.to_string())
}

pub fn is_stop_sentinel(value: &Value) -> bool {
    value.as_str() == Some(STOP_SENTINEL)
}
