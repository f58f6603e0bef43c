//! Message body codecs.
//!
//! The bus never looks inside a body; it only needs a `Serializer` that can
//! turn typed messages into bytes and back. Serializers work through
//! `serde_json::Value` so the trait stays object-safe and any self-describing
//! serde format can be plugged in.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Default serializer name.
pub const DEFAULT_SERIALIZER: &str = "json";

/// Errors raised while encoding or decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Failed to encode '{message_type}': {reason}")]
    Encode {
        message_type: String,
        reason: String,
    },

    #[error("Failed to decode '{message_type}': {reason}")]
    Decode {
        message_type: String,
        reason: String,
    },

    #[error("Unknown serializer: {0}")]
    UnknownSerializer(String),
}

/// A message type the bus can route.
///
/// `MESSAGE_TYPE` is the routing name carried on the envelope; keep it stable
/// across deployments.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;
}

/// Body codec capability.
pub trait Serializer: Send + Sync {
    /// Name recorded in the envelope `content-type` header.
    fn name(&self) -> &str;

    fn to_bytes(&self, value: &serde_json::Value) -> Result<Vec<u8>, String>;

    fn from_bytes(&self, bytes: &[u8]) -> Result<serde_json::Value, String>;
}

/// Encode a typed message.
pub fn encode<M: Message>(
    serializer: &dyn Serializer,
    message: &M,
) -> Result<Vec<u8>, SerializationError> {
    encode_value(serializer, M::MESSAGE_TYPE, message)
}

/// Encode any serializable value under an explicit type name.
pub fn encode_value<T: Serialize + ?Sized>(
    serializer: &dyn Serializer,
    message_type: &str,
    value: &T,
) -> Result<Vec<u8>, SerializationError> {
    let err = |reason: String| SerializationError::Encode {
        message_type: message_type.to_string(),
        reason,
    };
    let value = serde_json::to_value(value).map_err(|e| err(e.to_string()))?;
    serializer.to_bytes(&value).map_err(err)
}

/// Decode a typed message.
pub fn decode<M: Message>(
    serializer: &dyn Serializer,
    bytes: &[u8],
) -> Result<M, SerializationError> {
    decode_value(serializer, M::MESSAGE_TYPE, bytes)
}

/// Decode bytes into any deserializable value under an explicit type name.
pub fn decode_value<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    message_type: &str,
    bytes: &[u8],
) -> Result<T, SerializationError> {
    let err = |reason: String| SerializationError::Decode {
        message_type: message_type.to_string(),
        reason,
    };
    let value = serializer.from_bytes(bytes).map_err(err)?;
    serde_json::from_value(value).map_err(|e| err(e.to_string()))
}

/// JSON bodies via `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn to_bytes(&self, value: &serde_json::Value) -> Result<Vec<u8>, String> {
        serde_json::to_vec(value).map_err(|e| e.to_string())
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<serde_json::Value, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }
}

/// YAML bodies via `serde_yaml`.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn name(&self) -> &str {
        "yaml"
    }

    fn to_bytes(&self, value: &serde_json::Value) -> Result<Vec<u8>, String> {
        serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| e.to_string())
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<serde_json::Value, String> {
        serde_yaml::from_slice(bytes).map_err(|e| e.to_string())
    }
}

/// Resolve a serializer by configured name.
pub fn serializer_for(name: &str) -> Result<Arc<dyn Serializer>, SerializationError> {
    match name {
        "" | "json" => Ok(Arc::new(JsonSerializer)),
        "yaml" => Ok(Arc::new(YamlSerializer)),
        other => Err(SerializationError::UnknownSerializer(other.to_string())),
    }
}
