use serde::{de::DeserializeOwned, Serialize};

const JSON_CONTENT_TYPE: &str = "application/json";
const BINCODE_CONTENT_TYPE: &str = "application/x-bincode";
const BINARY_CONTENT_ENCODING: &str = "binary";

/// Upper bound on any length prefix the binary decoder will honour.
const MAX_BINARY_PAYLOAD: usize = 16 * 1024 * 1024;

/// Pluggable wire format for published and consumed payloads.
///
/// The payload type is chosen at the call site; nothing about it travels on
/// the wire except the content type tag, so publisher and subscriber must
/// agree on both the codec and the type.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Content type attached to every message produced by this codec.
    fn content_type(&self) -> &'static str;

    fn content_encoding(&self) -> Option<&'static str> {
        None
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, EncodeError>;

    /// Must return `Err` rather than panic on malformed or truncated input.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DecodeError>;
}

/// Human-readable codec for small, frequently changing control messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(value).map_err(|e| EncodeError::new(JSON_CONTENT_TYPE, e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::new(JSON_CONTENT_TYPE, e))
    }
}

/// Compact codec for larger payloads exchanged between binaries built from
/// the same type definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    fn config() -> impl bincode::config::Config {
        bincode::config::standard().with_limit::<MAX_BINARY_PAYLOAD>()
    }
}

impl Codec for BincodeCodec {
    fn content_type(&self) -> &'static str {
        BINCODE_CONTENT_TYPE
    }

    fn content_encoding(&self) -> Option<&'static str> {
        Some(BINARY_CONTENT_ENCODING)
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        bincode::serde::encode_to_vec(value, Self::config())
            .map_err(|e| EncodeError::new(BINCODE_CONTENT_TYPE, e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        let (value, consumed) = bincode::serde::decode_from_slice(bytes, Self::config())
            .map_err(|e| DecodeError::new(BINCODE_CONTENT_TYPE, e))?;

        if consumed != bytes.len() {
            return Err(DecodeError::new(
                BINCODE_CONTENT_TYPE,
                format!("{} trailing bytes after payload", bytes.len() - consumed),
            ));
        }

        Ok(value)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to encode {content_type} payload: {reason}")]
pub struct EncodeError {
    pub content_type: &'static str,
    pub reason: String,
}

impl EncodeError {
    fn new(content_type: &'static str, reason: impl ToString) -> Self {
        Self {
            content_type,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to decode {content_type} payload: {reason}")]
pub struct DecodeError {
    pub content_type: &'static str,
    pub reason: String,
}

impl DecodeError {
    fn new(content_type: &'static str, reason: impl ToString) -> Self {
        Self {
            content_type,
            reason: reason.to_string(),
        }
    }
}
