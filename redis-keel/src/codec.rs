//! Pluggable key/value codecs
//!
//! Keys and values cross the wire as RESP bulk strings; a codec maps them to
//! and from user types. [`Utf8Codec`] is the default used by the command
//! facade.

use bytes::Bytes;
use redis_keel_core::error::{RedisError, RedisResult};

/// Converts keys and values between user types and wire bytes.
///
/// A failing `encode_*` surfaces as an encode error on the submitted
/// command; the command is never written to the connection.
pub trait KeyValueCodec: Send + Sync {
    /// User-facing key type
    type Key;
    /// User-facing value type
    type Value;

    /// Encode a key for the wire.
    fn encode_key(&self, key: &Self::Key) -> RedisResult<Bytes>;

    /// Encode a value for the wire.
    fn encode_value(&self, value: &Self::Value) -> RedisResult<Bytes>;

    /// Decode a key received from the wire.
    fn decode_key(&self, data: Bytes) -> RedisResult<Self::Key>;

    /// Decode a value received from the wire.
    fn decode_value(&self, data: Bytes) -> RedisResult<Self::Value>;
}

/// The default codec: keys and values are UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Utf8Codec {
    fn decode(&self, data: Bytes) -> RedisResult<String> {
        String::from_utf8(data.to_vec())
            .map_err(|e| RedisError::Type(format!("invalid UTF-8: {e}")))
    }
}

impl KeyValueCodec for Utf8Codec {
    type Key = String;
    type Value = String;

    fn encode_key(&self, key: &String) -> RedisResult<Bytes> {
        Ok(Bytes::copy_from_slice(key.as_bytes()))
    }

    fn encode_value(&self, value: &String) -> RedisResult<Bytes> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn decode_key(&self, data: Bytes) -> RedisResult<String> {
        self.decode(data)
    }

    fn decode_value(&self, data: Bytes) -> RedisResult<String> {
        self.decode(data)
    }
}
