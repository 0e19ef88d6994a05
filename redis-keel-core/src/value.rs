//! RESP (REdis Serialization Protocol) reply values

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;

/// A single decoded RESP2 reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple string: `+OK\r\n`
    Simple(String),
    /// Error: `-ERR message\r\n`
    Error(String),
    /// Integer: `:1000\r\n`
    Integer(i64),
    /// Bulk string: `$6\r\nfoobar\r\n`
    Bulk(Bytes),
    /// Null bulk string (`$-1\r\n`) or null array (`*-1\r\n`)
    Null,
    /// Array: `*2\r\n...`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Bulk string from anything byte-like.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::Bulk(data.into())
    }

    /// Interpret the value as UTF-8 text.
    pub fn into_string(self) -> RedisResult<String> {
        match self {
            RespValue::Simple(s) => Ok(s),
            RespValue::Bulk(b) => String::from_utf8(b.to_vec())
                .map_err(|e| RedisError::Type(format!("invalid UTF-8: {e}"))),
            other => Err(RedisError::Type(format!("not a string reply: {other:?}"))),
        }
    }

    /// Interpret the value as an integer.
    pub fn as_integer(&self) -> RedisResult<i64> {
        match self {
            RespValue::Integer(i) => Ok(*i),
            RespValue::Bulk(b) => {
                let s = std::str::from_utf8(b)
                    .map_err(|e| RedisError::Type(format!("invalid UTF-8: {e}")))?;
                s.parse::<i64>()
                    .map_err(|e| RedisError::Type(format!("not an integer: {e}")))
            }
            other => Err(RedisError::Type(format!("not an integer reply: {other:?}"))),
        }
    }

    /// Interpret the value as raw bytes.
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            RespValue::Bulk(b) => Ok(b.clone()),
            RespValue::Simple(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            other => Err(RedisError::Type(format!("not a bulk reply: {other:?}"))),
        }
    }

    /// Interpret the value as an array of frames.
    pub fn into_array(self) -> RedisResult<Vec<RespValue>> {
        match self {
            RespValue::Array(items) => Ok(items),
            other => Err(RedisError::Type(format!("not an array reply: {other:?}"))),
        }
    }

    /// `true` for the RESP null marker.
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// `true` for a server error frame.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        RespValue::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        RespValue::Bulk(Bytes::from(s.into_bytes()))
    }
}

impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        RespValue::Integer(i)
    }
}

impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        RespValue::Bulk(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_string() {
        assert_eq!(
            RespValue::Simple("OK".to_string()).into_string().unwrap(),
            "OK"
        );
        assert_eq!(RespValue::bulk("abc").into_string().unwrap(), "abc");
        assert!(RespValue::Null.into_string().is_err());
    }

    #[test]
    fn test_as_integer() {
        assert_eq!(RespValue::Integer(7).as_integer().unwrap(), 7);
        assert_eq!(RespValue::bulk("42").as_integer().unwrap(), 42);
        assert!(RespValue::Simple("x".to_string()).as_integer().is_err());
    }

    #[test]
    fn test_null_and_error_predicates() {
        assert!(RespValue::Null.is_null());
        assert!(RespValue::Error("ERR".to_string()).is_error());
        assert!(!RespValue::Integer(0).is_error());
    }
}
