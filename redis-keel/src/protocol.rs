//! RESP2 wire protocol: request encoding and streaming reply decoding

use bytes::{Buf, BufMut, Bytes, BytesMut};
use redis_keel_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";

/// Write a command as a RESP multi-bulk request: an array header followed by
/// one bulk string per argument. Requests are never emitted in inline form.
pub fn encode_request(args: &[Bytes], dst: &mut BytesMut) {
    dst.put_u8(b'*');
    dst.put_slice(args.len().to_string().as_bytes());
    dst.put_slice(CRLF);
    for arg in args {
        dst.put_u8(b'$');
        dst.put_slice(arg.len().to_string().as_bytes());
        dst.put_slice(CRLF);
        dst.put_slice(arg);
        dst.put_slice(CRLF);
    }
}

/// Resumable RESP2 reply reader.
///
/// Bytes are fed in arbitrary slices as they arrive from the socket; a frame
/// split across packets stays buffered until its remainder shows up. Consumed
/// bytes are released only once a whole frame parses, so a partial parse
/// never loses position.
#[derive(Debug, Default)]
pub struct ReplyReader {
    buffer: BytesMut,
}

impl ReplyReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Append bytes received from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Buffer to read socket data into directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Try to decode the next complete reply frame.
    ///
    /// Returns `Ok(None)` when the buffered bytes end mid-frame.
    pub fn next_frame(&mut self) -> RedisResult<Option<RespValue>> {
        let mut cursor = Cursor::new(&self.buffer[..]);
        match decode_frame(&mut cursor)? {
            Some(frame) => {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Number of undecoded bytes currently buffered.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_frame(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
    if !buf.has_remaining() {
        return Ok(None);
    }

    match buf.chunk()[0] {
        b'+' => decode_line(buf).map(|line| line.map(RespValue::Simple)),
        b'-' => decode_line(buf).map(|line| line.map(RespValue::Error)),
        b':' => match decode_line(buf)? {
            Some(line) => {
                let n = line
                    .parse::<i64>()
                    .map_err(|e| RedisError::Protocol(format!("invalid integer: {e}")))?;
                Ok(Some(RespValue::Integer(n)))
            }
            None => Ok(None),
        },
        b'$' => decode_bulk(buf),
        b'*' => decode_array(buf),
        other => Err(RedisError::Protocol(format!(
            "invalid RESP type byte: {:?}",
            other as char
        ))),
    }
}

/// Decode the line after a one-byte type marker, without the CRLF.
fn decode_line(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<String>> {
    let start = buf.position() as usize + 1;
    let slice = buf.get_ref();

    for i in start..slice.len().saturating_sub(1) {
        if slice[i] == b'\r' && slice[i + 1] == b'\n' {
            let line = std::str::from_utf8(&slice[start..i])
                .map_err(|e| RedisError::Protocol(format!("invalid UTF-8: {e}")))?
                .to_string();
            buf.set_position((i + 2) as u64);
            return Ok(Some(line));
        }
    }

    Ok(None)
}

fn decode_bulk(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
    let len = match decode_length(buf)? {
        Some(len) => len,
        None => return Ok(None),
    };

    if len < 0 {
        return Ok(Some(RespValue::Null));
    }

    let len = len as usize;
    if buf.remaining() < len + 2 {
        return Ok(None);
    }

    let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
    buf.advance(len + 2);
    Ok(Some(RespValue::Bulk(data)))
}

fn decode_array(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
    let len = match decode_length(buf)? {
        Some(len) => len,
        None => return Ok(None),
    };

    if len < 0 {
        return Ok(Some(RespValue::Null));
    }

    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        match decode_frame(buf)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }

    Ok(Some(RespValue::Array(items)))
}

fn decode_length(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<i64>> {
    match decode_line(buf)? {
        Some(line) => {
            let len = line
                .parse::<i64>()
                .map_err(|e| RedisError::Protocol(format!("invalid length prefix: {e}")))?;
            Ok(Some(len))
        }
        None => Ok(None),
    }
}
