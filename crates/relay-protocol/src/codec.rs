//! Codec for the upstream streaming API.
//!
//! The live stream is a long-lived HTTP response carrying one JSON record per
//! line. Blank lines are keep-alives sent by the upstream while the query is
//! quiet. Records may be split across network chunks, so decoding works on an
//! accumulating buffer.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use thiserror::Error;

/// Maximum size of a single upstream record (1 MiB).
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Record delimiter.
const DELIMITER: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Record exceeds maximum size.
    #[error("Record size {0} exceeds maximum {MAX_RECORD_SIZE}")]
    RecordTooLarge(usize),

    /// JSON decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Decode a single record from a complete line.
///
/// Returns `Ok(None)` for a keep-alive (blank) line.
///
/// # Errors
///
/// Returns an error if the line is too large or is not valid JSON.
pub fn decode_line(line: &[u8]) -> Result<Option<Value>, ProtocolError> {
    if line.len() > MAX_RECORD_SIZE {
        return Err(ProtocolError::RecordTooLarge(line.len()));
    }

    let trimmed = trim_ascii_whitespace(line);
    if trimmed.is_empty() {
        return Ok(None);
    }

    Ok(Some(serde_json::from_slice(trimmed)?))
}

/// Try to decode the next record from a buffer, advancing it past every
/// consumed line.
///
/// Keep-alive lines are consumed and skipped. Returns `Ok(Some(record))` if a
/// complete record was decoded, `Ok(None)` if more data is needed.
///
/// # Errors
///
/// Returns an error if a pending record grows past [`MAX_RECORD_SIZE`] or a
/// complete line is not valid JSON. The offending line is consumed, so the
/// caller may keep decoding after a decode error.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Value>, ProtocolError> {
    loop {
        let Some(end) = buf.iter().position(|b| *b == DELIMITER) else {
            if buf.len() > MAX_RECORD_SIZE {
                return Err(ProtocolError::RecordTooLarge(buf.len()));
            }
            return Ok(None);
        };

        let line = buf.split_to(end);
        buf.advance(1);

        if let Some(record) = decode_line(&line)? {
            return Ok(Some(record));
        }
    }
}

/// Decode whatever is left in the buffer once the stream has ended.
///
/// # Errors
///
/// Returns an error if the trailing bytes are not a valid record.
pub fn decode_eof(buf: &mut BytesMut) -> Result<Option<Value>, ProtocolError> {
    if let Some(record) = decode_from(buf)? {
        return Ok(Some(record));
    }
    let rest = buf.split();
    decode_line(&rest)
}

fn trim_ascii_whitespace(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}
