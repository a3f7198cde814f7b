use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::resp::Value;

/// Upper bound on a single bulk string, matching the server-side limit.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on the element count of a single array.
const MAX_ARRAY_LEN: i64 = 4 * 1024 * 1024;

/// Nesting limit for arrays-of-arrays.
const MAX_DEPTH: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid RESP type prefix {0:#04x}")]
    InvalidPrefix(u8),
    #[error("invalid length field")]
    InvalidLength,
    #[error("invalid integer field")]
    InvalidInteger,
    #[error("missing frame terminator")]
    MissingTerminator,
    #[error("length {got} exceeds limit {limit}")]
    LengthLimit { got: i64, limit: i64 },
    #[error("array nesting exceeds depth {0}")]
    NestingTooDeep(usize),
}

/// Incremental RESP reply parser.
///
/// Bytes go in via [`feed`](Self::feed); complete replies come out of
/// [`next_response`](Self::next_response), which returns `Ok(None)` while a
/// frame is still partial. The connection engine creates a fresh reader for
/// every connection.
#[derive(Debug, Default)]
pub struct ResponseReader {
    buf: BytesMut,
}

impl ResponseReader {
    pub fn new() -> ResponseReader {
        ResponseReader::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_response(&mut self) -> Result<Option<Value>, ParseError> {
        match parse_value(&self.buf, 0)? {
            Some((value, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

/// Parse one value from the front of `buf`. Returns `None` when the frame is
/// incomplete, the value plus the byte count it consumed otherwise.
fn parse_value(buf: &[u8], depth: usize) -> Result<Option<(Value, usize)>, ParseError> {
    if depth > MAX_DEPTH {
        return Err(ParseError::NestingTooDeep(MAX_DEPTH));
    }
    let Some(line_end) = find_crlf(buf) else {
        return Ok(None);
    };
    let line = &buf[1..line_end];
    let header = line_end + 2;

    match buf[0] {
        b'+' => Ok(Some((
            Value::Status(String::from_utf8_lossy(line).into_owned()),
            header,
        ))),
        b'-' => Ok(Some((
            Value::Error(String::from_utf8_lossy(line).into_owned()),
            header,
        ))),
        b':' => {
            let n = parse_i64(line).ok_or(ParseError::InvalidInteger)?;
            Ok(Some((Value::Integer(n), header)))
        }
        b'$' => {
            let len = parse_i64(line).ok_or(ParseError::InvalidLength)?;
            if len == -1 {
                return Ok(Some((Value::Nil, header)));
            }
            if len < 0 {
                return Err(ParseError::InvalidLength);
            }
            if len > MAX_BULK_LEN {
                return Err(ParseError::LengthLimit {
                    got: len,
                    limit: MAX_BULK_LEN,
                });
            }
            let len = len as usize;
            let total = header + len + 2;
            if buf.len() < total {
                return Ok(None);
            }
            if &buf[header + len..total] != b"\r\n" {
                return Err(ParseError::MissingTerminator);
            }
            let data = Bytes::copy_from_slice(&buf[header..header + len]);
            Ok(Some((Value::Bulk(data), total)))
        }
        b'*' => {
            let count = parse_i64(line).ok_or(ParseError::InvalidLength)?;
            if count == -1 {
                return Ok(Some((Value::Nil, header)));
            }
            if count < 0 {
                return Err(ParseError::InvalidLength);
            }
            if count > MAX_ARRAY_LEN {
                return Err(ParseError::LengthLimit {
                    got: count,
                    limit: MAX_ARRAY_LEN,
                });
            }
            let count = count as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            let mut offset = header;
            for _ in 0..count {
                match parse_value(&buf[offset..], depth + 1)? {
                    Some((value, consumed)) => {
                        items.push(value);
                        offset += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(items), offset)))
        }
        other => Err(ParseError::InvalidPrefix(other)),
    }
}

fn parse_i64(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.parse().ok()
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    // The prefix byte is at offset 0; the line itself starts at 1.
    if buf.len() < 2 {
        return None;
    }
    buf.windows(2).skip(1).position(|w| w == b"\r\n").map(|p| p + 1)
}
