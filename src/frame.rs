// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Upper bound on the element count of a request array.
pub const MAX_BULK_STRINGS: i64 = 10_000_000;
/// Upper bound on the length of a single bulk string inside a request.
pub const MAX_STRING_LEN: i64 = 1_000_000;

// Longest decimal we are willing to scan for before giving up on finding its terminator. An i64
// has at most 19 digits plus a sign.
const MAX_DECIMAL_LEN: usize = 20;

// The element count is client controlled, so only trust it up to this point when preallocating.
const MAX_PREALLOCATED_PARTS: usize = 1024;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("client sent an unreasonable bulk string count")]
    BadBulkStringCount,
    #[error("client sent an unreasonable string length")]
    BadStringLength,
    #[error("expected {expected:?}; got {got:?}")]
    Unexpected { expected: String, got: String },
    #[error("bad number: {0:?}")]
    BadNumber(String),
}

impl Error {
    /// Size guard violations are detected on a complete header line, so the stream is still
    /// positioned on a token boundary. Every other error leaves the reader somewhere inside a
    /// malformed line.
    pub fn is_size_guard(&self) -> bool {
        matches!(self, Error::BadBulkStringCount | Error::BadStringLength)
    }
}

/// Parses one request: an array of bulk strings, `*<N>\r\n` followed by `N` times
/// `$<L>\r\n<L bytes>\r\n`.
///
/// The cursor is left right after the request on success. On failure it is left on the token
/// that could not be parsed, or right after the header that failed a size check.
pub fn parse_request(src: &mut Cursor<&[u8]>) -> Result<Vec<Bytes>, Error> {
    expect(src, b"*")?;
    let count = get_decimal(src)?;
    expect(src, CRLF)?;

    if !(0..=MAX_BULK_STRINGS).contains(&count) {
        return Err(Error::BadBulkStringCount);
    }

    let mut parts = Vec::with_capacity((count as usize).min(MAX_PREALLOCATED_PARTS));
    for _ in 0..count {
        expect(src, b"$")?;
        let length = get_decimal(src)?;
        expect(src, CRLF)?;

        if !(0..=MAX_STRING_LEN).contains(&length) {
            return Err(Error::BadStringLength);
        }

        let length = length as usize;
        if src.remaining() < length {
            return Err(Error::Incomplete);
        }

        let start = src.position() as usize;
        let data = Bytes::copy_from_slice(&src.get_ref()[start..start + length]);
        src.advance(length);

        expect(src, CRLF)?;
        parts.push(data);
    }

    Ok(parts)
}

/// A reply sent back to the client.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Bulk(Bytes),
    /// The null bulk string, `$-1\r\n`.
    Null,
}

impl Frame {
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = BytesMut::new();
        self.serialize_into(&mut bytes);
        bytes.to_vec()
    }

    pub fn serialize_into(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                dst.reserve(1 + s.len() + CRLF.len());
                dst.put_u8(b'+');
                put_line(dst, s);
            }
            Frame::Error(s) => {
                dst.reserve(1 + s.len() + CRLF.len());
                dst.put_u8(b'-');
                put_line(dst, s);
            }
            Frame::Bulk(bytes) => {
                let length_str = bytes.len().to_string();
                dst.reserve(1 + length_str.len() + CRLF.len() + bytes.len() + CRLF.len());
                dst.put_u8(b'$');
                dst.put_slice(length_str.as_bytes());
                dst.put_slice(CRLF);
                dst.put_slice(bytes);
                dst.put_slice(CRLF);
            }
            Frame::Null => dst.put_slice(b"$-1\r\n"),
        }
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "$-1"),
        }
    }
}

// Simple strings and errors cannot carry line breaks, so they are flattened into spaces.
fn put_line(dst: &mut BytesMut, s: &str) {
    dst.extend(
        s.bytes()
            .map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b }),
    );
    dst.put_slice(CRLF);
}

fn expect(src: &mut Cursor<&[u8]>, expected: &[u8]) -> Result<(), Error> {
    let start = src.position() as usize;
    let available = &src.get_ref()[start..];
    let n = expected.len().min(available.len());

    if available[..n] != expected[..n] {
        return Err(Error::Unexpected {
            expected: String::from_utf8_lossy(expected).into_owned(),
            got: String::from_utf8_lossy(&available[..n]).into_owned(),
        });
    }
    if n < expected.len() {
        return Err(Error::Incomplete);
    }

    src.advance(n);
    Ok(())
}

/// Consumes the digits of a decimal, up to but not including the `\r` that ends it.
fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    let start = src.position() as usize;
    let available = &src.get_ref()[start..];
    let window = &available[..available.len().min(MAX_DECIMAL_LEN + 1)];

    let end = match window.iter().position(|&b| b == b'\r') {
        Some(end) => end,
        None if window.len() > MAX_DECIMAL_LEN => {
            src.advance(window.len());
            return Err(Error::BadNumber(String::from_utf8_lossy(window).into_owned()));
        }
        None => return Err(Error::Incomplete),
    };

    let digits = &available[..end];
    src.advance(end);

    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::BadNumber(String::from_utf8_lossy(digits).into_owned()))
}
