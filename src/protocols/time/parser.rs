//! Time protocol parser.

use crate::clock::Clock;
use bytes::Bytes;
use std::fmt;
use std::str::Utf8Error;

/// Request text recognized as a time query (compared case-insensitively).
pub const QUERY_TIME_ORDER: &str = "QUERY TIME ORDER";

/// Reply for anything that is not a time query.
pub const BAD_ORDER: &str = "BAD ORDER";

/// Decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// The time query.
    QueryTime,
    /// Any other text, kept for logging.
    Unknown(String),
}

/// Request bytes could not be decoded as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    InvalidUtf8(Utf8Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidUtf8(e) => write!(f, "request is not valid UTF-8: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode the bytes of one read event into a request.
///
/// The whole input is the request: no trimming, no line ending handling.
pub fn parse(input: &[u8]) -> Result<Request, DecodeError> {
    let text = std::str::from_utf8(input).map_err(DecodeError::InvalidUtf8)?;

    if eq_ignore_case(text, QUERY_TIME_ORDER) {
        Ok(Request::QueryTime)
    } else {
        Ok(Request::Unknown(text.to_string()))
    }
}

/// Case-insensitive comparison, character by character.
///
/// Two characters match when they are equal or when their Unicode upper or
/// lower case mappings are equal, so `ı` (dotless i) matches `I`.
fn eq_ignore_case(a: &str, b: &str) -> bool {
    let mut a_chars = a.chars();
    let mut b_chars = b.chars();

    loop {
        match (a_chars.next(), b_chars.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) => {
                if x != y
                    && !x.to_uppercase().eq(y.to_uppercase())
                    && !x.to_lowercase().eq(y.to_lowercase())
                {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Compute the reply for a decoded request.
pub fn reply(request: &Request, clock: &dyn Clock) -> Bytes {
    match request {
        Request::QueryTime => Bytes::from(clock.now_text()),
        Request::Unknown(_) => response_bad_order(),
    }
}

/// The `BAD ORDER` reply.
pub fn response_bad_order() -> Bytes {
    Bytes::from_static(BAD_ORDER.as_bytes())
}
