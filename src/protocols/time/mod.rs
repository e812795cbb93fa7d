//! Time query protocol.
//!
//! Each read event is one complete request. There is no length prefix and
//! no delimiter; the bytes of a single read are decoded as UTF-8 and
//! compared against the query text.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  QUERY TIME ORDER        (any casing, nothing else)
//! Response: 2026-10-17T08:15:30.123456789Z
//!
//! Request:  anything else
//! Response: BAD ORDER
//! ```
//!
//! Casing is folded per character with Unicode upper and lower case
//! mappings, so `query tıme order` (dotless i) is also a time query.
//! Replies carry no line terminator. A request split across several TCP
//! segments is seen as several requests, and each part is answered with
//! `BAD ORDER`.

pub mod parser;

pub use parser::{parse, reply, Request};
