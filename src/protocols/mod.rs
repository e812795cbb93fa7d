//! Protocol implementations.
//!
//! - `time`: single-line time query protocol served by the reactor

pub mod time;
