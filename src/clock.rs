//! Wall-clock source for time replies.

use chrono::{SecondsFormat, Utc};

/// Provides the current instant rendered as text.
pub trait Clock {
    fn now_text(&self) -> String;
}

/// System clock rendering UTC instants as RFC 3339 with a `Z` suffix.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_text(&self) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }
}
