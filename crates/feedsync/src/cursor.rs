//! In-memory feed cursor (no disk persistence).
//!
//! A new session starts from the newest item of its initial page, or from "now".

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FeedError;

/// Cursor: `published_at` of the newest item already known. Never moves backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(DateTime<Utc>);

impl Cursor {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.0
    }

    /// Move forward to `to`. Returns whether the cursor changed.
    pub fn advance(&mut self, to: Cursor) -> Result<bool, FeedError> {
        if to.0 < self.0 {
            return Err(FeedError::CursorRegression {
                current: *self,
                attempted: to,
            });
        }
        let moved = to.0 > self.0;
        self.0 = to.0;
        Ok(moved)
    }

    /// Query-string form: RFC 3339, millisecond precision, `Z` suffix.
    pub fn to_query(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

impl From<DateTime<Utc>> for Cursor {
    fn from(at: DateTime<Utc>) -> Self {
        Self(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn c(secs: i64) -> Cursor {
        Cursor::new(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn cursor_advances_forward() {
        let mut cur = c(10);
        assert!(cur.advance(c(11)).unwrap());
        assert_eq!(cur, c(11));
        assert!(!cur.advance(c(11)).unwrap());
    }

    #[test]
    fn cursor_refuses_to_move_backward() {
        let mut cur = c(10);
        let err = cur.advance(c(9)).unwrap_err();
        assert!(matches!(err, FeedError::CursorRegression { .. }));
        assert_eq!(cur, c(10));
    }

    #[test]
    fn cursor_query_format() {
        let cur = Cursor::new(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
        assert_eq!(cur.to_query(), "2024-01-01T10:00:00.000Z");
    }
}
