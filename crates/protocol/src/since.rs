//! Since markers and future-time parsing
//!
//! A since marker selects the starting position for cache replay. Publishers
//! and subscribers pass it as `since=...`; delays on publish use the same
//! time grammar via [`parse_future_time`].

use chrono::Utc;

use crate::error::ParseError;
use crate::message::valid_message_id;

/// A position in the message cache from which to replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinceMarker {
    /// No backfill
    None,
    /// Replay everything that is cached
    All,
    /// Replay messages with `time >=` the given unix timestamp
    Time(i64),
    /// Replay messages newer than the one with the given id
    Id(String),
}

impl SinceMarker {
    /// Whether this marker selects nothing
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Parse a `since` value.
///
/// - empty: `All` when polling, `None` when streaming
/// - `all` / `none`: the corresponding marker
/// - a valid message id: replay after that id
/// - an integer: unix timestamp
/// - a duration (`10m`, `12h`): that far back from now
pub fn parse_since(value: &str, poll: bool) -> Result<SinceMarker, ParseError> {
    match value {
        "" => Ok(if poll { SinceMarker::All } else { SinceMarker::None }),
        "all" => Ok(SinceMarker::All),
        "none" => Ok(SinceMarker::None),
        v if valid_message_id(v) => Ok(SinceMarker::Id(v.to_string())),
        v => {
            if let Ok(ts) = v.parse::<i64>() {
                return Ok(SinceMarker::Time(ts));
            }
            if let Ok(d) = humantime::parse_duration(v) {
                return Ok(SinceMarker::Time(Utc::now().timestamp() - d.as_secs() as i64));
            }
            Err(ParseError::InvalidSince(v.to_string()))
        }
    }
}

/// Parse a future point in time, as used by publish delays.
///
/// Accepts a unix timestamp or a duration from now.
pub fn parse_future_time(value: &str, now: i64) -> Result<i64, ParseError> {
    let value = value.trim();
    if let Ok(ts) = value.parse::<i64>() {
        return Ok(ts);
    }
    if let Ok(d) = humantime::parse_duration(value) {
        return Ok(now + d.as_secs() as i64);
    }
    Err(ParseError::InvalidDelay(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_since_empty() {
        assert_eq!(parse_since("", true).unwrap(), SinceMarker::All);
        assert_eq!(parse_since("", false).unwrap(), SinceMarker::None);
    }

    #[test]
    fn test_parse_since_keywords() {
        assert_eq!(parse_since("all", false).unwrap(), SinceMarker::All);
        assert_eq!(parse_since("none", true).unwrap(), SinceMarker::None);
    }

    #[test]
    fn test_parse_since_id() {
        assert_eq!(
            parse_since("abcDEF123456", false).unwrap(),
            SinceMarker::Id("abcDEF123456".to_string())
        );
    }

    #[test]
    fn test_parse_since_timestamp() {
        assert_eq!(parse_since("1136239445", false).unwrap(), SinceMarker::Time(1136239445));
    }

    #[test]
    fn test_parse_since_duration() {
        let now = Utc::now().timestamp();
        match parse_since("10m", false).unwrap() {
            SinceMarker::Time(t) => {
                assert!((now - 600 - t).abs() <= 2, "expected ~{}, got {t}", now - 600);
            }
            other => panic!("expected time marker, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_since_invalid() {
        assert!(parse_since("not-a-thing", false).is_err());
        assert!(parse_since("10 parsecs", false).is_err());
    }

    #[test]
    fn test_parse_future_time() {
        assert_eq!(parse_future_time("1700000000", 100).unwrap(), 1700000000);
        assert_eq!(parse_future_time("30m", 1000).unwrap(), 1000 + 1800);
        assert_eq!(parse_future_time(" 1s ", 0).unwrap(), 1);
        assert!(parse_future_time("whenever", 0).is_err());
    }
}
