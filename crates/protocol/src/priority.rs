//! Message priority parsing

use crate::error::ParseError;

/// Lowest priority
pub const MIN_PRIORITY: u8 = 1;

/// Priority assigned when the publisher does not specify one
pub const DEFAULT_PRIORITY: u8 = 3;

/// Highest priority
pub const MAX_PRIORITY: u8 = 5;

/// Parse a priority from a header or query value.
///
/// Accepts the numbers 1-5 and the names `min`, `low`, `default`, `high`,
/// `max`/`urgent`. An empty value yields [`DEFAULT_PRIORITY`].
pub fn parse_priority(value: &str) -> Result<u8, ParseError> {
    match value.trim().to_lowercase().as_str() {
        "" => Ok(DEFAULT_PRIORITY),
        "1" | "min" => Ok(1),
        "2" | "low" => Ok(2),
        "3" | "default" => Ok(3),
        "4" | "high" => Ok(4),
        "5" | "max" | "urgent" => Ok(5),
        other => Err(ParseError::InvalidPriority(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_priority_numbers() {
        for n in 1..=5u8 {
            assert_eq!(parse_priority(&n.to_string()).unwrap(), n);
        }
    }

    #[test]
    fn test_parse_priority_names() {
        assert_eq!(parse_priority("min").unwrap(), 1);
        assert_eq!(parse_priority("LOW").unwrap(), 2);
        assert_eq!(parse_priority("default").unwrap(), 3);
        assert_eq!(parse_priority("high").unwrap(), 4);
        assert_eq!(parse_priority("max").unwrap(), 5);
        assert_eq!(parse_priority("urgent").unwrap(), 5);
    }

    #[test]
    fn test_parse_priority_empty_is_default() {
        assert_eq!(parse_priority("").unwrap(), DEFAULT_PRIORITY);
        assert_eq!(parse_priority("  ").unwrap(), DEFAULT_PRIORITY);
    }

    #[test]
    fn test_parse_priority_invalid() {
        assert!(parse_priority("0").is_err());
        assert!(parse_priority("6").is_err());
        assert!(parse_priority("importantish").is_err());
    }
}
