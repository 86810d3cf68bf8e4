//! RFC 3339 timestamps at the HTTP boundary
//!
//! The engine works in microseconds since the epoch; the wire uses RFC 3339
//! strings.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn parse(input: &str) -> Result<i64, String> {
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc).timestamp_micros())
        .map_err(|e| format!("invalid timestamp {}: {}", input, e))
}

pub fn format(micros: i64) -> String {
    match DateTime::<Utc>::from_timestamp_micros(micros) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Micros, true),
        None => micros.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rfc3339() {
        assert_eq!(parse("2000-01-01T00:00:00Z").unwrap(), 946_684_800_000_000);
        assert_eq!(
            parse("2000-01-01T00:00:00.000001Z").unwrap(),
            946_684_800_000_001
        );
    }

    #[test]
    fn test_parse_with_offset() {
        assert_eq!(
            parse("2000-01-01T01:00:00+01:00").unwrap(),
            946_684_800_000_000
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse("not-a-time").is_err());
    }

    #[test]
    fn test_roundtrip() {
        let micros = 946_684_800_123_456;
        assert_eq!(parse(&format(micros)).unwrap(), micros);
    }
}
