//! Server modification timestamps.
//!
//! Wire format is decimal seconds with up to millisecond precision
//! (`1234567890.12`), carried in `X-Last-Modified` and echoed back in
//! `If-Unmodified-Since`. Stored internally as milliseconds so equality is exact.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Milliseconds since the Unix epoch, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Header representation: `<seconds>.<millis>`, always three fractional digits.
    pub fn to_header_value(&self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        format!("{}{}.{:03}", sign, abs / 1000, abs % 1000)
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header_value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid timestamp '{0}'")]
pub struct ParseTimestampError(String);

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || ParseTimestampError(s.to_string());

        let (negative, unsigned) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (secs, frac) = match unsigned.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (unsigned, ""),
        };

        if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let secs: i64 = secs.parse().map_err(|_| invalid())?;

        // Anything past millisecond precision is dropped.
        let mut millis = 0i64;
        for (i, digit) in frac.bytes().take(3).enumerate() {
            millis += i64::from(digit - b'0') * 10i64.pow(2 - i as u32);
        }

        let total = secs
            .checked_mul(1000)
            .and_then(|ms| ms.checked_add(millis))
            .ok_or_else(invalid)?;

        Ok(Self(if negative { -total } else { total }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fractional_seconds() {
        let ts: Timestamp = "1234567890.12".parse().unwrap();
        assert_eq!(ts.as_millis(), 1_234_567_890_120);

        let ts: Timestamp = "1234567890.123456".parse().unwrap();
        assert_eq!(ts.as_millis(), 1_234_567_890_123);

        let ts: Timestamp = "42".parse().unwrap();
        assert_eq!(ts.as_millis(), 42_000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Timestamp>().is_err());
        assert!("abc".parse::<Timestamp>().is_err());
        assert!("12.3x".parse::<Timestamp>().is_err());
        assert!(".5".parse::<Timestamp>().is_err());
    }

    #[test]
    fn test_header_value() {
        assert_eq!(Timestamp::from_millis(1_500).to_header_value(), "1.500");
        assert_eq!(Timestamp::from_millis(7).to_header_value(), "0.007");
        assert_eq!(
            Timestamp::from_millis(1_234_567_890_120).to_string(),
            "1234567890.120"
        );
    }

    #[test]
    fn test_header_value_parses_back() {
        let ts = Timestamp::from_millis(1_700_000_000_042);
        assert_eq!(ts.to_header_value().parse::<Timestamp>().unwrap(), ts);
    }

    #[test]
    fn test_to_datetime() {
        let dt = Timestamp::from_millis(0).to_datetime().unwrap();
        assert_eq!(dt.timestamp(), 0);
    }
}
