//! Wall-clock helpers and time-window parsing for option fields that accept
//! either raw milliseconds or `<n>(ms|s|m|h|d)` strings.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::GaleError;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A duration option: raw milliseconds or a short unit-suffixed string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeWindow {
    Millis(u64),
    Text(String),
}

impl TimeWindow {
    /// Resolve to milliseconds, rejecting malformed strings. Negative
    /// numeric windows are unrepresentable: the millisecond form is `u64`.
    pub fn to_millis(&self) -> Result<u64, GaleError> {
        match self {
            Self::Millis(ms) => Ok(*ms),
            Self::Text(s) => parse_time_window(s),
        }
    }
}

impl From<u64> for TimeWindow {
    fn from(ms: u64) -> Self {
        Self::Millis(ms)
    }
}

impl From<&str> for TimeWindow {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for TimeWindow {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Parse `<n>(ms|s|m|h|d)` into milliseconds.
pub fn parse_time_window(raw: &str) -> Result<u64, GaleError> {
    let s = raw.trim();
    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(digits_end);

    let value: u64 = digits
        .parse()
        .map_err(|_| GaleError::InvalidTimeWindowFormat(raw.to_string()))?;
    let factor = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(GaleError::InvalidTimeWindowFormat(raw.to_string())),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| GaleError::InvalidTimeWindowFormat(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_time_window("250ms").unwrap(), 250);
        assert_eq!(parse_time_window("30s").unwrap(), 30_000);
        assert_eq!(parse_time_window("10m").unwrap(), 600_000);
        assert_eq!(parse_time_window("2h").unwrap(), 7_200_000);
        assert_eq!(parse_time_window("1d").unwrap(), 86_400_000);
    }

    #[test]
    fn rejects_malformed_strings() {
        for bad in ["", "s", "10", "10x", "ten seconds", "-5s", "1.5s"] {
            let err = parse_time_window(bad).unwrap_err();
            assert_eq!(err.code(), "INVALID_TIME_WINDOW_FORMAT_ERROR", "input: {bad}");
        }
    }

    #[test]
    fn window_resolution() {
        assert_eq!(TimeWindow::from(1_500u64).to_millis().unwrap(), 1_500);
        assert_eq!(TimeWindow::from("3s").to_millis().unwrap(), 3_000);
        assert!(TimeWindow::from("nope").to_millis().is_err());
    }

    #[test]
    fn overflow_is_rejected() {
        assert!(parse_time_window("99999999999999999999d").is_err());
        assert!(parse_time_window(&format!("{}d", u64::MAX)).is_err());
    }
}
