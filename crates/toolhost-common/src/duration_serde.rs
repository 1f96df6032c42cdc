//! Human-friendly `Duration` (de)serialization.
//!
//! Durations are written as `"500ms"`, `"30s"` or `"5m"`. Use with
//! `#[serde(with = "toolhost_common::duration_serde")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Format a duration using the largest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        format!("{}ms", millis)
    } else if millis % 60_000 == 0 && millis > 0 {
        format!("{}m", millis / 60_000)
    } else {
        format!("{}s", millis / 1000)
    }
}

/// Parse `"<n>ms"`, `"<n>s"` or `"<n>m"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    // "ms" must be checked before "s"
    if let Some(num) = s.strip_suffix("ms") {
        let millis: u64 = num.trim().parse().map_err(|_| format!("Invalid duration: {}", s))?;
        Ok(Duration::from_millis(millis))
    } else if let Some(num) = s.strip_suffix('s') {
        let secs: u64 = num.trim().parse().map_err(|_| format!("Invalid duration: {}", s))?;
        Ok(Duration::from_secs(secs))
    } else if let Some(num) = s.strip_suffix('m') {
        let mins: u64 = num.trim().parse().map_err(|_| format!("Invalid duration: {}", s))?;
        Ok(Duration::from_secs(mins * 60))
    } else {
        Err(format!("Duration must end with 's', 'ms', or 'm': {}", s))
    }
}

/// Like [`parse_duration`], but a bare integer is taken as seconds.
///
/// Used for environment overrides where `TOOLHOST_CLEANUP_INTERVAL=300` is
/// the natural spelling.
pub fn parse_duration_or_secs(s: &str) -> Result<Duration, String> {
    match s.trim().parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => parse_duration(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("5h").is_err());
        assert!(parse_duration("abcs").is_err());
    }

    #[test]
    fn test_bare_seconds() {
        assert_eq!(parse_duration_or_secs("300").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration_or_secs("2m").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn test_format_picks_exact_unit() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
