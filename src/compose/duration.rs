//! Compose duration strings such as `1m30s`, `500ms` or `10s`

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

fn component() -> &'static Regex {
    static COMPONENT: OnceLock<Regex> = OnceLock::new();
    COMPONENT.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|s|m|h)").expect("duration pattern is valid")
    })
}

/// Parse a duration string. A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in component().captures_iter(s) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        if whole.start != consumed {
            return Err(format!("invalid duration '{}'", input));
        }
        consumed = whole.end;

        let value: f64 = caps[1]
            .parse()
            .map_err(|_| format!("invalid duration '{}'", input))?;
        let unit_secs = match &caps[2] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("invalid duration unit in '{}'", input)),
        };
        total = Duration::try_from_secs_f64(value * unit_secs)
            .ok()
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("invalid duration '{}': out of range", input))?;
    }

    if consumed != s.len() {
        return Err(format!("invalid duration '{}'", input));
    }
    Ok(total)
}

/// Format a duration the way compose files write it
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }
    if duration.subsec_nanos() != 0 && duration.as_secs() == 0 {
        return format!("{}ms", duration.as_millis());
    }

    let secs = duration.as_secs();
    let mut out = String::new();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 {
        out.push_str(&format!("{}s", s));
    }
    let millis = duration.subsec_millis();
    if millis > 0 {
        out.push_str(&format!("{}ms", millis));
    }
    out
}

/// Serde helpers for duration-string fields
pub mod serde_duration {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => parse_duration(&s).map_err(de::Error::custom),
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compound_durations() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ten seconds").is_err());
        assert!(parse_duration("5s later").is_err());
        assert!(parse_duration("x5s").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert!(parse_duration("99999999999999999999h").is_err());
        assert!(parse_duration("10000000000000000000s10000000000000000000s").is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
    }
}
