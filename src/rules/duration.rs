//! Duration literals such as `15s`, `5m`, `1h30m`

use std::time::Duration;

const UNITS: &[(&str, u64)] = &[
    ("ms", 1),
    ("s", 1_000),
    ("m", 60_000),
    ("h", 3_600_000),
    ("d", 86_400_000),
    ("w", 604_800_000),
];

/// Longest accepted duration; timestamps are signed unix millis
pub const MAX_DURATION_MS: u64 = i64::MAX as u64;

/// Parse a duration literal. Units: ms, s, m, h, d, w. Segments must appear
/// in decreasing unit order (`1h30m`, not `30m1h`). `0` alone is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(DurationError(input.to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut last_unit_ms = u64::MAX;
    let mut rest = s;

    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(DurationError(input.to_string()));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| DurationError(input.to_string()))?;
        rest = &rest[digits..];

        // "ms" must be tried before "m"
        let (unit, unit_ms) = UNITS
            .iter()
            .filter(|(u, _)| rest.starts_with(u))
            .max_by_key(|(u, _)| u.len())
            .ok_or_else(|| DurationError(input.to_string()))?;
        if *unit_ms >= last_unit_ms {
            return Err(DurationError(input.to_string()));
        }
        last_unit_ms = *unit_ms;
        rest = &rest[unit.len()..];

        total_ms = amount
            .checked_mul(*unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .filter(|ms| *ms <= MAX_DURATION_MS)
            .ok_or_else(|| DurationError(input.to_string()))?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Whole milliseconds, saturating at `i64::MAX`
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Format a duration using the largest exact units (`90s` -> `1m30s`)
pub fn format_duration(duration: Duration) -> String {
    let mut ms = duration.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, unit_ms) in UNITS.iter().rev() {
        let n = ms / unit_ms;
        if n > 0 {
            out.push_str(&format!("{}{}", n, unit));
            ms -= n * unit_ms;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid duration: '{0}'")]
pub struct DurationError(pub String);

/// Serde helper for `Duration` fields written as literals
pub mod serde_literal {
    use super::{format_duration, parse_duration};
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

    /// Same, for `Option<Duration>`
    pub mod option {
        use super::{format_duration, parse_duration};
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_str(&format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "5", "m", "5x", "30m1h", "5m5m", "-5m", "1.5h", "20000000000w"] {
            assert!(parse_duration(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_parse_bounded_by_millis_timestamps() {
        assert_eq!(
            parse_duration("9223372036854775807ms").unwrap(),
            Duration::from_millis(i64::MAX as u64)
        );
        assert!(parse_duration("9223372036854775808ms").is_err());
        assert!(parse_duration("15250285w").is_err());
        assert_eq!(duration_millis(Duration::from_secs(u64::MAX)), i64::MAX);
    }

    #[test]
    fn test_format() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1s500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
