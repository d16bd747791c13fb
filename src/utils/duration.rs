//! ISO-8601 duration parsing and formatting.
//!
//! Pipeline interchange carries step timeouts and retry intervals as
//! ISO-8601 duration strings (`PT30S`, `PT5M`, `P1DT2H`, `PT0.01S`).
//! Internally they are `std::time::Duration`; the serde adapters below
//! keep the wire format stable.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while parsing an ISO-8601 duration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    /// The string is empty.
    #[error("empty duration string")]
    Empty,

    /// The string does not follow the `PnDTnHnMnS` shape.
    #[error("invalid ISO-8601 duration: {0}")]
    InvalidFormat(String),

    /// A numeric component could not be parsed.
    #[error("invalid duration component '{0}'")]
    InvalidComponent(String),
}

/// Parses an ISO-8601 duration string into a [`Duration`].
///
/// Supports days, hours, minutes, and seconds (`P1DT2H30M15S`).
/// Fractional values are accepted on the seconds component only
/// (`PT0.25S`). Negative durations are rejected.
///
/// # Errors
///
/// Returns [`DurationError`] when the input is empty, malformed, or
/// contains an unparseable component.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }

    let rest = s
        .strip_prefix('P')
        .ok_or_else(|| DurationError::InvalidFormat(s.to_string()))?;

    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    if date_part.is_empty() && time_part.map_or(true, str::is_empty) {
        return Err(DurationError::InvalidFormat(s.to_string()));
    }

    let mut total = Duration::ZERO;

    for (value, unit) in split_components(date_part, s)? {
        let secs = match unit {
            'D' => parse_integer(&value)? * 86_400,
            'W' => parse_integer(&value)? * 604_800,
            _ => return Err(DurationError::InvalidFormat(s.to_string())),
        };
        total += Duration::from_secs(secs);
    }

    if let Some(time_part) = time_part {
        for (value, unit) in split_components(time_part, s)? {
            match unit {
                'H' => total += Duration::from_secs(parse_integer(&value)? * 3_600),
                'M' => total += Duration::from_secs(parse_integer(&value)? * 60),
                'S' => {
                    let secs: f64 = value
                        .parse()
                        .map_err(|_| DurationError::InvalidComponent(value.clone()))?;
                    if secs < 0.0 {
                        return Err(DurationError::InvalidComponent(value));
                    }
                    total += Duration::from_secs_f64(secs);
                }
                _ => return Err(DurationError::InvalidFormat(s.to_string())),
            }
        }
    }

    Ok(total)
}

/// Formats a [`Duration`] as an ISO-8601 duration string.
///
/// Always uses the time designator (`PT...`); sub-second precision is
/// rendered as fractional seconds with trailing zeros trimmed.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "PT0S".to_string();
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let secs = total_secs % 60;
    let nanos = d.subsec_nanos();

    let mut out = String::from("PT");
    if hours > 0 {
        out.push_str(&format!("{hours}H"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}M"));
    }
    if secs > 0 || nanos > 0 || out == "PT" {
        if nanos > 0 {
            let frac = format!("{:.9}", f64::from(nanos) / 1e9);
            let frac = frac.trim_start_matches('0').trim_end_matches('0');
            out.push_str(&format!("{secs}{frac}S"));
        } else {
            out.push_str(&format!("{secs}S"));
        }
    }
    out
}

fn parse_integer(value: &str) -> Result<u64, DurationError> {
    value
        .parse::<u64>()
        .map_err(|_| DurationError::InvalidComponent(value.to_string()))
}

/// Splits `12H30M` into `[("12", 'H'), ("30", 'M')]`.
fn split_components(part: &str, whole: &str) -> Result<Vec<(String, char)>, DurationError> {
    let mut components = Vec::new();
    let mut value = String::new();

    for ch in part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            value.push(ch);
        } else if ch.is_ascii_alphabetic() {
            if value.is_empty() {
                return Err(DurationError::InvalidFormat(whole.to_string()));
            }
            components.push((std::mem::take(&mut value), ch.to_ascii_uppercase()));
        } else {
            return Err(DurationError::InvalidFormat(whole.to_string()));
        }
    }

    if !value.is_empty() {
        return Err(DurationError::InvalidFormat(whole.to_string()));
    }

    Ok(components)
}

/// Serde adapter for `Option<Duration>` fields carried as ISO-8601 strings.
pub mod iso_opt {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes an optional duration as an ISO-8601 string.
    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes an optional ISO-8601 duration string.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) => parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Serde adapter for required `Duration` fields carried as ISO-8601 strings.
pub mod iso {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as an ISO-8601 string.
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*value))
    }

    /// Deserializes an ISO-8601 duration string.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
