//! ISO-8601 duration formatting and parsing.
//!
//! Expiration timeouts cross the wire and the snapshot format as ISO-8601
//! duration strings (`PT60S`, `PT1H30M`, `P2DT3H`). Only the day/time
//! designators are supported; years and months are not meaningful for
//! timeouts and are rejected.

use std::time::Duration;

use thiserror::Error;

/// Error parsing an ISO-8601 duration string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("invalid ISO-8601 duration: {0:?}")]
    Invalid(String),
    #[error("unsupported ISO-8601 designator {designator:?} in {input:?}")]
    Unsupported { input: String, designator: char },
}

/// Formats a duration as an ISO-8601 string.
///
/// Output uses seconds with an optional fractional part, folding larger
/// units in only when they divide evenly (`PT90S`, not `PT1M30S`, except
/// exact minutes/hours/days which render as `PT2M`, `PT1H`, `P1D`).
pub fn format_iso8601(duration: Duration) -> String {
    let secs = duration.as_secs();
    let nanos = duration.subsec_nanos();

    if nanos == 0 && secs > 0 {
        if secs % 86_400 == 0 {
            return format!("P{}D", secs / 86_400);
        }
        if secs % 3_600 == 0 {
            return format!("PT{}H", secs / 3_600);
        }
        if secs % 60 == 0 {
            return format!("PT{}M", secs / 60);
        }
    }

    if nanos == 0 {
        format!("PT{secs}S")
    } else {
        // Trim trailing zeros from the fractional part.
        let frac = format!("{nanos:09}");
        let frac = frac.trim_end_matches('0');
        format!("PT{secs}.{frac}S")
    }
}

/// Parses an ISO-8601 duration string into a [`Duration`].
pub fn parse_iso8601(input: &str) -> Result<Duration, DurationParseError> {
    let invalid = || DurationParseError::Invalid(input.to_string());

    let rest = input.strip_prefix('P').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };
    if time_part == Some("") {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    total += parse_segment(date_part, false, input)?;
    if let Some(time) = time_part {
        total += parse_segment(time, true, input)?;
    }
    Ok(total)
}

/// Parses one `<number><designator>...` segment (the date or time part).
fn parse_segment(
    segment: &str,
    in_time: bool,
    input: &str,
) -> Result<Duration, DurationParseError> {
    let mut total = Duration::ZERO;
    let mut rest = segment;

    while !rest.is_empty() {
        let end = rest
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(|| DurationParseError::Invalid(input.to_string()))?;
        let value: f64 = rest[..end]
            .parse()
            .map_err(|_| DurationParseError::Invalid(input.to_string()))?;
        let designator = rest[end..].chars().next().expect("found above");
        rest = &rest[end + designator.len_utf8()..];

        let seconds_per_unit = match (designator, in_time) {
            ('D', false) => 86_400.0,
            ('H', true) => 3_600.0,
            ('M', true) => 60.0,
            ('S', true) => 1.0,
            _ => {
                return Err(DurationParseError::Unsupported {
                    input: input.to_string(),
                    designator,
                });
            }
        };
        total += Duration::from_secs_f64(value * seconds_per_unit);
    }

    Ok(total)
}

/// Serde adapter serializing [`Duration`] as an ISO-8601 string.
///
/// Use as `#[serde(with = "covalent_types::duration::iso8601")]`.
pub mod iso8601 {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_iso8601(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_iso8601(&raw).map_err(D::Error::custom)
    }

    /// Adapter for `Option<Duration>` fields.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => {
                    serializer.serialize_some(&crate::duration::format_iso8601(*duration))
                }
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => crate::duration::parse_iso8601(&raw)
                    .map(Some)
                    .map_err(D::Error::custom),
                None => Ok(None),
            }
        }
    }
}
