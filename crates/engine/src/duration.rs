//! Duration parsing for workflow/step options.
//!
//! Accepts a bare millisecond count or a string matching `^(\d+)(ms|s|m|h|d)$`.
//! Anything else is a configuration error, surfaced at workflow registration.

use std::time::Duration;

use once_cell_regex::DURATION_RE;
use thiserror::Error;

/// Error returned when a duration string/value cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid duration: {0:?}")]
pub struct DurationParseError(pub String);

/// Anything that can be coerced into a [`Duration`]: a plain millisecond
/// count, or a string like `"250ms"`, `"5s"`, `"2m"`, `"1h"`, `"1d"`.
pub fn parse_duration_value(value: &serde_json::Value) -> Result<Duration, DurationParseError> {
    match value {
        serde_json::Value::Number(n) => {
            let millis = n
                .as_u64()
                .ok_or_else(|| DurationParseError(n.to_string()))?;
            Ok(Duration::from_millis(millis))
        }
        serde_json::Value::String(s) => parse_duration_str(s),
        other => Err(DurationParseError(other.to_string())),
    }
}

/// Parse a duration string per the grammar `^(\d+)(ms|s|m|h|d)$`.
pub fn parse_duration_str(s: &str) -> Result<Duration, DurationParseError> {
    let caps = DURATION_RE
        .captures(s)
        .ok_or_else(|| DurationParseError(s.to_string()))?;
    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| DurationParseError(s.to_string()))?;
    let unit = &caps[2];
    let millis = match unit {
        "ms" => amount,
        "s" => amount.saturating_mul(1_000),
        "m" => amount.saturating_mul(60_000),
        "h" => amount.saturating_mul(3_600_000),
        "d" => amount.saturating_mul(86_400_000),
        _ => return Err(DurationParseError(s.to_string())),
    };
    Ok(Duration::from_millis(millis))
}

/// Regex lives in its own tiny module so the `once_cell` stays private to
/// this file's concern rather than leaking into the rest of the crate.
mod once_cell_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    pub struct LazyRegex(OnceLock<Regex>, &'static str);

    impl std::ops::Deref for LazyRegex {
        type Target = Regex;
        fn deref(&self) -> &Regex {
            self.0.get_or_init(|| Regex::new(self.1).unwrap())
        }
    }

    pub static DURATION_RE: LazyRegex = LazyRegex(OnceLock::new(), r"^(\d+)(ms|s|m|h|d)$");
}
