use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration {input:?}: expected <number>[ms|s|m|h]")]
pub struct DurationError {
    pub input: String,
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)?)(ms|s|m|h)?$").expect("valid regex"))
}

/// Parses a duration string into milliseconds. The unit suffix defaults
/// to milliseconds when absent.
pub fn parse_duration(input: &str) -> Result<u64, DurationError> {
    let trimmed = input.trim();
    let captures = pattern().captures(trimmed).ok_or_else(|| DurationError {
        input: input.to_string(),
    })?;

    let value: f64 = captures[1].parse().map_err(|_| DurationError {
        input: input.to_string(),
    })?;
    let multiplier = match captures.get(2).map(|unit| unit.as_str()) {
        None | Some("ms") => 1.0,
        Some("s") => 1_000.0,
        Some("m") => 60_000.0,
        Some("h") => 3_600_000.0,
        Some(_) => unreachable!("pattern restricts units"),
    };

    let ms = value * multiplier;
    if !ms.is_finite() || ms < 0.0 {
        return Err(DurationError {
            input: input.to_string(),
        });
    }
    Ok(ms.round() as u64)
}
