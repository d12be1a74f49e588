//! External conversation-log tracking: selection of the append-only
//! JSONL file the assistant writes, per-turn size sampling, and the
//! opt-in post-session correlator.

pub mod correlate;
pub mod tracker;

pub use correlate::correlate;
pub use tracker::{project_dir_name, JsonlTracker, JsonlTrackerConfig};

use chrono::DateTime;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRole {
    User,
    Assistant,
}

/// Role from `type`, `role`, or `message.role`; only user/assistant are
/// recognized, case-insensitively.
pub fn extract_role(record: &Value) -> Option<RecordRole> {
    let raw = record
        .get("type")
        .and_then(Value::as_str)
        .or_else(|| record.get("role").and_then(Value::as_str))
        .or_else(|| {
            record
                .get("message")
                .and_then(|message| message.get("role"))
                .and_then(Value::as_str)
        })?;
    match raw.to_ascii_lowercase().as_str() {
        "user" => Some(RecordRole::User),
        "assistant" => Some(RecordRole::Assistant),
        _ => None,
    }
}

const TIMESTAMP_FIELDS: [&str; 5] = ["timestamp", "time", "created_at", "createdAt", "ts"];

/// Epoch-milliseconds timestamp from the known field spellings. Numbers
/// above 10^12 are already milliseconds, above 10^9 seconds; strings are
/// ISO-8601.
pub fn extract_timestamp_epoch_ms(record: &Value) -> Option<i64> {
    let candidate = TIMESTAMP_FIELDS
        .iter()
        .find_map(|field| record.get(field))
        .or_else(|| {
            record
                .get("meta")
                .and_then(|meta| meta.get("timestamp"))
        })?;

    match candidate {
        Value::Number(number) => {
            let value = number.as_f64()?;
            if value > 1e12 {
                Some(value as i64)
            } else if value > 1e9 {
                Some((value * 1_000.0) as i64)
            } else {
                None
            }
        }
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.timestamp_millis()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_comes_from_any_known_spot() {
        assert_eq!(
            extract_role(&json!({"type": "user"})),
            Some(RecordRole::User)
        );
        assert_eq!(
            extract_role(&json!({"role": "ASSISTANT"})),
            Some(RecordRole::Assistant)
        );
        assert_eq!(
            extract_role(&json!({"message": {"role": "user"}})),
            Some(RecordRole::User)
        );
        assert_eq!(extract_role(&json!({"type": "summary"})), None);
        assert_eq!(extract_role(&json!({})), None);
    }

    #[test]
    fn numeric_timestamps_use_magnitude_heuristic() {
        assert_eq!(
            extract_timestamp_epoch_ms(&json!({"ts": 1_750_000_000_000_i64})),
            Some(1_750_000_000_000)
        );
        assert_eq!(
            extract_timestamp_epoch_ms(&json!({"time": 1_750_000_000})),
            Some(1_750_000_000_000)
        );
        assert_eq!(extract_timestamp_epoch_ms(&json!({"ts": 42})), None);
    }

    #[test]
    fn iso_strings_and_nested_meta_parse() {
        assert_eq!(
            extract_timestamp_epoch_ms(&json!({"timestamp": "2025-06-15T15:06:40+00:00"})),
            Some(1_750_000_000_000)
        );
        assert_eq!(
            extract_timestamp_epoch_ms(&json!({"meta": {"timestamp": 1_750_000_000_500_i64}})),
            Some(1_750_000_000_500)
        );
        assert_eq!(
            extract_timestamp_epoch_ms(&json!({"createdAt": "not a date"})),
            None
        );
    }
}
