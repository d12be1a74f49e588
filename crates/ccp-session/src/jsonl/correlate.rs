use super::{extract_role, extract_timestamp_epoch_ms, RecordRole};
use ccp_core::schema::{
    CorrelationMode, ExternalLogCorrelation, TurnEvent, TurnLogStats,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

const PRE_SESSION_SLACK_MS: i64 = 10_000;
const POST_SESSION_SLACK_MS: i64 = 60_000;
const MAX_TOOL_NAME_CHARS: usize = 120;

#[derive(Debug, Default)]
struct TurnBucket {
    record_count: u64,
    record_bytes: u64,
    tool_use_count: u64,
    tool_use_names: BTreeSet<String>,
    input_tokens: u64,
    output_tokens: u64,
}

/// Post-session pass over the external log: maps each record to a turn
/// (by timestamp when possible, by user-record sequence otherwise) and
/// aggregates counts. Only derived aggregates appear in the result —
/// record content never does.
pub fn correlate(
    path: &Path,
    started_at_ms_epoch: i64,
    ended_at_ms_epoch: i64,
    turns: &[TurnEvent],
) -> io::Result<ExternalLogCorrelation> {
    let reader = BufReader::new(File::open(path)?);

    let mut parsed_lines = 0u64;
    let mut parsed_bytes = 0u64;
    let mut parse_errors = 0u64;
    let mut buckets: Vec<TurnBucket> = turns.iter().map(|_| TurnBucket::default()).collect();

    let mut ts_pointer = 0usize;
    let mut seq_pointer: i64 = -1;
    let mut seq_exhausted = false;
    let mut any_ts_applied = false;
    let mut any_seq_applied = false;
    let mut any_ts_seen = false;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        parsed_lines += 1;
        let line_bytes = line.len() as u64;
        parsed_bytes += line_bytes;

        let record: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => {
                parse_errors += 1;
                continue;
            }
        };

        if let Some(record_epoch) = extract_timestamp_epoch_ms(&record) {
            any_ts_seen = true;
            if record_epoch < started_at_ms_epoch - PRE_SESSION_SLACK_MS {
                continue;
            }
            if record_epoch > ended_at_ms_epoch + POST_SESSION_SLACK_MS && any_ts_applied {
                // The remaining tail belongs to a later session.
                break;
            }
            if buckets.is_empty() {
                continue;
            }
            while ts_pointer + 1 < turns.len()
                && started_at_ms_epoch + turns[ts_pointer + 1].t_ms as i64 <= record_epoch
            {
                ts_pointer += 1;
            }
            apply_record(&mut buckets[ts_pointer], line_bytes, &record);
            any_ts_applied = true;
            continue;
        }

        if extract_role(&record) == Some(RecordRole::User) {
            if seq_exhausted {
                continue;
            }
            seq_pointer += 1;
            if seq_pointer as usize >= buckets.len() {
                seq_exhausted = true;
                continue;
            }
            apply_record(&mut buckets[seq_pointer as usize], line_bytes, &record);
            any_seq_applied = true;
        } else if seq_pointer >= 0 && !seq_exhausted {
            apply_record(&mut buckets[seq_pointer as usize], line_bytes, &record);
            any_seq_applied = true;
        }
    }

    let mode = if any_ts_applied {
        CorrelationMode::Timestamps
    } else if any_seq_applied {
        CorrelationMode::Sequential
    } else {
        CorrelationMode::None
    };

    let mut notes = Vec::new();
    if mode == CorrelationMode::None {
        notes.push("no usable timestamps or user-message markers".to_string());
    }
    if any_ts_seen && !any_ts_applied {
        notes.push("timestamps present but outside session window".to_string());
    }

    let per_turn = turns
        .iter()
        .zip(buckets)
        .map(|(turn, bucket)| TurnLogStats {
            turn_index: turn.index,
            record_count: bucket.record_count,
            record_bytes: bucket.record_bytes,
            tool_use_count: bucket.tool_use_count,
            tool_use_names: bucket.tool_use_names.into_iter().collect(),
            input_token_count: (bucket.input_tokens > 0).then_some(bucket.input_tokens),
            output_token_count: (bucket.output_tokens > 0).then_some(bucket.output_tokens),
        })
        .collect();

    Ok(ExternalLogCorrelation {
        mode,
        parsed_lines,
        parsed_bytes,
        parse_errors,
        per_turn,
        notes,
    })
}

fn apply_record(bucket: &mut TurnBucket, line_bytes: u64, record: &Value) {
    bucket.record_count += 1;
    bucket.record_bytes += line_bytes;

    for name in extract_tool_names(record) {
        bucket.tool_use_count += 1;
        bucket.tool_use_names.insert(name);
    }

    if let Some(usage) = find_usage(record) {
        bucket.input_tokens += first_count(usage, &["input_tokens", "inputTokens", "prompt_tokens"]);
        bucket.output_tokens += first_count(
            usage,
            &["output_tokens", "outputTokens", "completion_tokens"],
        );
    }
}

fn extract_tool_names(record: &Value) -> Vec<String> {
    let mut names = Vec::new();

    for field in ["tool_name", "toolName"] {
        if let Some(name) = record.get(field).and_then(Value::as_str) {
            push_name(&mut names, name);
        }
    }
    if let Some(name) = record
        .get("tool")
        .and_then(|tool| tool.get("name"))
        .and_then(Value::as_str)
    {
        push_name(&mut names, name);
    }

    let content_arrays = [
        record.get("content"),
        record.get("message").and_then(|message| message.get("content")),
    ];
    for array in content_arrays.into_iter().flatten() {
        let Some(elements) = array.as_array() else {
            continue;
        };
        for element in elements {
            let is_tool = element
                .get("type")
                .and_then(Value::as_str)
                .map(|kind| kind.contains("tool"))
                .unwrap_or(false);
            if !is_tool {
                continue;
            }
            if let Some(name) = element.get("name").and_then(Value::as_str) {
                push_name(&mut names, name);
            }
        }
    }
    names
}

fn push_name(names: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    names.push(trimmed.chars().take(MAX_TOOL_NAME_CHARS).collect());
}

fn find_usage(record: &Value) -> Option<&Value> {
    for field in ["usage", "token_usage", "tokenUsage"] {
        if let Some(usage) = record.get(field) {
            if usage.is_object() {
                return Some(usage);
            }
        }
    }
    record
        .get("message")
        .and_then(|message| message.get("usage"))
        .filter(|usage| usage.is_object())
}

fn first_count(usage: &Value, fields: &[&str]) -> u64 {
    fields
        .iter()
        .find_map(|field| usage.get(field).and_then(Value::as_u64))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccp_core::schema::TurnSource;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const STARTED: i64 = 1_750_000_000_000;

    fn turn(index: u32, t_ms: u64) -> TurnEvent {
        TurnEvent {
            index,
            t_ms,
            source: TurnSource::Enter,
        }
    }

    fn log_file<S: AsRef<str>>(lines: &[S]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp log");
        for line in lines {
            writeln!(file, "{}", line.as_ref()).expect("write line");
        }
        file
    }

    #[test]
    fn timestamp_mode_aggregates_tools_and_tokens() {
        let file = log_file(&[
            &format!(
                r#"{{"type":"user","timestamp":{},"message":{{"content":"PLEASE FIX secret_module.rs"}},"usage":{{"input_tokens":10}}}}"#,
                STARTED + 1_000
            ),
            &format!(
                r#"{{"type":"assistant","timestamp":{},"content":[{{"type":"text"}},{{"type":"tool_use","name":"read_file"}}],"usage":{{"output_tokens":20}}}}"#,
                STARTED + 1_500
            ),
            &format!(
                r#"{{"timestamp":{},"tool_name":"exec_command"}}"#,
                STARTED + 1_600
            ),
        ]);

        let turns = [turn(1, 900)];
        let correlation =
            correlate(file.path(), STARTED, STARTED + 5_000, &turns).expect("correlate");

        assert_eq!(correlation.mode, CorrelationMode::Timestamps);
        assert_eq!(correlation.parsed_lines, 3);
        assert_eq!(correlation.parse_errors, 0);
        assert_eq!(correlation.per_turn.len(), 1);

        let stats = &correlation.per_turn[0];
        assert_eq!(stats.turn_index, 1);
        assert_eq!(stats.record_count, 3);
        assert_eq!(
            stats.tool_use_names,
            vec!["exec_command".to_string(), "read_file".to_string()]
        );
        assert_eq!(stats.input_token_count, Some(10));
        assert_eq!(stats.output_token_count, Some(20));

        let serialized = serde_json::to_string(&correlation).expect("serialize");
        assert!(!serialized.contains("PLEASE FIX"));
        assert!(!serialized.contains("secret_module"));
    }

    #[test]
    fn records_route_to_the_turn_preceding_them() {
        let file = log_file(&[
            &format!(r#"{{"timestamp":{},"tool_name":"first"}}"#, STARTED + 500),
            &format!(r#"{{"timestamp":{},"tool_name":"second"}}"#, STARTED + 2_500),
        ]);

        let turns = [turn(1, 0), turn(2, 2_000)];
        let correlation =
            correlate(file.path(), STARTED, STARTED + 5_000, &turns).expect("correlate");
        assert_eq!(correlation.per_turn[0].tool_use_names, vec!["first"]);
        assert_eq!(correlation.per_turn[1].tool_use_names, vec!["second"]);
    }

    #[test]
    fn pre_session_records_are_discarded_and_late_tail_stops() {
        let file = log_file(&[
            &format!(r#"{{"timestamp":{},"tool_name":"old"}}"#, STARTED - 60_000),
            &format!(r#"{{"timestamp":{},"tool_name":"live"}}"#, STARTED + 100),
            &format!(
                r#"{{"timestamp":{},"tool_name":"next_session"}}"#,
                STARTED + 10_000_000
            ),
            &format!(r#"{{"timestamp":{},"tool_name":"never_read"}}"#, STARTED + 200),
        ]);

        let turns = [turn(1, 0)];
        let correlation =
            correlate(file.path(), STARTED, STARTED + 5_000, &turns).expect("correlate");
        assert_eq!(correlation.per_turn[0].tool_use_names, vec!["live"]);
        // Streaming stopped at the out-of-window record.
        assert_eq!(correlation.parsed_lines, 3);
    }

    #[test]
    fn sequential_mode_follows_user_records() {
        let file = log_file(&[
            r#"{"type":"assistant","tool_name":"before_any_user"}"#,
            r#"{"type":"user"}"#,
            r#"{"type":"assistant","tool_name":"turn_one_tool"}"#,
            r#"{"type":"user"}"#,
            r#"{"type":"assistant","tool_name":"turn_two_tool"}"#,
            r#"{"type":"user"}"#,
            r#"{"type":"assistant","tool_name":"dropped"}"#,
        ]);

        let turns = [turn(1, 0), turn(2, 1_000)];
        let correlation =
            correlate(file.path(), STARTED, STARTED + 5_000, &turns).expect("correlate");

        assert_eq!(correlation.mode, CorrelationMode::Sequential);
        assert_eq!(correlation.per_turn[0].tool_use_names, vec!["turn_one_tool"]);
        assert_eq!(correlation.per_turn[1].tool_use_names, vec!["turn_two_tool"]);
        // Once a user record advances past the last turn, assignment stops.
        assert_eq!(correlation.per_turn[1].record_count, 2);
    }

    #[test]
    fn mode_none_notes_missing_markers() {
        let file = log_file(&[r#"{"kind":"snapshot"}"#, "{broken"]);
        let turns = [turn(1, 0)];
        let correlation =
            correlate(file.path(), STARTED, STARTED + 5_000, &turns).expect("correlate");
        assert_eq!(correlation.mode, CorrelationMode::None);
        assert_eq!(correlation.parse_errors, 1);
        assert!(correlation
            .notes
            .iter()
            .any(|note| note.contains("no usable timestamps")));
    }

    #[test]
    fn out_of_window_timestamps_are_noted() {
        let file = log_file(&[&format!(
            r#"{{"timestamp":{},"tool_name":"old"}}"#,
            STARTED - 100_000
        )]);
        let turns = [turn(1, 0)];
        let correlation =
            correlate(file.path(), STARTED, STARTED + 5_000, &turns).expect("correlate");
        assert_eq!(correlation.mode, CorrelationMode::None);
        assert!(correlation
            .notes
            .iter()
            .any(|note| note.contains("outside session window")));
    }

    #[test]
    fn zero_token_totals_are_omitted() {
        let file = log_file(&[&format!(
            r#"{{"timestamp":{},"usage":{{"input_tokens":0,"output_tokens":0}}}}"#,
            STARTED + 100
        )]);
        let turns = [turn(1, 0)];
        let correlation =
            correlate(file.path(), STARTED, STARTED + 5_000, &turns).expect("correlate");
        assert!(correlation.per_turn[0].input_token_count.is_none());
        assert!(correlation.per_turn[0].output_token_count.is_none());
    }

    #[test]
    fn long_tool_names_are_truncated_and_deduped() {
        let long_name = "x".repeat(400);
        let file = log_file(&[
            &format!(
                r#"{{"timestamp":{},"tool_name":"  {long_name}"}}"#,
                STARTED + 100
            ),
            &format!(r#"{{"timestamp":{},"tool_name":"{long_name}"}}"#, STARTED + 200),
        ]);
        let turns = [turn(1, 0)];
        let correlation =
            correlate(file.path(), STARTED, STARTED + 5_000, &turns).expect("correlate");
        let stats = &correlation.per_turn[0];
        assert_eq!(stats.tool_use_count, 2);
        assert_eq!(stats.tool_use_names.len(), 1);
        assert_eq!(stats.tool_use_names[0].chars().count(), 120);
    }
}
