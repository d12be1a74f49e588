use ccp_core::schema::{MarkerEvent, MarkerLine};
use chrono::DateTime;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::trace;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Tails the append-only `markers.jsonl` that sibling `mark` invocations
/// write into. Polling with a byte cursor instead of a filesystem watcher
/// keeps ordering and batching deterministic; sibling writes are one
/// atomic line each.
pub struct MarkerWatcher {
    task: JoinHandle<()>,
}

impl MarkerWatcher {
    pub fn spawn(
        path: PathBuf,
        started_at_ms_epoch: i64,
        poll_interval_ms: u64,
        tx: mpsc::UnboundedSender<MarkerEvent>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_millis(poll_interval_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut cursor: u64 = 0;
            let in_flight = Arc::new(AtomicBool::new(false));

            loop {
                ticker.tick().await;
                if in_flight.swap(true, Ordering::AcqRel) {
                    continue;
                }
                let tick_path = path.clone();
                let tick_flag = in_flight.clone();
                let tick_result = tokio::task::spawn_blocking(move || {
                    let outcome = read_delta(&tick_path, cursor);
                    tick_flag.store(false, Ordering::Release);
                    outcome
                })
                .await;

                let Ok(Some((delta, new_cursor))) = tick_result else {
                    continue;
                };
                cursor = new_cursor;
                for event in parse_marker_lines(&delta, started_at_ms_epoch) {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

/// Reads exactly the bytes appended past `cursor`. I/O errors are
/// swallowed until the next tick.
fn read_delta(path: &std::path::Path, cursor: u64) -> Option<(Vec<u8>, u64)> {
    let metadata = std::fs::metadata(path).ok()?;
    let size = metadata.len();
    if size <= cursor {
        return None;
    }
    let mut file = File::open(path).ok()?;
    file.seek(SeekFrom::Start(cursor)).ok()?;
    let mut buffer = vec![0u8; (size - cursor) as usize];
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(_) => break,
        }
    }
    if filled == 0 {
        return None;
    }
    buffer.truncate(filled);
    let advanced = cursor + filled as u64;
    Some((buffer, advanced))
}

/// Splits a delta on newlines and derives one [`MarkerEvent`] per
/// parseable line. A `tMs` field wins over `tIso`; events before session
/// start are dropped.
pub fn parse_marker_lines(delta: &[u8], started_at_ms_epoch: i64) -> Vec<MarkerEvent> {
    let text = String::from_utf8_lossy(delta);
    let mut events = Vec::new();
    for line in text.split('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<MarkerLine>(trimmed) else {
            trace!("skipping unparseable marker line");
            continue;
        };
        let t_ms = match parsed.t_ms {
            Some(explicit) => explicit,
            None => match DateTime::parse_from_rfc3339(&parsed.t_iso) {
                Ok(timestamp) => timestamp.timestamp_millis() - started_at_ms_epoch,
                Err(_) => continue,
            },
        };
        if t_ms < 0 {
            continue;
        }
        events.push(MarkerEvent {
            t_ms: t_ms as u64,
            label: parsed.label,
            label_sha256: parsed.label_sha256,
        });
    }
    events
}
