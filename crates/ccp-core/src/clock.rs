use chrono::{TimeZone, Utc};
use std::time::Instant;

/// Single monotonic time source for a session. Captures a high-resolution
/// start tick and a wall-clock epoch at construction; every `tMs` in the
/// bundle is measured against the tick, and the epoch anchors those
/// relative values to wall time for external correlation.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    start: Instant,
    epoch_ms: i64,
}

impl SessionClock {
    pub fn start_now() -> Self {
        Self {
            start: Instant::now(),
            epoch_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Milliseconds elapsed since session start.
    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn started_at_ms_epoch(&self) -> i64 {
        self.epoch_ms
    }

    pub fn started_at_iso(&self) -> String {
        iso_from_epoch_ms(self.epoch_ms)
    }

    /// Wall-clock epoch of "now", derived from the monotonic offset so it
    /// never runs backwards relative to the anchor.
    pub fn now_ms_epoch(&self) -> i64 {
        self.epoch_ms + self.now_ms() as i64
    }
}

pub fn iso_from_epoch_ms(epoch_ms: i64) -> String {
    Utc.timestamp_millis_opt(epoch_ms)
        .single()
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic() {
        let clock = SessionClock::start_now();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[test]
    fn iso_anchor_matches_epoch() {
        let clock = SessionClock::start_now();
        let iso = clock.started_at_iso();
        let parsed = chrono::DateTime::parse_from_rfc3339(&iso).expect("valid iso");
        assert_eq!(parsed.timestamp_millis(), clock.started_at_ms_epoch());
    }

    #[test]
    fn epoch_now_tracks_monotonic_offset() {
        let clock = SessionClock::start_now();
        assert!(clock.now_ms_epoch() >= clock.started_at_ms_epoch());
    }
}
