//! Turn and interaction detection from opaque byte counts.
//!
//! The tracker consumes `(input, byte_len)` and `(output, byte_len)`
//! events plus manual turn marks and emits [`TurnEvent`]s and finalized
//! [`Interaction`]s. It never retains byte content; the only inspection
//! the host performs on input bytes is the line-terminator test and the
//! hotkey match, both reduced to flags before they reach this crate.
//!
//! Timers are modelled as deadlines on the active interactions instead of
//! scheduled callbacks: the owner asks [`InteractionTracker::next_deadline`]
//! when to wake and drives [`InteractionTracker::poll_timers`]. A deadline
//! cleared at finalization can never fire stale, which stands in for the
//! generation counters a callback-timer design would need.

use ccp_core::schema::{EndReason, Interaction, InteractionKind, TurnEvent, TurnSource};

/// Pre-scanned property of an input chunk: does it contain `\r` or `\n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatorHint {
    Newline,
    None,
}

impl TerminatorHint {
    pub fn scan(chunk: &[u8]) -> Self {
        if chunk.iter().any(|byte| *byte == b'\r' || *byte == b'\n') {
            TerminatorHint::Newline
        } else {
            TerminatorHint::None
        }
    }
}

/// The two-byte `alt+t` chunks (`ESC t` / `ESC T`). The host swallows a
/// matching chunk instead of forwarding it to the child.
pub fn hotkey_chunk_matches(chunk: &[u8]) -> bool {
    matches!(chunk, [0x1b, 0x74] | [0x1b, 0x54])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Turn(TurnEvent),
    Interaction(Interaction),
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub burst_idle_ms: u64,
    pub interaction_timeout_ms: u64,
    /// When false (manual-hotkey-only profiling), line terminators do not
    /// begin turns.
    pub enter_begins_turn: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            burst_idle_ms: 30,
            interaction_timeout_ms: 2_000,
            enter_begins_turn: true,
        }
    }
}

#[derive(Debug)]
struct ActiveInteraction {
    id: u64,
    kind: InteractionKind,
    t0_ms: u64,
    first_output_at_ms: Option<u64>,
    last_output_at_ms: Option<u64>,
    input_bytes: u64,
    output_bytes: u64,
    turn_index: Option<u32>,
    idle_deadline_ms: Option<u64>,
    no_output_deadline_ms: Option<u64>,
}

impl ActiveInteraction {
    fn new(id: u64, kind: InteractionKind, t0_ms: u64, turn_index: Option<u32>) -> Self {
        Self {
            id,
            kind,
            t0_ms,
            first_output_at_ms: None,
            last_output_at_ms: None,
            input_bytes: 0,
            output_bytes: 0,
            turn_index,
            idle_deadline_ms: None,
            no_output_deadline_ms: None,
        }
    }

    fn observe_output(&mut self, now_ms: u64, byte_len: u64, burst_idle_ms: u64) {
        if self.first_output_at_ms.is_none() {
            self.first_output_at_ms = Some(now_ms);
            self.no_output_deadline_ms = None;
        }
        self.last_output_at_ms = Some(now_ms);
        self.output_bytes += byte_len;
        self.idle_deadline_ms = Some(now_ms + burst_idle_ms);
    }

    fn into_finalized(mut self, end_reason: EndReason) -> Interaction {
        self.idle_deadline_ms = None;
        self.no_output_deadline_ms = None;
        Interaction {
            id: self.id,
            kind: self.kind,
            t0_ms: self.t0_ms,
            t1_ms: self.first_output_at_ms.map(|at| at - self.t0_ms),
            t2_ms: self.last_output_at_ms.map(|at| at - self.t0_ms),
            input_bytes: self.input_bytes,
            output_bytes: self.output_bytes,
            turn_index: self.turn_index,
            end_reason,
        }
    }
}

/// State machine with two active slots: at most one keystroke window and
/// at most one turn window. Emissions accumulate in order and are taken
/// with [`InteractionTracker::drain_events`].
#[derive(Debug)]
pub struct InteractionTracker {
    config: TrackerConfig,
    next_id: u64,
    turn_index: u32,
    keystroke: Option<ActiveInteraction>,
    turn: Option<ActiveInteraction>,
    pending: Vec<TrackerEvent>,
    ended: bool,
}

impl InteractionTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            next_id: 0,
            turn_index: 0,
            keystroke: None,
            turn: None,
            pending: Vec::new(),
            ended: false,
        }
    }

    /// Ordered emissions produced by calls since the last drain.
    pub fn drain_events(&mut self) -> Vec<TrackerEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Earliest pending deadline across both slots, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        let deadlines = [&self.keystroke, &self.turn]
            .into_iter()
            .flatten()
            .flat_map(|active| {
                [active.idle_deadline_ms, active.no_output_deadline_ms]
                    .into_iter()
                    .flatten()
            });
        deadlines.min()
    }

    pub fn handle_input(&mut self, now_ms: u64, byte_len: u64, hint: TerminatorHint) {
        if self.ended {
            return;
        }

        if self.keystroke.is_none() {
            let id = self.alloc_id();
            self.keystroke = Some(ActiveInteraction::new(
                id,
                InteractionKind::Keystroke,
                now_ms,
                None,
            ));
        }
        if let Some(keystroke) = self.keystroke.as_mut() {
            keystroke.input_bytes += byte_len;
        }

        if hint == TerminatorHint::Newline && self.config.enter_begins_turn {
            self.begin_turn(TurnSource::Enter, now_ms);
            if let Some(turn) = self.turn.as_mut() {
                turn.input_bytes += byte_len;
            }
        } else if let Some(turn) = self.turn.as_mut() {
            turn.input_bytes += byte_len;
        }
    }

    pub fn handle_output(&mut self, now_ms: u64, byte_len: u64) {
        if self.ended {
            return;
        }
        let burst_idle_ms = self.config.burst_idle_ms;
        if let Some(keystroke) = self.keystroke.as_mut() {
            keystroke.observe_output(now_ms, byte_len, burst_idle_ms);
        }
        if let Some(turn) = self.turn.as_mut() {
            turn.observe_output(now_ms, byte_len, burst_idle_ms);
        }
    }

    /// Manual turn boundary (hotkey path). The host has already swallowed
    /// the escape chunk, so no input bytes accompany the mark.
    pub fn mark_turn(&mut self, now_ms: u64, source: TurnSource) {
        if self.ended {
            return;
        }
        self.begin_turn(source, now_ms);
    }

    /// Fires any deadline that is due at `now_ms`. Idle deadlines finalize
    /// with `burst_idle`; a no-output deadline finalizes with `timeout`
    /// only while no output has been observed.
    pub fn poll_timers(&mut self, now_ms: u64) {
        if self.ended {
            return;
        }
        if let Some(reason) = slot_due(&self.keystroke, now_ms) {
            if let Some(active) = self.keystroke.take() {
                self.push_finalized(active, reason);
            }
        }
        if let Some(reason) = slot_due(&self.turn, now_ms) {
            if let Some(active) = self.turn.take() {
                self.push_finalized(active, reason);
            }
        }
    }

    /// Finalizes any still-active interactions with `session_end`.
    /// Subsequent events are ignored.
    pub fn end_session(&mut self, _now_ms: u64) {
        if self.ended {
            return;
        }
        self.ended = true;
        if let Some(keystroke) = self.keystroke.take() {
            self.push_finalized(keystroke, EndReason::SessionEnd);
        }
        if let Some(turn) = self.turn.take() {
            self.push_finalized(turn, EndReason::SessionEnd);
        }
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_index
    }

    fn begin_turn(&mut self, source: TurnSource, now_ms: u64) {
        self.turn_index += 1;
        let index = self.turn_index;
        // The turn event must precede the overlap finalization it causes.
        self.pending.push(TrackerEvent::Turn(TurnEvent {
            index,
            t_ms: now_ms,
            source,
        }));

        if let Some(previous) = self.turn.take() {
            self.push_finalized(previous, EndReason::Overlap);
        }

        let id = self.alloc_id();
        let mut turn = ActiveInteraction::new(id, InteractionKind::Turn, now_ms, Some(index));
        turn.no_output_deadline_ms = Some(now_ms + self.config.interaction_timeout_ms);
        self.turn = Some(turn);
    }

    fn push_finalized(&mut self, active: ActiveInteraction, reason: EndReason) {
        self.pending
            .push(TrackerEvent::Interaction(active.into_finalized(reason)));
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn slot_due(slot: &Option<ActiveInteraction>, now_ms: u64) -> Option<EndReason> {
    let active = slot.as_ref()?;
    if matches!(active.idle_deadline_ms, Some(deadline) if deadline <= now_ms) {
        return Some(EndReason::BurstIdle);
    }
    let timeout_due =
        matches!(active.no_output_deadline_ms, Some(deadline) if deadline <= now_ms);
    if timeout_due && active.first_output_at_ms.is_none() {
        return Some(EndReason::Timeout);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> InteractionTracker {
        InteractionTracker::new(TrackerConfig::default())
    }

    fn interactions(events: &[TrackerEvent]) -> Vec<Interaction> {
        events
            .iter()
            .filter_map(|event| match event {
                TrackerEvent::Interaction(interaction) => Some(interaction.clone()),
                TrackerEvent::Turn(_) => None,
            })
            .collect()
    }

    fn turns(events: &[TrackerEvent]) -> Vec<TurnEvent> {
        events
            .iter()
            .filter_map(|event| match event {
                TrackerEvent::Turn(turn) => Some(*turn),
                TrackerEvent::Interaction(_) => None,
            })
            .collect()
    }

    #[test]
    fn keystroke_burst_finalizes_without_plaintext() {
        let mut tracker = tracker();
        tracker.handle_input(0, 6, TerminatorHint::scan(b"SECRET"));
        tracker.handle_output(5, 6);
        tracker.poll_timers(36);
        let events = tracker.drain_events();

        let finalized = interactions(&events);
        assert_eq!(finalized.len(), 1);
        let interaction = &finalized[0];
        assert_eq!(interaction.kind, InteractionKind::Keystroke);
        assert_eq!(interaction.input_bytes, 6);
        assert_eq!(interaction.output_bytes, 6);
        assert_eq!(interaction.end_reason, EndReason::BurstIdle);
        assert!(turns(&events).is_empty());

        let serialized = serde_json::to_string(&finalized).expect("serialize");
        assert!(!serialized.contains("SECRET"));
    }

    #[test]
    fn enter_begins_turn_and_burst_idle_closes_it() {
        let mut tracker = tracker();
        tracker.handle_input(0, 3, TerminatorHint::scan(b"hi\r"));

        let events = tracker.drain_events();
        let turn_events = turns(&events);
        assert_eq!(
            turn_events,
            vec![TurnEvent {
                index: 1,
                t_ms: 0,
                source: TurnSource::Enter,
            }]
        );

        tracker.handle_output(12, 10);
        tracker.poll_timers(43);
        let events = tracker.drain_events();
        let finalized = interactions(&events);

        let turn_interaction = finalized
            .iter()
            .find(|interaction| interaction.kind == InteractionKind::Turn)
            .expect("turn interaction");
        assert_eq!(turn_interaction.turn_index, Some(1));
        assert_eq!(turn_interaction.t1_ms, Some(12));
        assert_eq!(turn_interaction.t2_ms, Some(12));
        assert_eq!(turn_interaction.input_bytes, 3);
        assert_eq!(turn_interaction.output_bytes, 10);
        assert_eq!(turn_interaction.end_reason, EndReason::BurstIdle);
        assert_eq!(
            finalized
                .iter()
                .filter(|interaction| interaction.kind == InteractionKind::Turn)
                .count(),
            1
        );
    }

    #[test]
    fn overlapping_enters_yield_one_overlap_and_one_timeout() {
        let mut tracker = tracker();
        tracker.handle_input(0, 1, TerminatorHint::Newline);
        tracker.handle_input(10, 1, TerminatorHint::Newline);
        tracker.poll_timers(2_100);
        let events = tracker.drain_events();

        let turn_events = turns(&events);
        assert_eq!(
            turn_events.iter().map(|turn| turn.index).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let finalized = interactions(&events);
        let turn_interactions: Vec<_> = finalized
            .iter()
            .filter(|interaction| interaction.kind == InteractionKind::Turn)
            .collect();
        assert_eq!(turn_interactions.len(), 2);
        assert_eq!(turn_interactions[0].end_reason, EndReason::Overlap);
        assert_eq!(turn_interactions[0].turn_index, Some(1));
        assert_eq!(turn_interactions[1].end_reason, EndReason::Timeout);
        assert_eq!(turn_interactions[1].turn_index, Some(2));
    }

    #[test]
    fn turn_event_precedes_overlap_finalization() {
        let mut tracker = tracker();
        tracker.handle_input(0, 1, TerminatorHint::Newline);
        tracker.drain_events();
        tracker.handle_input(10, 1, TerminatorHint::Newline);
        let events = tracker.drain_events();

        let turn_position = events
            .iter()
            .position(|event| matches!(event, TrackerEvent::Turn(turn) if turn.index == 2))
            .expect("second turn event");
        let overlap_position = events
            .iter()
            .position(|event| {
                matches!(
                    event,
                    TrackerEvent::Interaction(interaction)
                        if interaction.end_reason == EndReason::Overlap
                )
            })
            .expect("overlap finalization");
        assert!(turn_position < overlap_position);
    }

    #[test]
    fn output_before_timeout_prevents_stale_timeout() {
        let mut tracker = tracker();
        tracker.handle_input(0, 1, TerminatorHint::Newline);
        tracker.handle_output(100, 4);
        // The old no-output deadline would have fired here.
        tracker.poll_timers(2_000);
        tracker.poll_timers(2_500);
        let finalized = interactions(&tracker.drain_events());
        assert!(finalized
            .iter()
            .all(|interaction| interaction.end_reason != EndReason::Timeout));
    }

    #[test]
    fn continued_output_pushes_idle_deadline_forward() {
        let mut tracker = tracker();
        tracker.handle_input(0, 1, TerminatorHint::None);
        tracker.handle_output(5, 10);
        assert_eq!(tracker.next_deadline(), Some(35));
        tracker.handle_output(20, 10);
        assert_eq!(tracker.next_deadline(), Some(50));
        tracker.poll_timers(35);
        assert!(interactions(&tracker.drain_events()).is_empty());
        tracker.poll_timers(50);
        let finalized = interactions(&tracker.drain_events());
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].t1_ms, Some(5));
        assert_eq!(finalized[0].t2_ms, Some(20));
        assert_eq!(finalized[0].output_bytes, 20);
    }

    #[test]
    fn turn_indices_stay_dense_across_sources() {
        let mut tracker = tracker();
        tracker.handle_input(0, 1, TerminatorHint::Newline);
        tracker.mark_turn(50, TurnSource::Hotkey);
        tracker.handle_input(100, 1, TerminatorHint::Newline);
        tracker.end_session(200);
        let turn_events = turns(&tracker.drain_events());
        assert_eq!(
            turn_events.iter().map(|turn| turn.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(turn_events[1].source, TurnSource::Hotkey);
    }

    #[test]
    fn every_interaction_finalizes_exactly_once() {
        let mut tracker = tracker();
        tracker.handle_input(0, 2, TerminatorHint::Newline);
        tracker.handle_output(10, 5);
        tracker.handle_input(20, 2, TerminatorHint::Newline);
        tracker.handle_output(30, 5);
        tracker.poll_timers(61);
        // Late polls after finalization must be no-ops.
        tracker.poll_timers(5_000);
        tracker.end_session(5_001);
        let finalized = interactions(&tracker.drain_events());

        let mut ids: Vec<u64> = finalized.iter().map(|interaction| interaction.id).collect();
        ids.sort_unstable();
        let deduped_len = {
            let mut deduped = ids.clone();
            deduped.dedup();
            deduped.len()
        };
        assert_eq!(ids.len(), deduped_len, "duplicate finalization: {ids:?}");

        for interaction in &finalized {
            if let (Some(t1), Some(t2)) = (interaction.t1_ms, interaction.t2_ms) {
                assert!(t1 <= t2);
            }
            assert_eq!(
                interaction.turn_index.is_some(),
                interaction.kind == InteractionKind::Turn
            );
        }
    }

    #[test]
    fn overlap_keeps_partial_latency_when_output_was_seen() {
        let mut tracker = tracker();
        tracker.handle_input(0, 1, TerminatorHint::Newline);
        tracker.handle_output(8, 3);
        // Second enter arrives inside the burst window.
        tracker.handle_input(15, 1, TerminatorHint::Newline);
        let finalized = interactions(&tracker.drain_events());
        let overlap = finalized
            .iter()
            .find(|interaction| interaction.end_reason == EndReason::Overlap)
            .expect("overlap interaction");
        assert_eq!(overlap.t1_ms, Some(8));
        assert_eq!(overlap.t2_ms, Some(8));
    }

    #[test]
    fn session_end_closes_silent_keystroke_window() {
        let mut tracker = tracker();
        tracker.handle_input(0, 4, TerminatorHint::None);
        tracker.end_session(100);
        let finalized = interactions(&tracker.drain_events());
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].end_reason, EndReason::SessionEnd);
        assert!(finalized[0].t1_ms.is_none());
        assert!(finalized[0].t2_ms.is_none());
        // Events after the session ends are dropped.
        tracker.handle_input(200, 4, TerminatorHint::None);
        tracker.handle_output(201, 4);
        assert!(tracker.drain_events().is_empty());
    }

    #[test]
    fn enter_detection_can_be_disabled() {
        let mut tracker = InteractionTracker::new(TrackerConfig {
            enter_begins_turn: false,
            ..TrackerConfig::default()
        });
        tracker.handle_input(0, 3, TerminatorHint::Newline);
        assert!(turns(&tracker.drain_events()).is_empty());
        tracker.mark_turn(10, TurnSource::Hotkey);
        let turn_events = turns(&tracker.drain_events());
        assert_eq!(turn_events.len(), 1);
        assert_eq!(turn_events[0].source, TurnSource::Hotkey);
    }

    #[test]
    fn hotkey_chunk_recognition_is_exact() {
        assert!(hotkey_chunk_matches(&[0x1b, b't']));
        assert!(hotkey_chunk_matches(&[0x1b, b'T']));
        assert!(!hotkey_chunk_matches(&[0x1b, b't', b'x']));
        assert!(!hotkey_chunk_matches(&[0x1b]));
        assert!(!hotkey_chunk_matches(b"t"));
    }

    #[test]
    fn output_without_input_is_ignored() {
        let mut tracker = tracker();
        tracker.handle_output(5, 100);
        tracker.poll_timers(50);
        tracker.end_session(60);
        assert!(interactions(&tracker.drain_events()).is_empty());
    }
}
