use crate::calibrate;
use crate::config::{RunConfig, TurnHotkey};
use crate::environment;
use crate::jsonl::{JsonlTracker, JsonlTrackerConfig};
use crate::markers::{MarkerWatcher, DEFAULT_POLL_INTERVAL_MS};
use crate::overlay::HomeOverlay;
use crate::pointer;
use crate::probe;
use crate::sampler::{ProcessSampler, SamplerEvent};
use crate::SessionError;
use ccp_core::clock::{iso_from_epoch_ms, SessionClock};
use ccp_core::redact::hash_path;
use ccp_core::schema::{
    ExternalLogSizeSample, MarkerEvent, SessionData, TurnSource, Warning,
};
use ccp_tracker::{
    hotkey_chunk_matches, InteractionTracker, TerminatorHint, TrackerConfig, TrackerEvent,
};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct SessionOutcome {
    pub output_dir: PathBuf,
    pub data_path: PathBuf,
    pub report_path: Option<PathBuf>,
    pub child_exit: Option<i32>,
}

#[derive(Debug)]
enum RuntimeEvent {
    HostInput { len: u64, newline: bool },
    HotkeyTurn,
    ChildOutput { len: u64 },
    ChildExit { code: i32 },
    Interrupt,
    DurationElapsed,
    Resize,
}

/// Runs a profiling session to completion: spawns the child under a PTY,
/// proxies bytes both ways while feeding counts to the tracker, collects
/// samples and markers, and finalizes the bundle on any exit path.
pub async fn run_session(config: RunConfig) -> Result<SessionOutcome, SessionError> {
    config.validate()?;
    std::fs::create_dir_all(&config.output_dir)?;

    let clock = SessionClock::start_now();
    let started_at_iso = clock.started_at_iso();
    let store_errors = config.unsafe_modes.store_errors;

    let mut data = SessionData::new(
        started_at_iso.clone(),
        started_at_iso.clone(),
        config.to_summary(),
        environment::discover(config.assistant_detected()),
    );

    match calibrate::measure() {
        Ok(calibration) => data.calibration = Some(calibration),
        Err(err) => push_warning(&mut data, &clock, "calibration_failed", &err, store_errors),
    }

    let markers_path = config.markers_path();
    if let Err(err) = std::fs::write(&markers_path, b"") {
        push_warning(
            &mut data,
            &clock,
            "markers_file_failed",
            &err.to_string(),
            store_errors,
        );
    }

    let state_dir = config.state_dir.clone().or_else(pointer::default_state_dir);
    if let Some(state_dir) = &state_dir {
        let output_dir_abs = std::fs::canonicalize(&config.output_dir)
            .unwrap_or_else(|_| config.output_dir.clone());
        if let Err(err) = pointer::write(
            state_dir,
            &output_dir_abs,
            &output_dir_abs.join("markers.jsonl"),
            &started_at_iso,
            clock.started_at_ms_epoch(),
        ) {
            push_warning(
                &mut data,
                &clock,
                "pointer_write_failed",
                &err.to_string(),
                store_errors,
            );
        }
    }

    let overlay = if config.disable_mcps {
        match HomeOverlay::create(&config.output_dir) {
            Ok(overlay) => Some(overlay),
            Err(err) => {
                push_warning(
                    &mut data,
                    &clock,
                    "overlay_failed",
                    &err.to_string(),
                    store_errors,
                );
                None
            }
        }
    } else {
        None
    };

    let jsonl_enabled = config.assistant_detected() || config.jsonl_override.is_some();
    data.jsonl.enabled = jsonl_enabled;
    let jsonl = jsonl_enabled.then(|| {
        let projects_root = config.projects_root.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude")
                .join("projects")
        });
        Arc::new(StdMutex::new(JsonlTracker::new(JsonlTrackerConfig {
            override_path: config.jsonl_override.clone(),
            cwd: Some(config.cwd.clone()),
            projects_root,
            started_at_ms_epoch: clock.started_at_ms_epoch(),
            // Content-aware selection is the same opt-in that allows the
            // post-session read.
            allow_read_for_selection: config.correlate_jsonl,
        })))
    });

    // Child spawn. Failure still runs cleanup so no stale pointer or
    // overlay survives.
    let pty_system = native_pty_system();
    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let pair = match pty_system.openpty(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }) {
        Ok(pair) => pair,
        Err(err) => {
            let message = err.to_string();
            fail_before_wiring(&mut data, &clock, &config, state_dir, overlay, &message);
            return Err(SessionError::Spawn(message));
        }
    };

    let command = config.effective_command();
    let mut builder = CommandBuilder::new(&command[0]);
    builder.args(&command[1..]);
    builder.cwd(&config.cwd);
    if std::env::var("TERM").is_err() {
        builder.env("TERM", "xterm-256color");
    }
    if let Some(overlay) = &overlay {
        for (key, value) in overlay.child_env() {
            builder.env(key, value);
        }
    }

    let child = match pair.slave.spawn_command(builder) {
        Ok(child) => child,
        Err(err) => {
            let message = err.to_string();
            fail_before_wiring(&mut data, &clock, &config, state_dir, overlay, &message);
            return Err(SessionError::Spawn(message));
        }
    };
    drop(pair.slave);

    let pid = child.process_id().unwrap_or(0);
    let mut killer = child.clone_killer();

    let pipes = pair
        .master
        .take_writer()
        .and_then(|writer| Ok((writer, pair.master.try_clone_reader()?)));
    let (writer, mut reader) = match pipes {
        Ok((writer, reader)) => (Arc::new(StdMutex::new(writer)), reader),
        Err(err) => {
            let message = err.to_string();
            let _ = killer.kill();
            fail_before_wiring(&mut data, &clock, &config, state_dir, overlay, &message);
            return Err(SessionError::Spawn(message));
        }
    };
    let master = pair.master;

    let raw_mode = crossterm::terminal::enable_raw_mode().is_ok();
    if !raw_mode {
        push_warning(&mut data, &clock, "raw_mode_unavailable", "", store_errors);
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<RuntimeEvent>();
    let (sampler_tx, mut sampler_rx) = mpsc::unbounded_channel::<SamplerEvent>();
    let (marker_tx, mut marker_rx) = mpsc::unbounded_channel::<MarkerEvent>();
    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<ExternalLogSizeSample>();

    // Host stdin -> child, with hotkey swallowing. The blocking bridge
    // writes to the PTY itself so a slow child never stalls the loop.
    let hotkey_enabled = config.turn_hotkey == TurnHotkey::AltT;
    let stdin_tx = event_tx.clone();
    let stdin_writer = writer.clone();
    let stdin_task = tokio::task::spawn_blocking(move || {
        let mut stdin = std::io::stdin();
        let mut buffer = [0u8; 4096];
        loop {
            let read = match stdin.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(_) => break,
            };
            let chunk = &buffer[..read];
            if hotkey_enabled && hotkey_chunk_matches(chunk) {
                if stdin_tx.send(RuntimeEvent::HotkeyTurn).is_err() {
                    break;
                }
                continue;
            }
            let newline = TerminatorHint::scan(chunk) == TerminatorHint::Newline;
            if stdin_tx
                .send(RuntimeEvent::HostInput {
                    len: read as u64,
                    newline,
                })
                .is_err()
            {
                break;
            }
            let Ok(mut writer) = stdin_writer.lock() else {
                break;
            };
            if writer.write_all(chunk).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    // Child output -> host stdout, byte for byte.
    let output_tx = event_tx.clone();
    let output_task = tokio::task::spawn_blocking(move || {
        let mut stdout = std::io::stdout();
        let mut buffer = [0u8; 8192];
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(_) => break,
            };
            let _ = stdout.write_all(&buffer[..read]);
            let _ = stdout.flush();
            if output_tx
                .send(RuntimeEvent::ChildOutput { len: read as u64 })
                .is_err()
            {
                break;
            }
        }
    });

    let exit_tx = event_tx.clone();
    let mut child = child;
    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => 1,
        };
        let _ = exit_tx.send(RuntimeEvent::ChildExit { code });
    });

    let sampler = ProcessSampler::spawn(
        pid,
        config.sample_interval_ms,
        clock,
        probe::default_probes(),
        store_errors,
        sampler_tx,
    );
    let marker_watcher = MarkerWatcher::spawn(
        markers_path.clone(),
        clock.started_at_ms_epoch(),
        DEFAULT_POLL_INTERVAL_MS,
        marker_tx,
    );

    let interrupt_task = tokio::spawn({
        let tx = event_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(RuntimeEvent::Interrupt);
            }
        }
    });

    #[cfg(unix)]
    let resize_task = tokio::spawn({
        let tx = event_tx.clone();
        async move {
            let Ok(mut stream) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
            else {
                return;
            };
            while stream.recv().await.is_some() {
                if tx.send(RuntimeEvent::Resize).is_err() {
                    break;
                }
            }
        }
    });

    let duration_task = config.duration_ms.map(|duration_ms| {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            let _ = tx.send(RuntimeEvent::DurationElapsed);
        })
    });
    drop(event_tx);

    let mut tracker = InteractionTracker::new(TrackerConfig {
        burst_idle_ms: config.burst_idle_ms,
        interaction_timeout_ms: config.interaction_timeout_ms,
        enter_begins_turn: true,
    });

    let mut child_exit: Option<i32> = None;
    loop {
        let sleep_ms = tracker
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(clock.now_ms()));

        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    RuntimeEvent::HostInput { len, newline } => {
                        let hint = if newline {
                            TerminatorHint::Newline
                        } else {
                            TerminatorHint::None
                        };
                        tracker.handle_input(clock.now_ms(), len, hint);
                        route_tracker_events(&mut tracker, &mut data, &clock, &jsonl, &log_tx);
                    }
                    RuntimeEvent::HotkeyTurn => {
                        tracker.mark_turn(clock.now_ms(), TurnSource::Hotkey);
                        route_tracker_events(&mut tracker, &mut data, &clock, &jsonl, &log_tx);
                    }
                    RuntimeEvent::ChildOutput { len } => {
                        tracker.handle_output(clock.now_ms(), len);
                        route_tracker_events(&mut tracker, &mut data, &clock, &jsonl, &log_tx);
                    }
                    RuntimeEvent::ChildExit { code } => {
                        child_exit = Some(code);
                        if code != 0 {
                            push_warning(
                                &mut data,
                                &clock,
                                "child_exit_nonzero",
                                &format!("exit code {code}"),
                                true,
                            );
                        }
                        break;
                    }
                    RuntimeEvent::Interrupt => {
                        push_warning(&mut data, &clock, "interrupted", "", store_errors);
                        let _ = killer.kill();
                    }
                    RuntimeEvent::DurationElapsed => {
                        push_warning(&mut data, &clock, "duration_timeout", "", store_errors);
                        let _ = killer.kill();
                    }
                    RuntimeEvent::Resize => {
                        if let Ok((cols, rows)) = crossterm::terminal::size() {
                            let _ = master.resize(PtySize {
                                rows,
                                cols,
                                pixel_width: 0,
                                pixel_height: 0,
                            });
                        }
                    }
                }
            }
            Some(event) = sampler_rx.recv() => match event {
                SamplerEvent::Sample(sample) => data.samples.push(sample),
                SamplerEvent::ProcessGone => debug!("sampler reports child gone"),
            },
            Some(marker) = marker_rx.recv() => data.markers.push(marker),
            Some(sample) = log_rx.recv() => data.jsonl.size_samples.push(sample),
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms.unwrap_or(0))),
                if sleep_ms.is_some() =>
            {
                tracker.poll_timers(clock.now_ms());
                route_tracker_events(&mut tracker, &mut data, &clock, &jsonl, &log_tx);
            }
        }
    }

    // Drain whatever the sources managed to emit before teardown.
    while let Ok(event) = event_rx.try_recv() {
        if let RuntimeEvent::ChildOutput { len } = event {
            tracker.handle_output(clock.now_ms(), len);
        }
        if let RuntimeEvent::ChildExit { code } = event {
            child_exit = child_exit.or(Some(code));
        }
    }
    while let Ok(event) = sampler_rx.try_recv() {
        if let SamplerEvent::Sample(sample) = event {
            data.samples.push(sample);
        }
    }

    // Finalize: strict order, every step downgraded to a warning on
    // failure so data.json always writes.

    // (1) End the tracker session.
    tracker.end_session(clock.now_ms());
    route_tracker_events(&mut tracker, &mut data, &clock, &jsonl, &log_tx);

    // (2) Stop the sampler, (3) stop the marker watcher.
    sampler.stop();
    marker_watcher.stop();
    while let Ok(marker) = marker_rx.try_recv() {
        data.markers.push(marker);
    }
    data.markers.sort_by_key(|marker| marker.t_ms);
    while let Ok(sample) = log_rx.try_recv() {
        data.jsonl.size_samples.push(sample);
    }

    // (4) Restore the terminal.
    if raw_mode {
        if crossterm::terminal::disable_raw_mode().is_err() {
            push_warning(&mut data, &clock, "raw_mode_restore_failed", "", store_errors);
        }
    }

    // (5) Detach handlers.
    interrupt_task.abort();
    #[cfg(unix)]
    resize_task.abort();
    if let Some(task) = duration_task {
        task.abort();
    }
    stdin_task.abort();
    let _ = tokio::time::timeout(Duration::from_millis(500), output_task).await;

    // (6) Kill the child defensively.
    if child_exit.is_none() {
        let _ = killer.kill();
    }

    // (7) Delete the active-session pointer.
    if let Some(state_dir) = &state_dir {
        if let Err(err) = pointer::delete(state_dir) {
            push_warning(
                &mut data,
                &clock,
                "pointer_delete_failed",
                &err.to_string(),
                store_errors,
            );
        }
    }

    // (8) Release the settings overlay.
    if let Some(overlay) = overlay {
        if let Err(err) = overlay.remove() {
            push_warning(
                &mut data,
                &clock,
                "overlay_remove_failed",
                &err.to_string(),
                store_errors,
            );
        }
    }

    // (9) Opt-in correlation over the selected log.
    let selected_log = jsonl
        .as_ref()
        .and_then(|tracker| tracker.lock().ok()?.selected_path());
    if let Some(path) = &selected_log {
        data.jsonl.path_sha256 = Some(hash_path(path));
        if config.unsafe_modes.store_paths {
            data.jsonl.path = Some(path.to_string_lossy().to_string());
        }
        if config.correlate_jsonl {
            match crate::jsonl::correlate(
                path,
                clock.started_at_ms_epoch(),
                clock.now_ms_epoch(),
                &data.turns,
            ) {
                Ok(correlation) => data.jsonl.correlation = Some(correlation),
                Err(err) => push_warning(
                    &mut data,
                    &clock,
                    "correlate_failed",
                    &err.to_string(),
                    store_errors,
                ),
            }
        }
    }

    // (10) Stamp the end time.
    data.ended_at_iso = Some(iso_from_epoch_ms(clock.now_ms_epoch()));

    // (11) Render the report; failure is a warning, not an error.
    let report_html = match ccp_report::render(&data) {
        Ok(html) => Some(html),
        Err(err) => {
            push_warning(
                &mut data,
                &clock,
                "report_failed",
                &err.to_string(),
                store_errors,
            );
            None
        }
    };

    // (12) Write the data document.
    let data_path = config.data_path();
    std::fs::write(&data_path, serde_json::to_vec_pretty(&data)?)?;

    // (13) Write the report alongside it.
    let report_path = match report_html {
        Some(html) => {
            let path = config.report_path();
            match std::fs::write(&path, html) {
                Ok(()) => Some(path),
                Err(err) => {
                    warn!("report write failed: {err}");
                    None
                }
            }
        }
        None => None,
    };

    Ok(SessionOutcome {
        output_dir: config.output_dir.clone(),
        data_path,
        report_path,
        child_exit,
    })
}

/// Routes drained tracker emissions into the bundle. Every new turn also
/// triggers a best-effort size sample of the external log.
fn route_tracker_events(
    tracker: &mut InteractionTracker,
    data: &mut SessionData,
    clock: &SessionClock,
    jsonl: &Option<Arc<StdMutex<JsonlTracker>>>,
    log_tx: &mpsc::UnboundedSender<ExternalLogSizeSample>,
) {
    for event in tracker.drain_events() {
        match event {
            TrackerEvent::Turn(turn) => {
                data.turns.push(turn);
                if let Some(jsonl) = jsonl {
                    let jsonl = jsonl.clone();
                    let log_tx = log_tx.clone();
                    let t_ms = clock.now_ms();
                    tokio::task::spawn_blocking(move || {
                        let sample = jsonl
                            .lock()
                            .ok()
                            .and_then(|mut tracker| tracker.sample(turn.index, t_ms));
                        if let Some(sample) = sample {
                            let _ = log_tx.send(sample);
                        }
                    });
                }
            }
            TrackerEvent::Interaction(interaction) => data.interactions.push(interaction),
        }
    }
}

fn push_warning(
    data: &mut SessionData,
    clock: &SessionClock,
    code: &str,
    detail: &str,
    keep_detail: bool,
) {
    data.warnings.push(Warning {
        t_ms: clock.now_ms(),
        code: code.to_string(),
        detail: (keep_detail && !detail.is_empty()).then(|| detail.to_string()),
    });
}

/// Cleanup for failures between pointer creation and source wiring: no
/// stale pointer or overlay may survive, and the bundle still writes.
fn fail_before_wiring(
    data: &mut SessionData,
    clock: &SessionClock,
    config: &RunConfig,
    state_dir: Option<PathBuf>,
    overlay: Option<HomeOverlay>,
    message: &str,
) {
    push_warning(
        data,
        clock,
        "spawn_failed",
        message,
        config.unsafe_modes.store_errors,
    );
    if let Some(state_dir) = &state_dir {
        let _ = pointer::delete(state_dir);
    }
    if let Some(overlay) = overlay {
        let _ = overlay.remove();
    }
    data.ended_at_iso = Some(iso_from_epoch_ms(clock.now_ms_epoch()));
    if let Ok(payload) = serde_json::to_vec_pretty(&data) {
        let _ = std::fs::write(config.data_path(), payload);
    }
}
