use crate::SessionError;
use ccp_core::redact::{hash_command, hash_path};
use ccp_core::schema::{SessionConfig, UnsafeModes};
use chrono::Local;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnHotkey {
    #[default]
    AltT,
    Off,
}

impl TurnHotkey {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "alt+t" => Some(TurnHotkey::AltT),
            "off" => Some(TurnHotkey::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnHotkey::AltT => "alt+t",
            TurnHotkey::Off => "off",
        }
    }
}

/// Already-parsed run options. The CLI owns flag parsing; this type owns
/// validation and the derived values the runtime needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub command: Vec<String>,
    pub output_dir: PathBuf,
    pub cwd: PathBuf,
    pub binary_override: Option<PathBuf>,
    pub jsonl_override: Option<PathBuf>,
    pub turn_hotkey: TurnHotkey,
    pub duration_ms: Option<u64>,
    pub burst_idle_ms: u64,
    pub sample_interval_ms: u64,
    pub interaction_timeout_ms: u64,
    pub disable_mcps: bool,
    pub correlate_jsonl: bool,
    pub unsafe_modes: UnsafeModes,
    /// Overrides `<home>/.claude/projects` for tests.
    pub projects_root: Option<PathBuf>,
    /// Overrides `<home>/.cc-profiler` for tests.
    pub state_dir: Option<PathBuf>,
}

impl RunConfig {
    pub fn new(command: Vec<String>, output_dir: PathBuf, cwd: PathBuf) -> Self {
        Self {
            command,
            output_dir,
            cwd,
            binary_override: None,
            jsonl_override: None,
            turn_hotkey: TurnHotkey::default(),
            duration_ms: None,
            burst_idle_ms: 30,
            sample_interval_ms: 100,
            interaction_timeout_ms: 2_000,
            disable_mcps: false,
            correlate_jsonl: false,
            unsafe_modes: UnsafeModes::default(),
            projects_root: None,
            state_dir: None,
        }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.command.is_empty() {
            return Err(SessionError::Config("missing command to profile".into()));
        }
        if self.sample_interval_ms < 1 {
            return Err(SessionError::Config(
                "--sample-interval-ms must be at least 1".into(),
            ));
        }
        if let Some(binary) = &self.binary_override {
            if !binary.is_file() {
                return Err(SessionError::Config(format!(
                    "--binary {} does not exist or is not a file",
                    binary.display()
                )));
            }
        }
        Ok(())
    }

    /// The argv actually spawned: `--binary` replaces `argv[0]`, but only
    /// when the command targets the assistant.
    pub fn effective_command(&self) -> Vec<String> {
        let mut command = self.command.clone();
        if let (Some(binary), Some(first)) = (&self.binary_override, command.first_mut()) {
            if looks_like_assistant(first) {
                *first = binary.to_string_lossy().to_string();
            }
        }
        command
    }

    pub fn assistant_detected(&self) -> bool {
        self.command
            .first()
            .map(|argv0| looks_like_assistant(argv0))
            .unwrap_or(false)
    }

    /// The privacy-reduced snapshot persisted into `data.json`.
    pub fn to_summary(&self) -> SessionConfig {
        SessionConfig {
            command: self
                .unsafe_modes
                .store_command
                .then(|| self.command.clone()),
            command_sha256: hash_command(&self.command),
            cwd: self
                .unsafe_modes
                .store_paths
                .then(|| self.cwd.to_string_lossy().to_string()),
            cwd_sha256: hash_path(&self.cwd),
            turn_hotkey: self.turn_hotkey.as_str().to_string(),
            duration_ms: self.duration_ms,
            burst_idle_ms: self.burst_idle_ms,
            sample_interval_ms: self.sample_interval_ms,
            interaction_timeout_ms: self.interaction_timeout_ms,
            disable_mcps: self.disable_mcps,
            correlate_jsonl: self.correlate_jsonl,
            unsafe_modes: self.unsafe_modes,
        }
    }

    pub fn markers_path(&self) -> PathBuf {
        self.output_dir.join("markers.jsonl")
    }

    pub fn data_path(&self) -> PathBuf {
        self.output_dir.join("data.json")
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join("report.html")
    }
}

/// Auto-named output directory for a session starting now.
pub fn default_output_dir() -> PathBuf {
    PathBuf::from(format!(
        "cc-profiler-session-{}",
        Local::now().format("%Y-%m-%d-%H%M%S")
    ))
}

/// Whether `argv0` targets the AI assistant this profiler understands.
/// Matches on the basename so wrapper paths still count.
pub fn looks_like_assistant(argv0: &str) -> bool {
    Path::new(argv0)
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase().contains("claude"))
        .unwrap_or(false)
}
