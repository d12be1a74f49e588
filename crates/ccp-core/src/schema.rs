use serde::{Deserialize, Serialize};

/// Version tag of the `data.json` document. Report consumers refuse
/// anything else.
pub const SCHEMA_VERSION: &str = "2";

/// Version tag of the active-session pointer file.
pub const POINTER_SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnSource {
    Enter,
    Hotkey,
}

impl TurnSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnSource::Enter => "enter",
            TurnSource::Hotkey => "hotkey",
        }
    }
}

/// A detected user "send" boundary. Indices are dense and start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEvent {
    pub index: u32,
    pub t_ms: u64,
    pub source: TurnSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    Keystroke,
    Turn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    BurstIdle,
    Timeout,
    SessionEnd,
    Overlap,
}

/// A finalized latency observation window. `t1Ms`/`t2Ms` are relative to
/// `t0Ms`; both are omitted when no output was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: u64,
    pub kind: InteractionKind,
    pub t0_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t1_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t2_ms: Option<u64>,
    pub input_bytes: u64,
    pub output_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<u32>,
    pub end_reason: EndReason,
}

/// Timeline annotation ingested from `markers.jsonl`. At most one label
/// form is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerEvent {
    pub t_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_sha256: Option<String>,
}

/// One line of `markers.jsonl` as written by sibling `mark` invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerLine {
    pub t_iso: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxProcessStats {
    pub minor_faults: u64,
    pub major_faults: u64,
    pub voluntary_ctxt_switches: u64,
    pub involuntary_ctxt_switches: u64,
    pub open_fds: u32,
    pub threads: u32,
}

/// Point-in-time resource snapshot of the child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSample {
    pub t_ms: u64,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<LinuxProcessStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLogSizeSample {
    pub turn_index: u32,
    pub t_ms: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMode {
    Timestamps,
    Sequential,
    None,
}

/// Post-hoc per-turn aggregate over external-log records. Only derived
/// counts escape; never record content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnLogStats {
    pub turn_index: u32,
    pub record_count: u64,
    pub record_bytes: u64,
    pub tool_use_count: u64,
    pub tool_use_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_token_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLogCorrelation {
    pub mode: CorrelationMode,
    pub parsed_lines: u64,
    pub parsed_bytes: u64,
    pub parse_errors: u64,
    pub per_turn: Vec<TurnLogStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// External-log tracking section of the bundle. The selected path is
/// persisted as SHA-256 hex unless `--unsafe-store-paths` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLogInfo {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub size_samples: Vec<ExternalLogSizeSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<ExternalLogCorrelation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub t_ms: u64,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsafeModes {
    pub store_paths: bool,
    pub store_command: bool,
    pub store_errors: bool,
}

impl UnsafeModes {
    pub fn any(&self) -> bool {
        self.store_paths || self.store_command || self.store_errors
    }
}

/// The validated configuration snapshot persisted into the bundle.
/// Command and cwd appear in plaintext only under their unsafe flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    pub command_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub cwd_sha256: String,
    pub turn_hotkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub burst_idle_ms: u64,
    pub sample_interval_ms: u64,
    pub interaction_timeout_ms: u64,
    pub disable_mcps: bool,
    pub correlate_jsonl: bool,
    pub unsafe_modes: UnsafeModes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colorterm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_mem_bytes: Option<u64>,
    pub assistant_detected: bool,
}

/// PTY round-trip overhead, measured against a scratch echo child.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calibration {
    pub samples: u32,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

/// The persisted session bundle. Created once configuration validates,
/// mutated only by the session runtime, serialized once at finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub schema_version: String,
    pub created_at_iso: String,
    pub started_at_iso: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_iso: Option<String>,
    pub config: SessionConfig,
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Calibration>,
    pub jsonl: ExternalLogInfo,
    pub turns: Vec<TurnEvent>,
    pub interactions: Vec<Interaction>,
    pub markers: Vec<MarkerEvent>,
    pub samples: Vec<ProcessSample>,
    pub warnings: Vec<Warning>,
}

impl SessionData {
    pub fn new(
        created_at_iso: String,
        started_at_iso: String,
        config: SessionConfig,
        environment: Environment,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            created_at_iso,
            started_at_iso,
            ended_at_iso: None,
            config,
            environment,
            calibration: None,
            jsonl: ExternalLogInfo::default(),
            turns: Vec::new(),
            interactions: Vec::new(),
            markers: Vec::new(),
            samples: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Cross-process coordination file: lets sibling `mark` invocations find
/// the markers file of the currently-running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionPointer {
    pub schema_version: String,
    pub output_dir: String,
    pub markers_path: String,
    pub started_at_iso: String,
    pub started_at_ms_epoch: i64,
}
