use anyhow::{anyhow, Context, Result};
use ccp_core::clock::iso_from_epoch_ms;
use ccp_core::duration::parse_duration;
use ccp_core::redact::hash_str;
use ccp_core::schema::MarkerLine;
use ccp_session::config::{default_output_dir, RunConfig, TurnHotkey};
use ccp_session::{pointer, run_session};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cc-profiler",
    version,
    about = "External latency and resource profiler for terminal AI coding assistants"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Profile a command under a PTY (same as the bare invocation)
    Run(RunArgs),
    /// Re-render a report from an existing data.json
    Report {
        data: PathBuf,
        /// Output path, defaults to report.html next to the input
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Append a marker to the currently-running session's timeline
    Mark {
        label: Option<String>,
        /// Store the label in plaintext instead of its SHA-256
        #[arg(long)]
        unsafe_plaintext_label: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Output directory for the session bundle
    #[arg(long)]
    output: Option<PathBuf>,
    /// Working directory for the child process
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Substitute assistant binary (A/B testing)
    #[arg(long)]
    binary: Option<PathBuf>,
    /// Explicit external-log path, skipping discovery
    #[arg(long = "jsonl-path")]
    jsonl_path: Option<PathBuf>,
    /// Manual turn hotkey: alt+t or off
    #[arg(long = "turn-hotkey", default_value = "alt+t")]
    turn_hotkey: String,
    /// Auto-stop after this long (e.g. 90s, 5m; bare numbers are ms)
    #[arg(long)]
    duration: Option<String>,
    #[arg(long = "burst-idle-ms", default_value_t = 30)]
    burst_idle_ms: u64,
    #[arg(long = "sample-interval-ms", default_value_t = 100)]
    sample_interval_ms: u64,
    #[arg(long = "interaction-timeout-ms", default_value_t = 2000)]
    interaction_timeout_ms: u64,
    /// Run the child against a settings overlay with MCP servers disabled
    #[arg(long = "disable-mcps")]
    disable_mcps: bool,
    /// Correlate external-log records with turns after the session
    #[arg(long = "correlate-jsonl")]
    correlate_jsonl: bool,
    /// Store plaintext paths in the bundle
    #[arg(long = "unsafe-store-paths")]
    unsafe_store_paths: bool,
    /// Store the plaintext command line in the bundle
    #[arg(long = "unsafe-store-command")]
    unsafe_store_command: bool,
    /// Store plaintext error text in warnings
    #[arg(long = "unsafe-store-errors")]
    unsafe_store_errors: bool,
    /// Command to profile, after --
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Run(args)) => run(args).await,
        Some(Commands::Report { data, out }) => report(&data, out),
        Some(Commands::Mark {
            label,
            unsafe_plaintext_label,
        }) => mark(label, unsafe_plaintext_label),
        None => run(cli.run).await,
    };
    if let Err(err) = result {
        eprintln!("cc-profiler: {err:#}");
        std::process::exit(1);
    }
}

fn build_config(args: RunArgs) -> Result<RunConfig> {
    let turn_hotkey = TurnHotkey::parse(&args.turn_hotkey)
        .ok_or_else(|| anyhow!("--turn-hotkey must be one of: alt+t, off"))?;
    let duration_ms = args
        .duration
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|err| anyhow!("--duration: {err}"))?;

    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("cannot resolve current directory")?,
    };
    let output_dir = args.output.unwrap_or_else(default_output_dir);

    let mut config = RunConfig::new(args.command, output_dir, cwd);
    config.binary_override = args.binary;
    config.jsonl_override = args.jsonl_path;
    config.turn_hotkey = turn_hotkey;
    config.duration_ms = duration_ms;
    config.burst_idle_ms = args.burst_idle_ms;
    config.sample_interval_ms = args.sample_interval_ms;
    config.interaction_timeout_ms = args.interaction_timeout_ms;
    config.disable_mcps = args.disable_mcps;
    config.correlate_jsonl = args.correlate_jsonl;
    config.unsafe_modes.store_paths = args.unsafe_store_paths;
    config.unsafe_modes.store_command = args.unsafe_store_command;
    config.unsafe_modes.store_errors = args.unsafe_store_errors;
    Ok(config)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = build_config(args)?;
    config.validate().map_err(|err| anyhow!("{err}"))?;

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("cannot create {}", config.output_dir.display()))?;
    let _log_guard = init_logging(&config.output_dir);
    info!("starting session in {}", config.output_dir.display());

    let outcome = run_session(config).await.map_err(|err| anyhow!("{err}"))?;

    eprintln!("\r");
    eprintln!("cc-profiler: session bundle at {}", outcome.data_path.display());
    if let Some(report_path) = &outcome.report_path {
        eprintln!("cc-profiler: report at {}", report_path.display());
    }
    if let Some(code) = outcome.child_exit {
        if code != 0 {
            // Recorded as a warning in the bundle; not propagated.
            eprintln!("cc-profiler: child exited with code {code}");
        }
    }
    Ok(())
}

fn report(data_path: &Path, out: Option<PathBuf>) -> Result<()> {
    let data = ccp_report::load_data(data_path)?;
    let html = ccp_report::render(&data)?;
    let out_path = out.unwrap_or_else(|| data_path.with_file_name("report.html"));
    std::fs::write(&out_path, html)
        .with_context(|| format!("cannot write {}", out_path.display()))?;
    println!("wrote {}", out_path.display());
    Ok(())
}

fn mark(label: Option<String>, unsafe_plaintext_label: bool) -> Result<()> {
    let state_dir = pointer::default_state_dir()
        .ok_or_else(|| anyhow!("cannot resolve home directory"))?;
    let active = pointer::read(&state_dir)
        .ok_or_else(|| anyhow!("no active cc-profiler session found"))?;

    let now_epoch = Utc::now().timestamp_millis();
    let (plain, hashed) = match label {
        Some(label) if unsafe_plaintext_label => (Some(label), None),
        Some(label) => (None, Some(hash_str(&label))),
        None => (None, None),
    };
    let line = MarkerLine {
        t_iso: iso_from_epoch_ms(now_epoch),
        t_ms: Some(now_epoch - active.started_at_ms_epoch),
        label: plain,
        label_sha256: hashed,
    };

    // One line per write so concurrent marks never interleave.
    let mut payload = serde_json::to_string(&line)?;
    payload.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&active.markers_path)
        .with_context(|| format!("cannot open {}", active.markers_path))?;
    file.write_all(payload.as_bytes())?;
    println!("marked at +{} ms", now_epoch - active.started_at_ms_epoch);
    Ok(())
}

struct LogGuard {
    _file: Option<Arc<Mutex<std::fs::File>>>,
}

struct FileWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
        Ok(())
    }
}

/// Tracing goes to a file inside the output directory; the proxied
/// terminal stream must never carry log lines.
fn init_logging(output_dir: &Path) -> Option<LogGuard> {
    let level = std::env::var("CC_PROFILER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output_dir.join("profiler.log"))
        .ok()?;
    let shared = Arc::new(Mutex::new(file));
    let writer_handle = shared.clone();
    let make_writer = BoxMakeWriter::new(move || FileWriter {
        file: writer_handle.clone(),
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(LogGuard {
        _file: Some(shared),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_args_parse_with_trailing_command() {
        let cli = Cli::parse_from([
            "cc-profiler",
            "--burst-idle-ms",
            "45",
            "--correlate-jsonl",
            "--",
            "claude",
            "--model",
            "opus",
        ]);
        assert!(cli.command.is_none());
        assert_eq!(cli.run.burst_idle_ms, 45);
        assert!(cli.run.correlate_jsonl);
        assert_eq!(cli.run.command, vec!["claude", "--model", "opus"]);
    }

    #[test]
    fn explicit_run_subcommand_matches_root() {
        let cli = Cli::parse_from(["cc-profiler", "run", "--turn-hotkey", "off", "--", "claude"]);
        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.turn_hotkey, "off");
                assert_eq!(args.command, vec!["claude"]);
            }
            other => panic!("expected run subcommand, got {other:?}"),
        }
    }

    #[test]
    fn invalid_choice_and_duration_fail_before_spawn() {
        let args = |hotkey: &str, duration: Option<&str>| RunArgs {
            output: None,
            cwd: Some(PathBuf::from("/tmp")),
            binary: None,
            jsonl_path: None,
            turn_hotkey: hotkey.to_string(),
            duration: duration.map(|value| value.to_string()),
            burst_idle_ms: 30,
            sample_interval_ms: 100,
            interaction_timeout_ms: 2_000,
            disable_mcps: false,
            correlate_jsonl: false,
            unsafe_store_paths: false,
            unsafe_store_command: false,
            unsafe_store_errors: false,
            command: vec!["claude".to_string()],
        };

        let err = build_config(args("ctrl+x", None)).expect_err("bad hotkey");
        assert!(err.to_string().contains("--turn-hotkey"));

        let err = build_config(args("alt+t", Some("1d"))).expect_err("bad duration");
        assert!(err.to_string().contains("--duration"));

        let config = build_config(args("alt+t", Some("2s"))).expect("valid");
        assert_eq!(config.duration_ms, Some(2_000));
    }

    #[test]
    fn marker_line_serializes_single_write_payload() {
        let line = MarkerLine {
            t_iso: "2026-03-01T10:00:01+00:00".to_string(),
            t_ms: Some(1_000),
            label: None,
            label_sha256: Some(hash_str("deploy")),
        };
        let payload = serde_json::to_string(&line).expect("serialize");
        assert!(payload.contains("\"tMs\":1000"));
        assert!(!payload.contains("deploy"));
    }
}
