//! Session runtime for `cc-profiler`: the PTY-mediated byte proxy, the
//! satellite trackers (process sampler, marker watcher, external-log
//! tracker), and the ordered finalize that writes the session bundle.

pub mod calibrate;
pub mod config;
pub mod environment;
pub mod jsonl;
pub mod markers;
pub mod overlay;
pub mod pointer;
pub mod probe;
pub mod runtime;
pub mod sampler;

use thiserror::Error;

pub use config::{RunConfig, TurnHotkey};
pub use runtime::{run_session, SessionOutcome};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to spawn child: {0}")]
    Spawn(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
