pub mod clock;
pub mod duration;
pub mod redact;
pub mod schema;

pub use clock::SessionClock;
pub use duration::{parse_duration, DurationError};
pub use redact::sha256_hex;
pub use schema::{
    ActiveSessionPointer, Calibration, CorrelationMode, EndReason, Environment,
    ExternalLogCorrelation, ExternalLogInfo, ExternalLogSizeSample, Interaction, InteractionKind,
    LinuxProcessStats, MarkerEvent, MarkerLine, ProcessSample, SessionConfig, SessionData,
    TurnEvent, TurnLogStats, TurnSource, UnsafeModes, Warning, POINTER_SCHEMA_VERSION,
    SCHEMA_VERSION,
};
