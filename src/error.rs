// Error taxonomy for the telemetry core
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TelemetryError>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("ring buffer capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("command rejected: {0}")]
    InvalidCommand(String),

    #[error("stream is shut down")]
    StreamClosed,

    #[error("connection failed after {0} attempts")]
    RetriesExhausted(u32),
}
