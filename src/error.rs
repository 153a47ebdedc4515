use thiserror::Error;

#[derive(Error, Debug)]
pub enum RamanError {
    #[error("IO error: {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Connection timeout")]
    Timeout,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Reply mismatch: expected {expected}, got {actual}")]
    ReplyMismatch { expected: String, actual: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("No usable detector channel")]
    NoUsableChannel,
    #[error("Export failed: {0}")]
    Export(String),
    #[error("Table format error: {0}")]
    TableFormat(String),
}

impl RamanError {
    pub fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        RamanError::Io {
            source,
            context: context.into(),
        }
    }

    /// Instrument-communication faults worth retrying at the bench
    /// boundary. Everything else reflects a bug or a broken setup and
    /// propagates to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RamanError::Io { .. }
                | RamanError::Serial(_)
                | RamanError::Timeout
                | RamanError::Protocol(_)
                | RamanError::ReplyMismatch { .. }
        )
    }
}
