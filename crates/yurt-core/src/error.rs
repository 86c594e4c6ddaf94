//! Error types for yurt-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for yurt-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while running commands or touching persisted config.
#[derive(Debug, Error)]
pub enum CoreError {
    /// External command exited with a non-zero status
    #[error("{program} failed (exit code {code})")]
    ProcessFailed {
        /// Basename of the program that failed
        program: String,
        /// Exit code, or -1 when terminated by a signal
        code: i32,
        /// Captured standard error (truncated)
        stderr: String,
    },

    /// External command exceeded its deadline and was killed
    #[error("{program} timed out after {timeout:?}")]
    ProcessTimedOut {
        /// Basename of the program that timed out
        program: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Command was aborted by a manual interrupt (Ctrl-C)
    #[error("{program} was interrupted")]
    Interrupted {
        /// Basename of the interrupted program
        program: String,
    },

    /// Command could not be started at all
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program that could not be started
        program: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Command spec has no program
    #[error("empty command")]
    EmptyCommand,

    /// Persisted config exists but could not be read or parsed
    #[error("config read error: {0}")]
    ConfigRead(String),

    /// Persisted config could not be committed
    #[error("config write error: {0}")]
    ConfigWrite(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether the operation was stopped by a manual interrupt.
    ///
    /// Interrupted work must not be retried.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}
