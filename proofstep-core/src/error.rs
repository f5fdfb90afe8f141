//! Error types for proofstep-core.

use thiserror::Error;

/// Result type alias using proofstep-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the prover subprocess.
#[derive(Error, Debug)]
pub enum Error {
    /// The prover rejected a submitted statement or command.
    ///
    /// `message` is the prover's own text, forwarded verbatim.
    #[error("{message}")]
    Prover { message: String },

    /// Subprocess communication error
    #[error("Subprocess communication error: {0}")]
    SubprocessComm(String),

    /// Expected prompt markers never arrived
    #[error("Command timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The subprocess exited while it was expected to be running
    #[error("Prover process exited unexpectedly (code: {})", display_code(.code))]
    ProcessExited { code: Option<i32> },

    /// No subprocess is running
    #[error("Prover session is not running")]
    NotRunning,

    /// A command was submitted while another one was still pending
    #[error("A prover command is already in flight")]
    CommandInFlight,

    /// The prover's sequence ids disagree with the client model
    #[error("Protocol desync: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

impl Error {
    /// Create a prover-reported error.
    pub fn prover(message: impl Into<String>) -> Self {
        Self::Prover {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a subprocess communication error.
    pub fn subprocess(message: impl Into<String>) -> Self {
        Self::SubprocessComm(message.into())
    }

    /// Whether the subprocess may still be computing the failed command.
    ///
    /// After such an error the process position is unknown and the session
    /// must not be reused without a restart.
    pub fn leaves_session_unknown(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::SubprocessComm(_) | Self::ProcessExited { .. }
        )
    }

    /// Text suitable for a host-facing failure report.
    pub fn user_message(&self) -> String {
        match self {
            Self::Prover { message } => message.clone(),
            other => other.to_string(),
        }
    }
}
