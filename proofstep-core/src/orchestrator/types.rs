//! Host-facing value types for the stepping orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transaction::TransactionReason;

/// Result of a host intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_offset: Option<usize>,
}

impl StepOutcome {
    /// Successful operation ending at `execution_offset`.
    pub fn success(execution_offset: usize) -> Self {
        Self {
            success: true,
            error: None,
            execution_offset: Some(execution_offset),
        }
    }

    /// Failed operation; the offset is the last good one.
    pub fn failure(error: impl Into<String>, execution_offset: usize) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            execution_offset: Some(execution_offset),
        }
    }

    /// Rejection of a request that arrived while another operation ran.
    pub fn busy() -> Self {
        Self {
            success: false,
            error: Some(BUSY_MESSAGE.to_string()),
            execution_offset: None,
        }
    }

    /// Whether this is the busy rejection.
    pub fn is_busy(&self) -> bool {
        !self.success && self.execution_offset.is_none()
    }
}

/// Error text of a busy rejection.
pub const BUSY_MESSAGE: &str = "Prover is busy with another operation";

/// What the orchestrator is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    #[default]
    Idle,
    /// Single or batched forward motion.
    Stepping,
    /// Backward motion, including edit-triggered retraction.
    Retracting,
    /// Restart and replay.
    Recovering,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Stepping => write!(f, "stepping"),
            Self::Retracting => write!(f, "retracting"),
            Self::Recovering => write!(f, "recovering"),
        }
    }
}

/// Terminal state published once per operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofStatePublication {
    pub transaction_id: u64,
    pub reason: TransactionReason,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last response segment, markers stripped.
    pub output: String,
    pub statements_proved: usize,
    pub execution_offset: usize,
    pub timestamp: DateTime<Utc>,
}

/// Notifications for the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StepperEvent {
    /// The verified region changed.
    ExecutionOffsetChanged {
        offset: usize,
        statements_proved: usize,
    },
    /// Terminal publication of an operation.
    ProofState(ProofStatePublication),
    /// Raw subprocess output, forwarded as it arrives.
    RawOutput { text: String },
    /// The prover exited without being asked to.
    ProcessExited {
        session_id: Uuid,
        code: Option<i32>,
        restart_available: bool,
    },
}

impl StepperEvent {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Snapshot of orchestrator state for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepperStatus {
    pub state: OrchestratorState,
    pub execution_offset: usize,
    pub statements_proved: usize,
    pub tracker_valid: bool,
    pub session_running: bool,
}
