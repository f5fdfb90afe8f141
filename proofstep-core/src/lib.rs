//! # proofstep-core
//!
//! Incremental, statement-by-statement execution of a proof document against
//! an interactive prover running as a child process.
//!
//! ## Core Components
//!
//! - **Statement**: period-terminated statement scanning and a cached index
//! - **Prompt**: counting `[id|tag]>` prompt markers in streamed output
//! - **Session**: prover process lifecycle and output framing
//! - **Undo**: statement-to-state mapping for fast backward jumps
//! - **Orchestrator**: step forward/backward, go-to-cursor, recovery and
//!   edit retraction with transaction-guarded publications
//!
//! ## Example
//!
//! ```rust,ignore
//! use proofstep_core::{ProcessSession, ProverConfig, StepOrchestrator};
//!
//! let config = ProverConfig::from_env();
//! let session = ProcessSession::new(config.clone());
//! let stepper = StepOrchestrator::new(session, config)?;
//!
//! stepper.update_document(text, 1, None).await;
//! let outcome = stepper.go_to_cursor(cursor).await;
//! if !outcome.success {
//!     eprintln!("{}", outcome.error.unwrap_or_default());
//! }
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod prompt;
pub mod session;
pub mod statement;
pub mod undo;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod proptest;

// Re-exports for convenience
pub use config::{ProtocolSyntax, ProverConfig};
pub use error::{Error, Result};
pub use orchestrator::{
    OrchestratorState, ProofStatePublication, PublicationFilter, StepOrchestrator, StepOutcome,
    StepperEvent, StepperStatus, TransactionReason,
};
pub use prompt::{PromptCounter, PromptMarker, PromptTally, ResponseSegment};
pub use session::{ExitNotice, ProcessSession, ProverProcess, SessionEvent, SessionStart};
pub use statement::{Statement, StatementIndex};
pub use undo::{UndoStateSnapshot, UndoStateTracker};
