//! Prover subprocess sessions.
//!
//! ## Components
//!
//! - **framer**: splits raw stdout into prompt-terminated chunks
//! - **process**: tokio child-process implementation of [`ProverProcess`]
//!
//! The orchestrator talks to the prover only through the [`ProverProcess`]
//! trait, so the stepping logic can be driven by any transport that yields
//! framed output.

pub mod framer;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::prompt::PromptMarker;

pub use framer::OutputFramer;
pub use process::ProcessSession;

/// Something that happened on the prover's output side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A framed stdout chunk ending with a complete marker line, or the
    /// remainder flushed at end of stream.
    Output(String),
    /// One line of stderr.
    Stderr(String),
    /// The process exited. `expected` is set when the exit was self-initiated.
    Exited { code: Option<i32>, expected: bool },
}

/// Result of starting a session.
#[derive(Debug, Clone)]
pub struct SessionStart {
    /// Identifier of the spawned process, for logs and exit notices.
    pub session_id: Uuid,
    /// Startup marker, when it was awaited during start.
    pub startup_marker: Option<PromptMarker>,
    /// Output printed before the startup marker.
    pub banner: String,
}

/// Lifecycle notice published whenever a session process exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitNotice {
    pub session_id: Uuid,
    pub code: Option<i32>,
    /// `false` for crashes and other exits not initiated by `stop`.
    pub expected: bool,
}

/// A running (or restartable) prover subprocess.
///
/// Exactly one owner writes to the process; at most one command is
/// outstanding at a time.
#[async_trait]
pub trait ProverProcess: Send {
    /// Spawn the process. Any previous process is stopped first.
    async fn start(&mut self) -> Result<SessionStart>;

    /// Close input and kill after a grace window, without waiting.
    fn stop(&mut self);

    /// Close input and wait for exit; kill once `timeout` elapses.
    async fn stop_and_wait(&mut self, timeout: Duration) -> Result<()>;

    /// Stop-and-wait, then start again.
    async fn restart(&mut self) -> Result<SessionStart>;

    /// Whether the process is alive and accepting input.
    fn is_running(&mut self) -> bool;

    /// Write one newline-terminated command.
    async fn send_command(&mut self, text: &str) -> Result<()>;

    /// Wait for the next output event. `None` once no process is attached.
    async fn next_event(&mut self) -> Option<SessionEvent>;

    /// Take every event already queued, without waiting.
    fn drain_events(&mut self) -> Vec<SessionEvent>;

    /// Subscribe to exit notices across restarts.
    fn subscribe_exits(&self) -> broadcast::Receiver<ExitNotice>;
}
