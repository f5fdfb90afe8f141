//! Document stepping against a live prover.
//!
//! ## Components
//!
//! - **command**: one command's send / count / debounce / resolve cycle
//! - **transaction**: staleness guard for terminal publications
//! - **engine**: the stepping state machine
//! - **types**: outcomes, events and status values for the host
//!
//! [`StepOrchestrator`] is the host-facing handle. It runs at most one
//! operation at a time and rejects overlapping requests with a busy outcome
//! instead of queueing them. Document updates are accepted at any time;
//! edits inside the verified region are coalesced into a single retraction
//! that runs as soon as the orchestrator is free.

mod command;
mod engine;
pub mod transaction;
pub mod types;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::ProverConfig;
use crate::error::Result;
use crate::session::{ExitNotice, ProverProcess};
use crate::undo::UndoStateSnapshot;

use engine::{Intent, StepEngine};
pub use transaction::{PublicationFilter, Transaction, TransactionLog, TransactionReason};
pub use types::{
    OrchestratorState, ProofStatePublication, StepOutcome, StepperEvent, StepperStatus,
    BUSY_MESSAGE,
};

const EVENT_CAPACITY: usize = 256;

/// Document updates received since the engine last looked.
#[derive(Debug, Default)]
struct Inbox {
    document: Option<(String, i64)>,
    /// Smallest edit offset not yet handled.
    retract_from: Option<usize>,
}

/// Host-facing handle driving one document against one prover session.
pub struct StepOrchestrator<P: ProverProcess> {
    engine: Mutex<StepEngine<P>>,
    inbox: StdMutex<Inbox>,
    events: broadcast::Sender<StepperEvent>,
    last_status: StdMutex<StepperStatus>,
    execution_offset: AtomicUsize,
    exit_forwarder: JoinHandle<()>,
}

impl<P: ProverProcess + 'static> StepOrchestrator<P> {
    /// Create an orchestrator owning `session`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(session: P, config: ProverConfig) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let exits = session.subscribe_exits();
        let mut engine = StepEngine::new(session, config, events.clone())?;
        let exit_forwarder = spawn_exit_forwarder(exits, events.clone());
        let last_status = engine.status();
        Ok(Self {
            engine: Mutex::new(engine),
            inbox: StdMutex::new(Inbox::default()),
            events,
            last_status: StdMutex::new(last_status),
            execution_offset: AtomicUsize::new(0),
            exit_forwarder,
        })
    }

    /// Subscribe to host notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StepperEvent> {
        self.events.subscribe()
    }

    /// Verified-region boundary as of the last completed operation.
    pub fn execution_offset(&self) -> usize {
        self.execution_offset.load(Ordering::SeqCst)
    }

    /// Push the current document.
    ///
    /// `edit_start` is the offset of the edit that produced this version. An
    /// edit inside the verified region schedules a retraction; it runs now if
    /// the orchestrator is idle (and its outcome is returned), otherwise
    /// before the running operation releases the orchestrator.
    pub async fn update_document(
        &self,
        text: impl Into<String>,
        version: i64,
        edit_start: Option<usize>,
    ) -> Option<StepOutcome> {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.document = Some((text.into(), version));
            if let Some(edit) = edit_start {
                inbox.retract_from = Some(inbox.retract_from.map_or(edit, |r| r.min(edit)));
            }
        }
        self.settle().await
    }

    /// Execute the next statement.
    pub async fn step_forward(&self) -> StepOutcome {
        self.run(Intent::StepForward).await
    }

    /// Retract the last executed statement.
    pub async fn step_backward(&self) -> StepOutcome {
        self.run(Intent::StepBackward).await
    }

    /// Move the verified region to the statement boundary at `cursor`.
    pub async fn go_to_cursor(&self, cursor: usize) -> StepOutcome {
        self.run(Intent::GoToCursor(cursor)).await
    }

    /// Restart the prover and replay up to the current offset.
    pub async fn force_recovery(&self) -> StepOutcome {
        self.run(Intent::ForceRecovery).await
    }

    /// Restart affordance offered after the prover exited unexpectedly.
    pub async fn restart_session(&self) -> StepOutcome {
        self.run(Intent::ForceRecovery).await
    }

    /// Stop the prover and forget all progress.
    pub async fn reset(&self) -> StepOutcome {
        self.run(Intent::Reset).await
    }

    /// Current status; the last recorded values while an operation runs.
    pub fn status(&self) -> StepperStatus {
        if let Ok(mut engine) = self.engine.try_lock() {
            return engine.status();
        }
        match self.last_status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Undo tracker state, for diagnostics. Waits for a running operation.
    pub async fn tracker_snapshot(&self) -> UndoStateSnapshot {
        self.engine.lock().await.tracker_snapshot()
    }

    /// Stop the prover. Waits for a running operation.
    pub async fn shutdown(&self) {
        let mut engine = self.engine.lock().await;
        engine.shutdown().await;
        self.record(&mut engine);
    }

    async fn run(&self, intent: Intent) -> StepOutcome {
        let Ok(mut engine) = self.engine.try_lock() else {
            tracing::debug!(?intent, "Rejecting request: operation in progress");
            return StepOutcome::busy();
        };
        self.take_document(&mut engine);
        // Edits that arrived while idle apply before the intent sees the document.
        self.drain_retractions(&mut engine).await;

        self.note_state(intent.state());
        let mut outcome = engine.perform(intent).await;
        if let Some(retraction) = self.drain_retractions(&mut engine).await {
            outcome.execution_offset = retraction.execution_offset;
        }
        self.record(&mut engine);
        drop(engine);

        // An update may have lost the lock race after the last drain.
        if self.retraction_pending() {
            if let Some(retraction) = self.settle().await {
                outcome.execution_offset = retraction.execution_offset;
            }
        }
        outcome
    }

    /// Apply inbox contents if the engine is free, repeating while updates
    /// keep arriving. Returns the last retraction outcome.
    ///
    /// Every lock holder calls this after releasing the engine, so an update
    /// rejected by `try_lock` is always picked up by whoever held it.
    async fn settle(&self) -> Option<StepOutcome> {
        let mut last = None;
        loop {
            let Ok(mut engine) = self.engine.try_lock() else {
                return last;
            };
            self.take_document(&mut engine);
            if let Some(outcome) = self.drain_retractions(&mut engine).await {
                last = Some(outcome);
            }
            self.record(&mut engine);
            drop(engine);

            if !self.retraction_pending() {
                return last;
            }
        }
    }

    fn retraction_pending(&self) -> bool {
        self.inbox
            .lock()
            .map(|inbox| inbox.retract_from.is_some())
            .unwrap_or(false)
    }

    fn take_document(&self, engine: &mut StepEngine<P>) {
        let update = match self.inbox.lock() {
            Ok(mut inbox) => inbox.document.take(),
            Err(_) => None,
        };
        if let Some((text, version)) = update {
            engine.set_document(text, version);
        }
    }

    /// Run pending retractions until none remain; returns the last outcome.
    async fn drain_retractions(&self, engine: &mut StepEngine<P>) -> Option<StepOutcome> {
        let mut last = None;
        loop {
            let edit = match self.inbox.lock() {
                Ok(mut inbox) => inbox.retract_from.take(),
                Err(_) => None,
            };
            let Some(edit) = edit else {
                return last;
            };
            self.take_document(engine);
            if edit < engine.execution_offset() {
                self.note_state(Intent::Retract(edit).state());
                last = Some(engine.perform(Intent::Retract(edit)).await);
            }
        }
    }

    fn note_state(&self, state: OrchestratorState) {
        if let Ok(mut status) = self.last_status.lock() {
            status.state = state;
        }
    }

    fn record(&self, engine: &mut StepEngine<P>) {
        let status = engine.status();
        self.execution_offset
            .store(status.execution_offset, Ordering::SeqCst);
        if let Ok(mut last) = self.last_status.lock() {
            *last = status;
        }
    }
}

impl<P: ProverProcess> Drop for StepOrchestrator<P> {
    fn drop(&mut self) {
        self.exit_forwarder.abort();
    }
}

/// Republish unexpected exits as host events, with or without a command in
/// flight.
fn spawn_exit_forwarder(
    mut exits: broadcast::Receiver<ExitNotice>,
    events: broadcast::Sender<StepperEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match exits.recv().await {
                Ok(notice) if !notice.expected => {
                    let _ = events.send(StepperEvent::ProcessExited {
                        session_id: notice.session_id,
                        code: notice.code,
                        restart_available: true,
                    });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Exit notices lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
