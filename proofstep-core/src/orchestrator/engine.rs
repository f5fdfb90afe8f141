//! The stepping state machine.
//!
//! `StepEngine` is the single sequencing point for the document, the
//! statement index, the undo tracker, the execution offset and the prover
//! session. Every public operation runs inside one transaction and publishes
//! exactly one terminal state when it ends.
//!
//! Backward motion tries the fast path first (one undo command addressed by
//! the tracker) and falls back to recovery: restart the prover and replay
//! the document from the top. Forward motion over several statements is
//! submitted as one batch; a rejected batch is rewound and replayed one
//! statement at a time so that the prefix before the failing statement
//! still succeeds.

use chrono::Utc;
use tokio::sync::broadcast;

use super::command::{CommandGate, CommandResponse, PendingCommand};
use super::transaction::{Transaction, TransactionLog, TransactionReason};
use super::types::{
    OrchestratorState, ProofStatePublication, StepOutcome, StepperEvent, StepperStatus,
};
use crate::config::{ProtocolSyntax, ProverConfig};
use crate::error::{Error, Result};
use crate::prompt::PromptCounter;
use crate::session::ProverProcess;
use crate::statement::{Statement, StatementIndex};
use crate::undo::{UndoStateSnapshot, UndoStateTracker};

/// A host intent, as executed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    StepForward,
    StepBackward,
    GoToCursor(usize),
    ForceRecovery,
    /// Edit-triggered retraction to before `edit_start`.
    Retract(usize),
    Reset,
}

impl Intent {
    /// State shown to observers while the intent runs.
    pub fn state(&self) -> OrchestratorState {
        match self {
            Self::StepForward | Self::GoToCursor(_) => OrchestratorState::Stepping,
            Self::StepBackward | Self::Retract(_) | Self::Reset => OrchestratorState::Retracting,
            Self::ForceRecovery => OrchestratorState::Recovering,
        }
    }

    fn reason(&self) -> TransactionReason {
        match self {
            Self::StepForward => TransactionReason::StepForward,
            Self::StepBackward => TransactionReason::StepBackward,
            Self::GoToCursor(_) => TransactionReason::GoToCursor,
            Self::ForceRecovery => TransactionReason::Recovery,
            Self::Retract(_) => TransactionReason::Retraction,
            Self::Reset => TransactionReason::Reset,
        }
    }
}

/// Result of a batch submission the prover answered.
enum BatchReply {
    Accepted,
    /// The prover reported an error; `prover_state` is the last sequence id
    /// it printed.
    Rejected { message: String, prover_state: u64 },
}

struct OperationScope {
    tx: Transaction,
    start_offset: usize,
}

pub struct StepEngine<P> {
    session: P,
    config: ProverConfig,
    protocol: ProtocolSyntax,
    document: String,
    version: i64,
    index: StatementIndex,
    tracker: UndoStateTracker,
    execution_offset: usize,
    statements_proved: usize,
    state: OrchestratorState,
    gate: CommandGate,
    transactions: TransactionLog,
    events: broadcast::Sender<StepperEvent>,
    /// The running process has not printed any marker yet.
    startup_pending: bool,
    last_output: String,
}

impl<P: ProverProcess> StepEngine<P> {
    /// Build an engine around a stopped `session`. Fails on an invalid protocol configuration.
    pub fn new(
        session: P,
        config: ProverConfig,
        events: broadcast::Sender<StepperEvent>,
    ) -> Result<Self> {
        let protocol = config.protocol()?;
        let tracker = UndoStateTracker::starting_at(protocol.initial_sequence_id());
        Ok(Self {
            session,
            config,
            protocol,
            document: String::new(),
            version: 0,
            index: StatementIndex::new(),
            tracker,
            execution_offset: 0,
            statements_proved: 0,
            state: OrchestratorState::Idle,
            gate: CommandGate::new(),
            transactions: TransactionLog::new(),
            events,
            startup_pending: false,
            last_output: String::new(),
        })
    }

    /// Replace the tracked document.
    pub fn set_document(&mut self, text: String, version: i64) {
        self.document = text;
        self.version = version;
        self.index.update(&self.document, self.version);
    }

    /// Verified-region boundary.
    pub fn execution_offset(&self) -> usize {
        self.execution_offset
    }

    /// Copy of the undo tracker state.
    pub fn tracker_snapshot(&self) -> UndoStateSnapshot {
        self.tracker.snapshot()
    }

    /// Current status values.
    pub fn status(&mut self) -> StepperStatus {
        StepperStatus {
            state: self.state,
            execution_offset: self.execution_offset,
            statements_proved: self.statements_proved,
            tracker_valid: self.tracker.is_valid(),
            session_running: self.session.is_running() && !self.gate.is_in_flight(),
        }
    }

    /// Run one host intent to completion.
    pub async fn perform(&mut self, intent: Intent) -> StepOutcome {
        let scope = self.begin(intent);
        let result = match intent {
            Intent::StepForward => self.step_forward().await,
            Intent::StepBackward => self.step_backward().await,
            Intent::GoToCursor(cursor) => self.go_to_cursor(cursor).await,
            Intent::ForceRecovery => {
                let target = self.execution_offset;
                self.recover_to(target).await
            }
            Intent::Retract(edit_start) => self.retract(edit_start).await,
            Intent::Reset => self.reset().await,
        };
        self.finish(scope, result)
    }

    /// Stop the prover for good.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.session.stop_and_wait(self.config.stop_wait_timeout()).await {
            tracing::warn!("Prover did not shut down cleanly: {}", e);
        }
        self.gate.clear();
    }

    fn begin(&mut self, intent: Intent) -> OperationScope {
        self.index.update(&self.document, self.version);
        self.state = intent.state();
        let tx = self.transactions.begin(intent.reason());
        tracing::debug!(transaction = tx.id, reason = %tx.reason, "Operation started");
        OperationScope {
            tx,
            start_offset: self.execution_offset,
        }
    }

    fn finish(&mut self, scope: OperationScope, result: Result<()>) -> StepOutcome {
        self.state = OrchestratorState::Idle;

        let error = match result {
            Ok(()) => None,
            Err(err) => {
                if matches!(err, Error::Prover { .. }) {
                    tracing::debug!(reason = %scope.tx.reason, "Prover rejected statement: {}", err);
                } else {
                    tracing::warn!(reason = %scope.tx.reason, "Operation failed: {}", err);
                }
                Some(err.user_message())
            }
        };

        if self.execution_offset != scope.start_offset {
            let _ = self.events.send(StepperEvent::ExecutionOffsetChanged {
                offset: self.execution_offset,
                statements_proved: self.statements_proved,
            });
        }

        if self.transactions.end(&scope.tx) {
            let _ = self
                .events
                .send(StepperEvent::ProofState(ProofStatePublication {
                    transaction_id: scope.tx.id,
                    reason: scope.tx.reason,
                    success: error.is_none(),
                    error: error.clone(),
                    output: self.last_output.clone(),
                    statements_proved: self.statements_proved,
                    execution_offset: self.execution_offset,
                    timestamp: Utc::now(),
                }));
        }

        match error {
            None => StepOutcome::success(self.execution_offset),
            Some(error) => StepOutcome::failure(error, self.execution_offset),
        }
    }

    // =========================================================================
    // Intents
    // =========================================================================

    async fn step_forward(&mut self) -> Result<()> {
        if self.index.next_statement(self.execution_offset).is_none() {
            return Ok(());
        }
        self.ensure_session().await?;
        // Recovery may have stopped short of the old offset.
        let Some(stmt) = self.index.next_statement(self.execution_offset).cloned() else {
            return Ok(());
        };
        self.execute_single(&stmt).await
    }

    async fn step_backward(&mut self) -> Result<()> {
        if self.execution_offset == 0 {
            return Ok(());
        }
        let target = self.index.previous_end(self.execution_offset);
        self.backward_to(target).await
    }

    async fn go_to_cursor(&mut self, cursor: usize) -> Result<()> {
        let target = self.index.target_end_offset(cursor);
        if target < self.execution_offset {
            self.state = OrchestratorState::Retracting;
            return self.backward_to(target).await;
        }
        if target == self.execution_offset {
            return Ok(());
        }

        self.ensure_session().await?;
        let pending = self.index.statements_in_range(self.execution_offset, target);
        if pending.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            from = self.execution_offset,
            to = target,
            statements = pending.len(),
            "Moving forward to cursor"
        );
        self.forward_through(pending).await
    }

    async fn retract(&mut self, edit_start: usize) -> Result<()> {
        if edit_start >= self.execution_offset {
            return Ok(());
        }
        let target = self.boundary_at_or_before(edit_start);
        tracing::debug!(edit_start, target, "Retracting after edit in verified region");
        self.backward_to(target).await
    }

    async fn reset(&mut self) -> Result<()> {
        if let Err(e) = self.session.stop_and_wait(self.config.stop_wait_timeout()).await {
            tracing::warn!("Prover did not stop cleanly during reset: {}", e);
        }
        self.gate.clear();
        self.tracker.initialize(self.protocol.initial_sequence_id());
        self.execution_offset = 0;
        self.statements_proved = 0;
        self.last_output.clear();
        self.index.clear();
        self.index.update(&self.document, self.version);
        Ok(())
    }

    // =========================================================================
    // Backward motion
    // =========================================================================

    async fn backward_to(&mut self, target: usize) -> Result<()> {
        if target >= self.execution_offset {
            return Ok(());
        }
        if self.try_fast_undo(target).await {
            return Ok(());
        }
        self.recover_to(target).await
    }

    /// Undo to `target` with a single command. `false` if recovery is needed.
    async fn try_fast_undo(&mut self, target: usize) -> bool {
        if !self.tracker.is_valid() {
            tracing::debug!(
                reason = self.tracker.invalid_reason().unwrap_or_default(),
                "Fast undo unavailable: tracker invalid"
            );
            return false;
        }
        if self.gate.is_in_flight() || !self.session.is_running() {
            tracing::debug!("Fast undo unavailable: no usable session");
            return false;
        }
        if self.tracker.len() != self.statements_proved {
            self.tracker.invalidate(format!(
                "tracker holds {} statements but {} are proved",
                self.tracker.len(),
                self.statements_proved
            ));
            return false;
        }

        let target_count = self.index.count_up_to(target);
        let Some(state_id) = self
            .tracker
            .undo_target_for_backward_jump(self.statements_proved, target_count as i64)
        else {
            return false;
        };

        let command = self.protocol.undo_command(state_id);
        match self.submit(&command, 1).await {
            Ok(response) => {
                if let Some(message) = response.error_message() {
                    tracing::info!("Prover rejected undo, falling back to recovery: {}", message);
                    return false;
                }
                let reported = response
                    .last_marker()
                    .map(|m| m.sequence_id)
                    .unwrap_or(state_id);
                if reported != state_id {
                    tracing::warn!(
                        requested = state_id,
                        reported,
                        "Prover reported a different state after undo"
                    );
                }
                self.tracker.after_undo_succeeded(target_count, reported);
                self.statements_proved = target_count;
                self.execution_offset = target;
                true
            }
            Err(e) => {
                tracing::info!("Undo command failed, falling back to recovery: {}", e);
                false
            }
        }
    }

    /// Restart the prover and replay everything up to `target`.
    ///
    /// The execution offset ends at the last statement that succeeded.
    async fn recover_to(&mut self, target: usize) -> Result<()> {
        self.state = OrchestratorState::Recovering;
        tracing::info!(target, "Recovering: restarting prover and replaying");

        if let Err(e) = self.session.stop_and_wait(self.config.stop_wait_timeout()).await {
            tracing::warn!("Prover did not stop cleanly before recovery: {}", e);
        }
        self.start_session().await?;

        let replay = self.index.statements_up_to(target);
        if !replay.is_empty() {
            self.forward_through(replay).await?;
        }
        tracing::info!(
            offset = self.execution_offset,
            statements = self.statements_proved,
            "Recovery finished"
        );
        Ok(())
    }

    // =========================================================================
    // Forward motion
    // =========================================================================

    /// Execute `stmts`, which directly follow the execution offset.
    async fn forward_through(&mut self, stmts: Vec<Statement>) -> Result<()> {
        if let [single] = stmts.as_slice() {
            return self.execute_single(single).await;
        }

        let pre_batch = self.tracker.current_state_id();
        match self.execute_batch(&stmts).await {
            Ok(BatchReply::Accepted) => Ok(()),
            Ok(BatchReply::Rejected {
                message,
                prover_state,
            }) => {
                tracing::debug!("Batch rejected ({}); replaying one statement at a time", message);
                if self.rewind_batch(pre_batch, prover_state).await {
                    self.replay_sequentially(&stmts).await
                } else {
                    self.restart_and_replay(stmts).await
                }
            }
            Err(e) if e.leaves_session_unknown() => {
                tracing::warn!("Batch left the prover in an unknown state: {}", e);
                self.restart_and_replay(stmts).await
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_single(&mut self, stmt: &Statement) -> Result<()> {
        let index = self.statements_proved;
        self.tracker.before_statement_send(index);

        let response = self.submit(&stmt.text, 1).await?;
        if let Some(message) = response.error_message() {
            return Err(Error::prover(message));
        }
        match response.last_marker() {
            Some(marker) => {
                self.tracker.after_statement_processed(index, marker);
            }
            None => self
                .tracker
                .invalidate(format!("statement {} acknowledged without a marker", index)),
        }

        self.statements_proved += 1;
        self.execution_offset = stmt.end_offset;
        Ok(())
    }

    async fn execute_batch(&mut self, stmts: &[Statement]) -> Result<BatchReply> {
        let start_index = self.statements_proved;
        let text = stmts
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let response = self.submit(&text, stmts.len()).await?;
        if let Some(message) = response.error_message() {
            let prover_state = response
                .last_marker()
                .map(|m| m.sequence_id)
                .unwrap_or_else(|| self.tracker.current_state_id());
            return Ok(BatchReply::Rejected {
                message: message.to_string(),
                prover_state,
            });
        }

        self.tracker
            .after_batch_processed(start_index, stmts.len(), &response.markers());
        self.statements_proved += stmts.len();
        if let Some(last) = stmts.last() {
            self.execution_offset = last.end_offset;
        }
        Ok(BatchReply::Accepted)
    }

    /// Undo whatever part of a rejected batch the prover accepted.
    async fn rewind_batch(&mut self, pre_batch: u64, prover_state: u64) -> bool {
        if prover_state == pre_batch {
            return true;
        }
        if !self.tracker.is_valid() {
            return false;
        }

        let command = self.protocol.undo_command(pre_batch);
        match self.submit(&command, 1).await {
            Ok(response) if !response.is_error() => {
                // A marker left over from the batch can settle the undo
                // command; only the pre-batch id proves the rewind happened.
                match response.last_marker() {
                    Some(marker) if marker.sequence_id == pre_batch => {
                        self.tracker
                            .after_undo_succeeded(self.statements_proved, pre_batch);
                        true
                    }
                    other => {
                        tracing::warn!(
                            expected = pre_batch,
                            reported = ?other.map(|m| m.sequence_id),
                            "Batch rewind answered with an unexpected state"
                        );
                        false
                    }
                }
            }
            Ok(response) => {
                tracing::warn!(
                    "Prover refused to rewind batch: {}",
                    response.error_message().unwrap_or_default()
                );
                false
            }
            Err(e) => {
                tracing::warn!("Failed to rewind batch: {}", e);
                false
            }
        }
    }

    /// Restart, then replay the proved prefix followed by `stmts`.
    async fn restart_and_replay(&mut self, stmts: Vec<Statement>) -> Result<()> {
        let mut replay = self.index.statements_up_to(self.execution_offset);
        replay.extend(stmts);

        if let Err(e) = self.session.stop_and_wait(self.config.stop_wait_timeout()).await {
            tracing::warn!("Prover did not stop cleanly before replay: {}", e);
        }
        self.start_session().await?;
        self.replay_sequentially(&replay).await
    }

    /// Execute statements one by one, stopping at the first failure.
    async fn replay_sequentially(&mut self, stmts: &[Statement]) -> Result<()> {
        for stmt in stmts {
            if stmt.end_offset <= self.execution_offset {
                continue;
            }
            self.execute_single(stmt).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Session plumbing
    // =========================================================================

    /// Make sure a usable prover is attached at the current offset.
    ///
    /// A lost session is recovered to the current execution offset; with
    /// nothing proved a plain start suffices.
    async fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_running() && !self.gate.is_in_flight() {
            return Ok(());
        }
        if self.execution_offset == 0 {
            return self.start_session().await;
        }
        let target = self.execution_offset;
        tracing::info!(target, "Prover session lost; recovering");
        self.recover_to(target).await?;
        if self.execution_offset < target {
            return Err(Error::Protocol(format!(
                "recovery stopped at offset {} before reaching {}",
                self.execution_offset, target
            )));
        }
        Ok(())
    }

    async fn start_session(&mut self) -> Result<()> {
        let start = self.session.start().await?;
        self.gate.clear();
        self.startup_pending = start.startup_marker.is_none();
        let initial = start
            .startup_marker
            .map(|m| m.sequence_id)
            .unwrap_or_else(|| self.protocol.initial_sequence_id());
        self.tracker.initialize(initial);
        self.execution_offset = 0;
        self.statements_proved = 0;
        tracing::debug!(session_id = %start.session_id, initial, "Prover session ready");
        Ok(())
    }

    /// Send one command through the gate.
    ///
    /// Failures that leave the prover's position unknown stop the session and
    /// invalidate the tracker, so the next operation starts with recovery.
    async fn submit(&mut self, text: &str, expected: usize) -> Result<CommandResponse> {
        let counter = if self.startup_pending {
            PromptCounter::awaiting_startup(self.protocol.initial_sequence_id())
        } else {
            PromptCounter::new()
        };
        let pending = PendingCommand::new(
            expected,
            counter,
            self.config.debounce_for(expected),
            self.config.command_timeout(),
        );
        if self.config.verbose {
            tracing::debug!(expected, "Submitting command: {}", text);
        }

        let result = self
            .gate
            .submit(&mut self.session, text, pending, &self.protocol, &self.events)
            .await;

        match &result {
            Ok(response) => {
                if !response.segments.is_empty() {
                    self.startup_pending = false;
                }
                self.last_output = response.display_output();
            }
            Err(e) if e.leaves_session_unknown() => {
                self.tracker
                    .invalidate(format!("prover position unknown after: {}", e));
                self.session.stop();
            }
            Err(_) => {}
        }
        result
    }

    /// End of the last statement ending at or before `offset`, or 0.
    fn boundary_at_or_before(&self, offset: usize) -> usize {
        let count = self.index.count_up_to(offset);
        count
            .checked_sub(1)
            .and_then(|i| self.index.statements().get(i))
            .map(|s| s.end_offset)
            .unwrap_or(0)
    }
}
