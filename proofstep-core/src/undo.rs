//! Statement → state-id mapping for the prover's undo primitive.
//!
//! `pre_states[i]` is the sequence id that existed before statement `i` was
//! executed; undoing back to `k` executed statements means asking the prover
//! to restore `pre_states[k]`. The mapping is only trustworthy while every
//! acknowledged statement advanced the sequence id strictly. Any violation
//! turns the tracker into a failure sentinel until `reset`/`initialize`;
//! callers then fall back to restart-and-replay.

use serde::{Deserialize, Serialize};

use crate::prompt::PromptMarker;

/// Serializable view of the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoStateSnapshot {
    pub current_state_id: u64,
    pub pre_state_id_by_statement_index: Vec<u64>,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

/// Tracks which state id undoes each executed statement.
#[derive(Debug, Clone)]
pub struct UndoStateTracker {
    initial_state_id: u64,
    current_state_id: u64,
    pre_states: Vec<u64>,
    /// `(statement index, pre-state)` captured before a send.
    pending: Option<(usize, u64)>,
    invalid_reason: Option<String>,
}

impl UndoStateTracker {
    /// Create a valid, empty tracker starting at state 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a valid, empty tracker starting at `initial_state_id`.
    pub fn starting_at(initial_state_id: u64) -> Self {
        Self {
            initial_state_id,
            current_state_id: initial_state_id,
            pre_states: Vec::new(),
            pending: None,
            invalid_reason: None,
        }
    }

    /// Re-initialize for a freshly started session.
    pub fn initialize(&mut self, initial_state_id: u64) {
        *self = Self::starting_at(initial_state_id);
    }

    /// Clear all entries and validity, keeping the initial state id.
    pub fn reset(&mut self) {
        self.initialize(self.initial_state_id);
    }

    /// Whether the mapping can still be trusted for fast undo.
    pub fn is_valid(&self) -> bool {
        self.invalid_reason.is_none()
    }

    /// Why the tracker was invalidated.
    pub fn invalid_reason(&self) -> Option<&str> {
        self.invalid_reason.as_deref()
    }

    /// Number of executed statements with a recorded pre-state.
    pub fn len(&self) -> usize {
        self.pre_states.len()
    }

    /// Whether no statement has been recorded.
    pub fn is_empty(&self) -> bool {
        self.pre_states.is_empty()
    }

    /// Sequence id after the last executed statement.
    pub fn current_state_id(&self) -> u64 {
        self.current_state_id
    }

    /// Sequence id the session started at.
    pub fn initial_state_id(&self) -> u64 {
        self.initial_state_id
    }

    /// Pre-state of statement `index`, if recorded.
    pub fn pre_state(&self, index: usize) -> Option<u64> {
        self.pre_states.get(index).copied()
    }

    /// Permanently disable the fast path until the next reset.
    pub fn invalidate(&mut self, reason: impl Into<String>) {
        if self.invalid_reason.is_some() {
            return;
        }
        let reason = reason.into();
        tracing::warn!(reason = %reason, "Undo state tracker invalidated");
        self.invalid_reason = Some(reason);
        self.pending = None;
    }

    /// Capture the current state id as the pre-state of statement `index`.
    pub fn before_statement_send(&mut self, index: usize) {
        if !self.is_valid() {
            return;
        }
        self.pending = Some((index, self.current_state_id));
    }

    /// Record that statement `index` was acknowledged with `marker`.
    ///
    /// Returns `false` (and invalidates) on any invariant violation.
    pub fn after_statement_processed(&mut self, index: usize, marker: &PromptMarker) -> bool {
        if !self.is_valid() {
            return false;
        }
        let pre_state = match self.pending.take() {
            Some((pending_index, pre_state)) if pending_index == index => pre_state,
            Some((pending_index, _)) => {
                self.invalidate(format!(
                    "statement {} acknowledged while {} was pending",
                    index, pending_index
                ));
                return false;
            }
            None => {
                self.invalidate(format!(
                    "statement {} acknowledged without a captured pre-state",
                    index
                ));
                return false;
            }
        };

        if index != self.pre_states.len() {
            self.invalidate(format!(
                "statement index {} does not extend mapping of length {}",
                index,
                self.pre_states.len()
            ));
            return false;
        }
        if !self.check_advance(pre_state, marker.sequence_id) {
            return false;
        }

        self.pre_states.push(pre_state);
        self.current_state_id = marker.sequence_id;
        true
    }

    /// Record a batch of `count` statements starting at `start_index`.
    ///
    /// Validation is atomic: on any violation nothing is appended and the
    /// tracker is invalidated.
    pub fn after_batch_processed(
        &mut self,
        start_index: usize,
        count: usize,
        markers: &[PromptMarker],
    ) -> bool {
        if !self.is_valid() {
            return false;
        }
        self.pending = None;

        if markers.len() != count {
            self.invalidate(format!(
                "batch of {} statements produced {} markers",
                count,
                markers.len()
            ));
            return false;
        }
        if start_index != self.pre_states.len() {
            self.invalidate(format!(
                "batch start {} does not extend mapping of length {}",
                start_index,
                self.pre_states.len()
            ));
            return false;
        }

        let mut previous = self.current_state_id;
        let mut additions = Vec::with_capacity(count);
        for marker in markers {
            if !self.check_advance(previous, marker.sequence_id) {
                return false;
            }
            additions.push(previous);
            previous = marker.sequence_id;
        }

        self.pre_states.extend(additions);
        self.current_state_id = previous;
        true
    }

    /// State id to restore when jumping from `current_count` executed
    /// statements back to `target_count`.
    ///
    /// `None` if the jump is not strictly backward or the tracker is invalid.
    /// A negative target undoes everything.
    pub fn undo_target_for_backward_jump(
        &self,
        current_count: usize,
        target_count: i64,
    ) -> Option<u64> {
        if !self.is_valid() {
            return None;
        }
        if target_count < 0 {
            return Some(self.initial_state_id);
        }
        let target = usize::try_from(target_count).ok()?;
        if target >= current_count {
            return None;
        }
        self.pre_states.get(target).copied()
    }

    /// Truncate to `new_count` statements after a successful undo.
    ///
    /// The prover is the source of truth: a reported state id differing from
    /// the recorded one is logged and adopted.
    pub fn after_undo_succeeded(&mut self, new_count: usize, new_state_id: u64) {
        if !self.is_valid() {
            return;
        }
        self.pending = None;
        if new_count > self.pre_states.len() {
            self.invalidate(format!(
                "undo to {} statements exceeds mapping of length {}",
                new_count,
                self.pre_states.len()
            ));
            return;
        }

        let expected = self
            .pre_states
            .get(new_count)
            .copied()
            .unwrap_or(self.current_state_id);
        if expected != new_state_id {
            tracing::warn!(
                expected,
                reported = new_state_id,
                "State id after undo differs from recorded mapping"
            );
        }

        self.pre_states.truncate(new_count);
        self.current_state_id = new_state_id;
    }

    /// Serializable copy of the current state.
    pub fn snapshot(&self) -> UndoStateSnapshot {
        UndoStateSnapshot {
            current_state_id: self.current_state_id,
            pre_state_id_by_statement_index: self.pre_states.clone(),
            valid: self.is_valid(),
            invalid_reason: self.invalid_reason.clone(),
        }
    }

    fn check_advance(&mut self, previous: u64, next: u64) -> bool {
        if next <= previous {
            self.invalidate(format!(
                "sequence id did not increase ({} -> {})",
                previous, next
            ));
            return false;
        }
        if next > previous + 1 {
            tracing::debug!(previous, next, "Sequence id advanced by more than one");
        }
        true
    }
}

impl Default for UndoStateTracker {
    fn default() -> Self {
        Self::new()
    }
}
