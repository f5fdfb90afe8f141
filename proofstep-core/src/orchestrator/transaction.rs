//! Staleness guard for terminal publications.
//!
//! Every orchestrator operation runs inside one transaction. Ids increase
//! monotonically; beginning a transaction retires the previous one, and only
//! the newest transaction may publish. Consumers apply the same rule with
//! [`PublicationFilter`].

use serde::{Deserialize, Serialize};

use super::types::ProofStatePublication;

/// Why a transaction was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionReason {
    StepForward,
    StepBackward,
    GoToCursor,
    Recovery,
    Retraction,
    Reset,
}

impl std::fmt::Display for TransactionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepForward => write!(f, "step_forward"),
            Self::StepBackward => write!(f, "step_backward"),
            Self::GoToCursor => write!(f, "go_to_cursor"),
            Self::Recovery => write!(f, "recovery"),
            Self::Retraction => write!(f, "retraction"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// One operation's publication token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub reason: TransactionReason,
}

/// Issues transaction ids and tracks which one may publish.
#[derive(Debug, Default)]
pub struct TransactionLog {
    last_id: u64,
    current: Option<Transaction>,
}

impl TransactionLog {
    /// Log with no transaction issued yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction, retiring any open one.
    pub fn begin(&mut self, reason: TransactionReason) -> Transaction {
        self.last_id += 1;
        let tx = Transaction {
            id: self.last_id,
            reason,
        };
        if let Some(retired) = self.current.replace(tx.clone()) {
            tracing::debug!(
                retired = retired.id,
                current = tx.id,
                "Transaction superseded before it ended"
            );
        }
        tx
    }

    /// End `tx`. Returns `true` only for the open, newest transaction, and
    /// only once.
    pub fn end(&mut self, tx: &Transaction) -> bool {
        match &self.current {
            Some(current) if current.id == tx.id => {
                self.current = None;
                true
            }
            _ => false,
        }
    }

    /// The open transaction, if any.
    pub fn current(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    /// Highest id issued so far.
    pub fn last_id(&self) -> u64 {
        self.last_id
    }
}

/// Consumer-side filter dropping publications from superseded transactions.
#[derive(Debug, Clone, Default)]
pub struct PublicationFilter {
    highest: Option<u64>,
}

impl PublicationFilter {
    /// Filter that has seen no publication.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `transaction_id` if no higher id has been seen.
    pub fn accept_id(&mut self, transaction_id: u64) -> bool {
        match self.highest {
            Some(highest) if transaction_id < highest => false,
            _ => {
                self.highest = Some(transaction_id);
                true
            }
        }
    }

    /// Whether `publication` is at least as recent as every one seen so far.
    pub fn accept(&mut self, publication: &ProofStatePublication) -> bool {
        self.accept_id(publication.transaction_id)
    }
}
