// ============================================================================
// Transaction State Management
// ============================================================================
//
// A transaction is an ordered queue of record commands. It moves
// Active -> Committed or Active -> Aborted and never leaves either.
//
// ============================================================================

use super::RecordCommand;
use crate::core::{PersistError, Result};

/// Identifier of a transaction, unique within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn first() -> Self {
        TransactionId(1)
    }

    pub fn next(&self) -> Self {
        TransactionId(self.0 + 1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// ```text
/// Active ──commit──> Committed
///   │
///   └──abort──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    /// Applied strictly in this order on commit.
    commands: Vec<RecordCommand>,
    start_time: std::time::Instant,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            commands: Vec::new(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn commands(&self) -> &[RecordCommand] {
        &self.commands
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    fn require_active(&self) -> Result<()> {
        if !self.state.is_active() {
            return Err(PersistError::Transaction(format!(
                "transaction {} is {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    pub fn enqueue(&mut self, command: RecordCommand) -> Result<()> {
        self.require_active()?;
        self.commands.push(command);
        Ok(())
    }

    /// Hands the queue over for applying. The transaction stays active until
    /// it is marked committed or aborted.
    pub fn take_commands(&mut self) -> Result<Vec<RecordCommand>> {
        self.require_active()?;
        Ok(std::mem::take(&mut self.commands))
    }

    pub fn mark_committed(&mut self) -> Result<()> {
        self.require_active()?;
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Drops every queued command.
    pub fn mark_aborted(&mut self) -> Result<()> {
        self.require_active()?;
        self.commands.clear();
        self.state = TransactionState::Aborted;
        Ok(())
    }
}
