// ============================================================================
// Transaction Module
// ============================================================================
//
// Queues record commands for a session and hands them to the record store
// as one all-or-nothing batch.
//
// ============================================================================

pub mod command;
pub mod state;

pub use command::{CommandKind, RecordCommand};
pub use state::{Transaction, TransactionId, TransactionState};
