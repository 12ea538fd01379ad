use thiserror::Error;

use crate::core::{Identity, UserId};
use crate::object::MaterializationState;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Object not found: {0}")]
    ObjectNotFound(Identity),

    #[error("Illegal state transition: {from} -> {to}")]
    StateViolation {
        from: MaterializationState,
        to: MaterializationState,
    },

    #[error("Cannot {operation} destroyed object {identity}")]
    IllegalStateAccess {
        identity: String,
        operation: &'static str,
    },

    #[error(
        "Concurrency conflict on {identity}: expected version {expected}, found {found} (changed by {actor})"
    )]
    ConcurrencyConflict {
        actor: UserId,
        identity: Identity,
        expected: u64,
        found: u64,
    },

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Unknown type '{0}'")]
    UnknownType(String),

    #[error("Field '{field}' not found on type '{type_tag}'")]
    UnknownField { type_tag: String, field: String },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Identity {0} is already registered")]
    DuplicateIdentity(Identity),

    #[error("Type '{0}' is not persistable")]
    NotPersistable(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
}

pub type Result<T> = std::result::Result<T, PersistError>;

impl From<std::io::Error> for PersistError {
    fn from(err: std::io::Error) -> Self {
        Self::StoreError(err.to_string())
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        Self::StoreError(format!("record encoding: {}", err))
    }
}

impl PersistError {
    /// Errors that mean the caller broke the state-machine contract.
    pub fn is_contract_breach(&self) -> bool {
        matches!(
            self,
            Self::StateViolation { .. } | Self::IllegalStateAccess { .. }
        )
    }
}
