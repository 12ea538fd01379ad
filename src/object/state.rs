// ============================================================================
// Materialization State Machine
// ============================================================================
//
// Governs how much of a surrogate's data is loaded. The machine is the only
// authority on whether field data may be read, and it is what detects a
// re-entrant load of an object that is already being materialized.
//
// ============================================================================

use std::fmt;

use crate::core::{PersistError, Result};

/// Load state of a surrogate (or of a collection it owns).
///
/// Permitted transitions:
/// ```text
/// New ───────────────────────────────> Resolved
/// Ghost ──access──> Resolving ──done──> Resolved
///                                       Resolved ──mutate──> Updating
///                                       Updating ──done────> Resolved
/// any state except Destroyed ──record removed──> Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterializationState {
    /// Freshly constructed in memory, not yet populated.
    New,
    /// Instance of a type that is never persisted.
    Transient,
    /// Identity known, no field data loaded.
    Ghost,
    /// Field data is being installed.
    Resolving,
    /// Fully populated.
    Resolved,
    /// A mutation is in progress.
    Updating,
    /// The backing record no longer exists.
    Destroyed,
}

impl MaterializationState {
    pub fn can_transition(self, to: MaterializationState) -> bool {
        use MaterializationState::*;
        matches!(
            (self, to),
            (New, Resolved)
                | (Ghost, Resolving)
                | (Resolving, Resolved)
                | (Resolved, Updating)
                | (Updating, Resolved)
        ) || (to == Destroyed && self != Destroyed)
    }

    /// Returns `to` if the move is permitted, otherwise a `StateViolation`.
    pub fn transition(self, to: MaterializationState) -> Result<MaterializationState> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(PersistError::StateViolation { from: self, to })
        }
    }

    pub fn is_ghost(self) -> bool {
        self == Self::Ghost
    }

    pub fn is_destroyed(self) -> bool {
        self == Self::Destroyed
    }

    /// Field data may be read.
    pub fn is_loaded(self) -> bool {
        matches!(self, Self::Resolved | Self::Updating | Self::Transient)
    }

    pub const ALL: [MaterializationState; 7] = [
        Self::New,
        Self::Transient,
        Self::Ghost,
        Self::Resolving,
        Self::Resolved,
        Self::Updating,
        Self::Destroyed,
    ];
}

impl fmt::Display for MaterializationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::New => "NEW",
            Self::Transient => "TRANSIENT",
            Self::Ghost => "GHOST",
            Self::Resolving => "RESOLVING",
            Self::Resolved => "RESOLVED",
            Self::Updating => "UPDATING",
            Self::Destroyed => "DESTROYED",
        };
        write!(f, "{}", label)
    }
}
