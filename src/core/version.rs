use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Name of the actor that stamped a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self("system".to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for UserId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Optimistic-lock token stored on every root record.
///
/// Equality and ordering look at `sequence` only; `changed_at` and
/// `changed_by` are carried for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionStamp {
    pub sequence: u64,
    pub changed_at: DateTime<Utc>,
    pub changed_by: UserId,
}

impl VersionStamp {
    /// Stamp given to a root on its first commit.
    pub fn initial(actor: &UserId) -> Self {
        Self {
            sequence: 0,
            changed_at: Utc::now(),
            changed_by: actor.clone(),
        }
    }

    pub fn at(sequence: u64, actor: &UserId) -> Self {
        Self {
            sequence,
            changed_at: Utc::now(),
            changed_by: actor.clone(),
        }
    }

    /// Stamp that follows this one after a successful update.
    pub fn next(&self, actor: &UserId) -> Self {
        Self {
            sequence: self.sequence + 1,
            changed_at: Utc::now(),
            changed_by: actor.clone(),
        }
    }

    pub fn differs(&self, other: &VersionStamp) -> bool {
        self.sequence != other.sequence
    }
}

impl PartialEq for VersionStamp {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for VersionStamp {}

impl PartialOrd for VersionStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{} ({} at {})",
            self.sequence,
            self.changed_by,
            self.changed_at.to_rfc3339()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_stamps_compare_by_sequence_only() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let a = VersionStamp::at(2, &alice);
        let mut b = VersionStamp::at(2, &bob);
        b.changed_at = b.changed_at + Duration::hours(3);

        assert_eq!(a, b);
        assert!(!a.differs(&b));
        assert!(a.differs(&a.next(&alice)));
    }

    #[test]
    fn test_next_increments_and_restamps() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let first = VersionStamp::initial(&alice);
        let second = first.next(&bob);

        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.changed_by, bob);
        assert!(second > first);
    }
}
