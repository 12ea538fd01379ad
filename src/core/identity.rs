use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use crate::core::{PersistError, Result, VersionStamp};

/// Whether an identity owns its record or lives inside a root's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityKind {
    Root,
    Parented,
}

/// Immutable key of one conceptual record.
///
/// Identities compare by `(type_tag, local_id, parent)`. The version stamp
/// and the transient flag never take part in equality.
///
/// Text form: `Invoice#1` for roots, `Invoice#1/lines:Line` for parented
/// identities, `Invoice#~<uuid>` for roots that have not been committed yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "IdentityRepr")]
pub struct Identity {
    kind: IdentityKind,
    type_tag: String,
    local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<VersionStamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Box<Identity>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    transient: bool,
}

pub(crate) fn validate_segment(what: &str, segment: &str) -> Result<()> {
    let valid = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PersistError::InvalidIdentity(format!(
            "{} '{}' may only contain ASCII letters, digits, '_', '-' and '.'",
            what, segment
        )))
    }
}

/// Type tags starting with `_` are reserved for store bookkeeping files.
pub(crate) fn validate_type_tag(type_tag: &str) -> Result<()> {
    validate_segment("type tag", type_tag)?;
    if type_tag.starts_with('_') {
        return Err(PersistError::InvalidIdentity(format!(
            "type tag '{}' may not start with '_'",
            type_tag
        )));
    }
    Ok(())
}

/// Wire form of [`Identity`]; identities read back from records and the
/// service registry are validated like parsed ones.
#[derive(Deserialize)]
struct IdentityRepr {
    kind: IdentityKind,
    type_tag: String,
    local_id: String,
    #[serde(default)]
    version: Option<VersionStamp>,
    #[serde(default)]
    parent: Option<Box<Identity>>,
    #[serde(default)]
    transient: bool,
}

impl TryFrom<IdentityRepr> for Identity {
    type Error = PersistError;

    fn try_from(repr: IdentityRepr) -> Result<Self> {
        validate_type_tag(&repr.type_tag)?;
        validate_segment("local id", &repr.local_id)?;
        match (repr.kind, repr.parent.as_deref()) {
            (IdentityKind::Root, None) => {}
            (IdentityKind::Parented, Some(parent)) if parent.is_root() => {}
            _ => {
                return Err(PersistError::InvalidIdentity(format!(
                    "{:?} identity '{}#{}' has an inconsistent parent",
                    repr.kind, repr.type_tag, repr.local_id
                )));
            }
        }
        Ok(Self {
            kind: repr.kind,
            type_tag: repr.type_tag,
            local_id: repr.local_id,
            version: repr.version,
            parent: repr.parent,
            transient: repr.transient,
        })
    }
}

impl Identity {
    /// Persistent root identity.
    pub fn root(type_tag: impl Into<String>, local_id: impl Into<String>) -> Result<Self> {
        let type_tag = type_tag.into();
        let local_id = local_id.into();
        validate_type_tag(&type_tag)?;
        validate_segment("local id", &local_id)?;
        Ok(Self {
            kind: IdentityKind::Root,
            type_tag,
            local_id,
            version: None,
            parent: None,
            transient: false,
        })
    }

    /// Root identity for an object that has not been committed yet.
    pub fn transient(type_tag: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Root,
            type_tag: type_tag.into(),
            local_id: Uuid::new_v4().simple().to_string(),
            version: None,
            parent: None,
            transient: true,
        }
    }

    /// Identity of a sub-object (embedded object or collection) owned by
    /// `self`. The parent is always the aggregate root; nested segments are
    /// joined with `.`.
    pub fn child(&self, type_tag: impl Into<String>, segment: &str) -> Self {
        let (root, local_id) = match self.kind {
            IdentityKind::Root => (self.without_version(), segment.to_string()),
            IdentityKind::Parented => (
                self.root_identity().without_version(),
                format!("{}.{}", self.local_id, segment),
            ),
        };
        Self {
            kind: IdentityKind::Parented,
            type_tag: type_tag.into(),
            local_id,
            version: None,
            parent: Some(Box::new(root)),
            transient: false,
        }
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn is_root(&self) -> bool {
        self.kind == IdentityKind::Root
    }

    pub fn is_parented(&self) -> bool {
        self.kind == IdentityKind::Parented
    }

    /// True when this identity, or the root it belongs to, was never committed.
    pub fn is_transient(&self) -> bool {
        match &self.parent {
            Some(parent) => parent.is_transient(),
            None => self.transient,
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn parent(&self) -> Option<&Identity> {
        self.parent.as_deref()
    }

    /// The aggregate root this identity is versioned through.
    pub fn root_identity(&self) -> &Identity {
        match &self.parent {
            Some(parent) => parent,
            None => self,
        }
    }

    /// Parented identities report their root's stamp.
    pub fn version(&self) -> Option<&VersionStamp> {
        match &self.parent {
            Some(parent) => parent.version(),
            None => self.version.as_ref(),
        }
    }

    pub fn with_version(&self, version: Option<VersionStamp>) -> Self {
        let mut next = self.clone();
        match self.kind {
            IdentityKind::Root => next.version = version,
            IdentityKind::Parented => {
                if let Some(parent) = next.parent.as_mut() {
                    **parent = parent.with_version(version);
                }
            }
        }
        next
    }

    pub fn without_version(&self) -> Self {
        let mut plain = self.clone();
        plain.version = None;
        if let Some(parent) = plain.parent.as_mut() {
            **parent = parent.without_version();
        }
        plain
    }

    /// Rewrites this identity onto `new_root` if it belongs to `old_root`.
    pub fn reparent(&self, old_root: &Identity, new_root: &Identity) -> Option<Self> {
        match &self.parent {
            Some(parent) if **parent == *old_root => {
                let mut moved = self.clone();
                moved.parent = Some(Box::new(new_root.without_version()));
                Some(moved)
            }
            _ => None,
        }
    }

    /// Parses the text form produced by `Display`. Transient identities are
    /// rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let (root_text, child_text) = match text.split_once('/') {
            Some((root, child)) => (root, Some(child)),
            None => (text, None),
        };
        let (type_tag, local_id) = root_text.split_once('#').ok_or_else(|| {
            PersistError::InvalidIdentity(format!("'{}' is not of the form Type#id", text))
        })?;
        let root = Self::root(type_tag, local_id)?;
        let Some(child_text) = child_text else {
            return Ok(root);
        };
        let (local_id, child_type) = child_text.split_once(':').ok_or_else(|| {
            PersistError::InvalidIdentity(format!("'{}' is not of the form path:Type", child_text))
        })?;
        validate_type_tag(child_type)?;
        validate_segment("local id", local_id)?;
        Ok(Self {
            kind: IdentityKind::Parented,
            type_tag: child_type.to_string(),
            local_id: local_id.to_string(),
            version: None,
            parent: Some(Box::new(root)),
            transient: false,
        })
    }

    fn key(&self) -> (&str, &str, Option<&Identity>) {
        (&self.type_tag, &self.local_id, self.parent.as_deref())
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}/{}:{}", parent, self.local_id, self.type_tag),
            None if self.transient => write!(f, "{}#~{}", self.type_tag, self.local_id),
            None => write!(f, "{}#{}", self.type_tag, self.local_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UserId;

    #[test]
    fn test_equality_ignores_version() {
        let actor = UserId::from("alice");
        let plain = Identity::root("Invoice", "1").unwrap();
        let stamped = plain.with_version(Some(VersionStamp::at(7, &actor)));

        assert_eq!(plain, stamped);
        assert_eq!(stamped.version().map(|v| v.sequence), Some(7));
    }

    #[test]
    fn test_parented_delegates_version_to_root() {
        let actor = UserId::from("alice");
        let root = Identity::root("Invoice", "1")
            .unwrap()
            .with_version(Some(VersionStamp::at(3, &actor)));
        let child = root.child("Address", "billing");

        assert!(child.is_parented());
        assert_eq!(child.root_identity(), &root);
        assert!(child.version().is_none());

        let stamped = child.with_version(Some(VersionStamp::at(4, &actor)));
        assert_eq!(stamped.version().map(|v| v.sequence), Some(4));
    }

    #[test]
    fn test_nested_child_keeps_root_as_parent() {
        let root = Identity::root("Invoice", "1").unwrap();
        let nested = root.child("Address", "billing").child("Geo", "location");

        assert_eq!(nested.parent(), Some(&root));
        assert_eq!(nested.local_id(), "billing.location");
    }

    #[test]
    fn test_display_and_parse() {
        let root = Identity::root("Invoice", "12").unwrap();
        let child = root.child("Line", "lines");

        assert_eq!(root.to_string(), "Invoice#12");
        assert_eq!(child.to_string(), "Invoice#12/lines:Line");
        assert_eq!(Identity::parse("Invoice#12").unwrap(), root);
        assert_eq!(Identity::parse("Invoice#12/lines:Line").unwrap(), child);
        assert!(Identity::parse("Invoice").is_err());
        assert!(Identity::parse("Invoice#~abc").is_err());
    }

    #[test]
    fn test_reparent_moves_children_of_transient_root() {
        let transient = Identity::transient("Invoice");
        let child = transient.child("Line", "lines");
        let persistent = Identity::root("Invoice", "1").unwrap();

        assert!(child.is_transient());
        let moved = child.reparent(&transient, &persistent).unwrap();
        assert_eq!(moved.parent(), Some(&persistent));
        assert!(!moved.is_transient());
        assert!(child.reparent(&persistent, &transient).is_none());
    }

    #[test]
    fn test_deserialize_validates_segments() {
        let stored = r#"{"kind":"Root","type_tag":"Invoice","local_id":"7"}"#;
        let identity: Identity = serde_json::from_str(stored).unwrap();
        assert_eq!(identity, Identity::root("Invoice", "7").unwrap());

        let child = Identity::root("Invoice", "7").unwrap().child("Line", "lines");
        let text = serde_json::to_string(&child).unwrap();
        assert_eq!(serde_json::from_str::<Identity>(&text).unwrap(), child);

        for bad in [
            r#"{"kind":"Root","type_tag":"Secret","local_id":"../../outside"}"#,
            r#"{"kind":"Root","type_tag":"a/b","local_id":"1"}"#,
            r#"{"kind":"Root","type_tag":"_services.json","local_id":"1"}"#,
            r#"{"kind":"Parented","type_tag":"Line","local_id":"lines"}"#,
            r#"{"kind":"Root","type_tag":"Line","local_id":"1","parent":{"kind":"Root","type_tag":"Invoice","local_id":"1"}}"#,
        ] {
            assert!(serde_json::from_str::<Identity>(bad).is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn test_type_tags_may_not_start_with_underscore() {
        assert!(matches!(
            Identity::root("_journal.json", "1"),
            Err(PersistError::InvalidIdentity(_))
        ));
        assert!(Identity::parse("_index#1").is_err());
        assert!(Identity::parse("Invoice#1/lines:_Line").is_err());
        assert!(Identity::root("Invoice", "_draft").is_ok());
    }
}
