use std::collections::HashMap;

use crate::core::{Identity, PersistError, Result};
use crate::object::SurrogateRef;

/// Session-scoped registry holding at most one surrogate per identity.
///
/// The map only re-keys entries; it never changes a surrogate's state.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<Identity, SurrogateRef>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, identity: &Identity) -> Option<SurrogateRef> {
        self.entries.get(identity).cloned()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Registers `surrogate` under its identity, or hands back the surrogate
    /// already registered there.
    pub fn intern(&mut self, surrogate: SurrogateRef) -> Result<SurrogateRef> {
        let identity = surrogate.identity().ok_or_else(|| {
            PersistError::TypeMismatch("value objects cannot be registered".to_string())
        })?;
        Ok(self
            .entries
            .entry(identity.without_version())
            .or_insert(surrogate)
            .clone())
    }

    /// Moves the entry for `old` to `new`, keeping the same surrogate.
    pub fn remap(&mut self, old: &Identity, new: &Identity) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.entries.contains_key(new) {
            return Err(PersistError::DuplicateIdentity(new.clone()));
        }
        let surrogate = self
            .entries
            .remove(old)
            .ok_or_else(|| PersistError::ObjectNotFound(old.clone()))?;
        self.entries.insert(new.without_version(), surrogate);
        Ok(())
    }

    /// Entries whose identity is parented under `root`.
    pub fn children_of(&self, root: &Identity) -> Vec<(Identity, SurrogateRef)> {
        self.entries
            .iter()
            .filter(|(identity, _)| identity.parent() == Some(root))
            .map(|(identity, surrogate)| (identity.clone(), surrogate.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entries.keys()
    }

    /// Empties the map, returning every surrogate it held.
    pub fn drain(&mut self) -> Vec<SurrogateRef> {
        self.entries.drain().map(|(_, surrogate)| surrogate).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ScalarType;
    use crate::metamodel::TypeSpec;
    use crate::object::NativeObject;

    fn ghost(type_tag: &str, id: &str) -> SurrogateRef {
        let spec = TypeSpec::new(type_tag).scalar("name", ScalarType::Text);
        let identity = Identity::root(type_tag, id).unwrap();
        SurrogateRef::ghost(NativeObject::blank(&spec, Some(&identity), false), identity)
    }

    #[test]
    fn test_intern_returns_existing_surrogate() {
        let mut map = IdentityMap::new();
        let first = map.intern(ghost("Invoice", "1")).unwrap();
        let second = map.intern(ghost("Invoice", "1")).unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(map.len(), 1);
        let looked_up = map.lookup(&Identity::root("Invoice", "1").unwrap()).unwrap();
        assert!(looked_up.ptr_eq(&first));
    }

    #[test]
    fn test_remap_keeps_surrogate_reference() {
        let mut map = IdentityMap::new();
        let surrogate = map.intern(ghost("Invoice", "1")).unwrap();
        let old = Identity::root("Invoice", "1").unwrap();
        let new = Identity::root("Invoice", "2").unwrap();

        map.remap(&old, &new).unwrap();
        assert!(map.lookup(&old).is_none());
        assert!(map.lookup(&new).unwrap().ptr_eq(&surrogate));
    }

    #[test]
    fn test_remap_refuses_to_overwrite() {
        let mut map = IdentityMap::new();
        map.intern(ghost("Invoice", "1")).unwrap();
        map.intern(ghost("Invoice", "2")).unwrap();
        let err = map
            .remap(
                &Identity::root("Invoice", "1").unwrap(),
                &Identity::root("Invoice", "2").unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, PersistError::DuplicateIdentity(_)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_value_objects_are_rejected() {
        let mut map = IdentityMap::new();
        let spec = TypeSpec::new("Money");
        let value = SurrogateRef::value(NativeObject::blank(&spec, None, true));
        assert!(map.intern(value).is_err());
    }
}
