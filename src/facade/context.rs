use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Identity, Result};
use crate::metamodel::{Metamodel, ScalarCodec, TypeSpec};
use crate::object::{IdentityMap, NativeObject, ObjectContext, SurrogateRef};
use crate::storage::RecordStore;

/// Per-type shapes resolved once from the metamodel.
#[derive(Default)]
pub(crate) struct SpecCache {
    specs: HashMap<String, Arc<TypeSpec>>,
}

impl SpecCache {
    pub(crate) fn get(&mut self, metamodel: &dyn Metamodel, type_tag: &str) -> Result<Arc<TypeSpec>> {
        if let Some(spec) = self.specs.get(type_tag) {
            return Ok(Arc::clone(spec));
        }
        let spec = metamodel.type_spec(type_tag)?;
        self.specs.insert(type_tag.to_string(), Arc::clone(&spec));
        Ok(spec)
    }
}

/// Borrowed view of a session handed to surrogates while they load or
/// flatten.
pub(crate) struct SessionContext<'a> {
    pub(crate) store: &'a dyn RecordStore,
    pub(crate) metamodel: &'a dyn Metamodel,
    pub(crate) specs: &'a mut SpecCache,
    pub(crate) identity_map: &'a mut IdentityMap,
    /// Persistent identities reserved for objects created in the batch
    /// being flattened.
    pub(crate) pending: Option<&'a HashMap<Identity, Identity>>,
}

impl ObjectContext for SessionContext<'_> {
    fn type_spec(&mut self, type_tag: &str) -> Result<Arc<TypeSpec>> {
        self.specs.get(self.metamodel, type_tag)
    }

    fn codec(&self) -> &dyn ScalarCodec {
        self.metamodel.codec()
    }

    fn ghost(&mut self, identity: &Identity) -> Result<SurrogateRef> {
        if let Some(existing) = self.identity_map.lookup(identity) {
            return Ok(existing);
        }
        let spec = self.type_spec(identity.type_tag())?;
        let identity = identity.without_version();
        let native = NativeObject::blank(&spec, Some(&identity), false);
        self.identity_map.intern(SurrogateRef::ghost(native, identity))
    }

    fn embedded(&mut self, identity: &Identity, root: &SurrogateRef) -> Result<SurrogateRef> {
        if let Some(existing) = self.identity_map.lookup(identity) {
            return Ok(existing);
        }
        let spec = self.type_spec(identity.type_tag())?;
        let native = NativeObject::blank(&spec, Some(identity), false);
        self.identity_map
            .intern(SurrogateRef::parented(native, identity.without_version(), root))
    }

    fn record_exists(&self, identity: &Identity) -> Result<bool> {
        self.store.exists(identity)
    }

    fn stored_identity(&self, identity: &Identity) -> Identity {
        self.pending
            .and_then(|pending| pending.get(identity))
            .unwrap_or(identity)
            .without_version()
    }
}
