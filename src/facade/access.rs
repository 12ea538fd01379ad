//! Field access on surrogates. Reads load ghosts on demand; writes are
//! bracketed by `Resolved -> Updating -> Resolved` on the lifecycle owner.

use crate::core::{Identity, PersistError, Result, Value};
use crate::facade::Session;
use crate::metamodel::{FieldDescriptor, FieldKind};
use crate::object::{MaterializationState, NativeObject, NativeValue, SurrogateRef};
use crate::storage::{CollectionRecord, Record};

fn kind_mismatch(descriptor: &FieldDescriptor, expected: &str) -> PersistError {
    PersistError::TypeMismatch(format!(
        "field '{}' is not a {} field",
        descriptor.id, expected
    ))
}

impl Session {
    fn descriptor(&mut self, surrogate: &SurrogateRef, field: &str) -> Result<FieldDescriptor> {
        let spec = self.type_spec(&surrogate.type_tag())?;
        spec.require_field(field).cloned()
    }

    fn prepare_read(&mut self, surrogate: &SurrogateRef, field: &str) -> Result<FieldDescriptor> {
        self.require_open()?;
        surrogate.require_live("read")?;
        let descriptor = self.descriptor(surrogate, field)?;
        self.ensure_resolved(surrogate)?;
        Ok(descriptor)
    }

    pub fn field(&mut self, surrogate: &SurrogateRef, field: &str) -> Result<Value> {
        let descriptor = self.prepare_read(surrogate, field)?;
        if !descriptor.is_scalar() {
            return Err(kind_mismatch(&descriptor, "scalar"));
        }
        Ok(surrogate
            .native()
            .scalar(field)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Target of a to-one field. The target comes back as a ghost or, if its
    /// record is gone, as a destroyed surrogate.
    pub fn reference(&mut self, surrogate: &SurrogateRef, field: &str) -> Result<Option<SurrogateRef>> {
        let descriptor = self.prepare_read(surrogate, field)?;
        if !matches!(descriptor.kind, FieldKind::Reference { .. }) {
            return Err(kind_mismatch(&descriptor, "reference"));
        }
        Ok(surrogate.native().reference(field))
    }

    pub fn embedded(&mut self, surrogate: &SurrogateRef, field: &str) -> Result<Option<SurrogateRef>> {
        let descriptor = self.prepare_read(surrogate, field)?;
        if !matches!(descriptor.kind, FieldKind::Embedded { .. }) {
            return Err(kind_mismatch(&descriptor, "embedded"));
        }
        Ok(surrogate.native().embedded(field))
    }

    /// Elements of a to-many field. Only the collection is loaded; a ghost
    /// owner stays a ghost.
    pub fn collection(&mut self, surrogate: &SurrogateRef, field: &str) -> Result<Vec<SurrogateRef>> {
        self.require_open()?;
        surrogate.require_live("read")?;
        let descriptor = self.descriptor(surrogate, field)?;
        if !matches!(descriptor.kind, FieldKind::Collection { .. }) {
            return Err(kind_mismatch(&descriptor, "collection"));
        }

        let (state, identity) = {
            let native = surrogate.native();
            let handle = native
                .collection(field)
                .ok_or_else(|| kind_mismatch(&descriptor, "collection"))?;
            (handle.state(), handle.identity().cloned())
        };
        if state.is_ghost() {
            let identity = identity.ok_or_else(|| {
                PersistError::TypeMismatch("value objects have no stored collections".to_string())
            })?;
            let record = self.load_collection(&identity)?;
            let mut ctx = self.context();
            let outcome = surrogate.materialize_collection(field, &record, &mut ctx)?;
            self.note_dangling(outcome);
        }

        let native = surrogate.native();
        Ok(native
            .collection(field)
            .map(|handle| handle.elements().to_vec())
            .unwrap_or_default())
    }

    fn load_collection(&self, identity: &Identity) -> Result<CollectionRecord> {
        match self.store.load(identity)? {
            Some(Record::Collection(record)) => Ok(record),
            Some(Record::Object(_)) => Err(PersistError::TypeMismatch(format!(
                "{} is not a collection",
                identity
            ))),
            // A root written before the field existed holds no vector yet.
            None if self.store.exists(identity.root_identity())? => Ok(CollectionRecord {
                element_identities: Vec::new(),
            }),
            None => Err(PersistError::ObjectNotFound(identity.root_identity().clone())),
        }
    }

    /// Runs `change` against the surrogate's native object inside an update
    /// bracket on its lifecycle owner.
    fn mutate<T>(
        &mut self,
        surrogate: &SurrogateRef,
        operation: &'static str,
        change: impl FnOnce(&mut NativeObject) -> Result<T>,
    ) -> Result<T> {
        self.require_open()?;
        surrogate.require_live(operation)?;
        self.ensure_resolved(surrogate)?;
        let owner = surrogate.lifecycle_owner();
        let bracketed = owner.state() == MaterializationState::Resolved && !owner.is_value();
        if bracketed {
            owner.transition(MaterializationState::Updating)?;
        }
        let result = change(&mut surrogate.native_mut());
        if bracketed {
            owner.transition(MaterializationState::Resolved)?;
        }
        result
    }

    pub fn set_field(&mut self, surrogate: &SurrogateRef, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let descriptor = self.descriptor(surrogate, field)?;
        let FieldKind::Scalar(scalar_type) = descriptor.kind else {
            return Err(kind_mismatch(&descriptor, "scalar"));
        };
        if !scalar_type.is_compatible(&value) {
            return Err(PersistError::TypeMismatch(format!(
                "field '{}' holds {}, not {}",
                field,
                scalar_type,
                value.type_name()
            )));
        }
        self.mutate(surrogate, "update", |native| {
            native.set(field, NativeValue::Scalar(value));
            Ok(())
        })
    }

    pub fn set_reference(
        &mut self,
        surrogate: &SurrogateRef,
        field: &str,
        target: Option<&SurrogateRef>,
    ) -> Result<()> {
        let descriptor = self.descriptor(surrogate, field)?;
        let FieldKind::Reference { target: target_type } = &descriptor.kind else {
            return Err(kind_mismatch(&descriptor, "reference"));
        };
        if let Some(target) = target {
            check_element(target, target_type, field)?;
        }
        let target = target.cloned();
        self.mutate(surrogate, "update", |native| {
            native.set(field, NativeValue::Reference(target));
            Ok(())
        })
    }

    /// Sub-object stored in `field`, created empty if the field is unset.
    pub fn embed(&mut self, surrogate: &SurrogateRef, field: &str) -> Result<SurrogateRef> {
        let descriptor = self.descriptor(surrogate, field)?;
        let FieldKind::Embedded { type_tag } = &descriptor.kind else {
            return Err(kind_mismatch(&descriptor, "embedded"));
        };
        if let Some(existing) = self.embedded(surrogate, field)? {
            return Ok(existing);
        }

        let spec = self.type_spec(type_tag)?;
        let child = match surrogate.identity() {
            Some(owner) => {
                let identity = owner.child(type_tag.as_str(), field);
                let native = NativeObject::blank(&spec, Some(&identity), true);
                let root = surrogate.lifecycle_owner();
                self.identity_map
                    .intern(SurrogateRef::parented(native, identity, &root))?
            }
            None => SurrogateRef::value(NativeObject::blank(&spec, None, true)),
        };
        let installed = child.clone();
        self.mutate(surrogate, "update", |native| {
            native.set(field, NativeValue::Embedded(Some(installed)));
            Ok(())
        })?;
        Ok(child)
    }

    pub fn add_to_collection(
        &mut self,
        surrogate: &SurrogateRef,
        field: &str,
        element: &SurrogateRef,
    ) -> Result<()> {
        let descriptor = self.descriptor(surrogate, field)?;
        let FieldKind::Collection { element: element_type } = &descriptor.kind else {
            return Err(kind_mismatch(&descriptor, "collection"));
        };
        check_element(element, element_type, field)?;
        self.collection(surrogate, field)?;
        let element = element.clone();
        self.mutate(surrogate, "update", |native| match native.collection_mut(field) {
            Some(handle) => handle.push(element),
            None => Ok(()),
        })
    }

    /// Returns whether the element was present.
    pub fn remove_from_collection(
        &mut self,
        surrogate: &SurrogateRef,
        field: &str,
        element: &SurrogateRef,
    ) -> Result<bool> {
        let descriptor = self.descriptor(surrogate, field)?;
        if !matches!(descriptor.kind, FieldKind::Collection { .. }) {
            return Err(kind_mismatch(&descriptor, "collection"));
        }
        self.collection(surrogate, field)?;
        self.mutate(surrogate, "update", |native| match native.collection_mut(field) {
            Some(handle) => handle.remove(element),
            None => Ok(false),
        })
    }
}

/// References and collection elements must be roots of the declared type.
fn check_element(target: &SurrogateRef, expected_type: &str, field: &str) -> Result<()> {
    if target.type_tag() != expected_type {
        return Err(PersistError::TypeMismatch(format!(
            "field '{}' holds {}, not {}",
            field,
            expected_type,
            target.type_tag()
        )));
    }
    if target.is_value() || target.is_parented() {
        return Err(PersistError::TypeMismatch(format!(
            "field '{}' can only point at root objects",
            field
        )));
    }
    Ok(())
}
