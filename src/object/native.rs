use std::collections::BTreeMap;

use crate::core::{Identity, PersistError, Result, Value};
use crate::metamodel::{FieldKind, TypeSpec};
use crate::object::{MaterializationState, SurrogateRef};

/// To-many field of a native object. Carries its own materialization state
/// so that it can be loaded independently of the owner's scalars.
#[derive(Debug, Clone)]
pub struct CollectionHandle {
    identity: Option<Identity>,
    element_type: String,
    state: MaterializationState,
    elements: Vec<SurrogateRef>,
}

impl CollectionHandle {
    pub(crate) fn new(
        identity: Option<Identity>,
        element_type: &str,
        state: MaterializationState,
    ) -> Self {
        Self {
            identity,
            element_type: element_type.to_string(),
            state,
            elements: Vec::new(),
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn element_type(&self) -> &str {
        &self.element_type
    }

    pub fn state(&self) -> MaterializationState {
        self.state
    }

    pub fn elements(&self) -> &[SurrogateRef] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, element: &SurrogateRef) -> bool {
        self.elements.iter().any(|e| e.ptr_eq(element))
    }

    /// Installs loaded elements; only a ghost collection accepts them.
    pub(crate) fn install(&mut self, elements: Vec<SurrogateRef>) -> Result<()> {
        self.state = self.state.transition(MaterializationState::Resolving)?;
        self.elements = elements;
        self.state = self.state.transition(MaterializationState::Resolved)?;
        Ok(())
    }

    pub(crate) fn push(&mut self, element: SurrogateRef) -> Result<()> {
        self.require_loaded("add to")?;
        self.elements.push(element);
        Ok(())
    }

    pub(crate) fn remove(&mut self, element: &SurrogateRef) -> Result<bool> {
        self.require_loaded("remove from")?;
        let before = self.elements.len();
        self.elements.retain(|e| !e.ptr_eq(element));
        Ok(self.elements.len() != before)
    }

    pub(crate) fn reparent(&mut self, old_root: &Identity, new_root: &Identity) {
        if let Some(moved) = self
            .identity
            .as_ref()
            .and_then(|id| id.reparent(old_root, new_root))
        {
            self.identity = Some(moved);
        }
    }

    fn require_loaded(&self, operation: &str) -> Result<()> {
        if self.state == MaterializationState::Resolved {
            return Ok(());
        }
        Err(PersistError::TypeMismatch(format!(
            "cannot {} collection in state {}",
            operation, self.state
        )))
    }
}

#[derive(Debug, Clone)]
pub enum NativeValue {
    Scalar(Value),
    Reference(Option<SurrogateRef>),
    Collection(CollectionHandle),
    Embedded(Option<SurrogateRef>),
}

/// In-memory instance of a domain type. Owned exclusively by its surrogate.
#[derive(Debug, Clone)]
pub struct NativeObject {
    type_tag: String,
    fields: BTreeMap<String, NativeValue>,
}

impl NativeObject {
    /// Instance with every declared field empty. Collections start as ghosts
    /// unless `loaded` is set.
    pub(crate) fn blank(spec: &TypeSpec, identity: Option<&Identity>, loaded: bool) -> Self {
        let collection_state = if loaded {
            MaterializationState::Resolved
        } else {
            MaterializationState::Ghost
        };
        let fields = spec
            .fields()
            .iter()
            .map(|field| {
                let value = match &field.kind {
                    FieldKind::Scalar(_) => NativeValue::Scalar(Value::Null),
                    FieldKind::Reference { .. } => NativeValue::Reference(None),
                    FieldKind::Embedded { .. } => NativeValue::Embedded(None),
                    FieldKind::Collection { element } => NativeValue::Collection(
                        CollectionHandle::new(
                            identity.map(|id| id.child(element.as_str(), &field.id)),
                            element,
                            collection_state,
                        ),
                    ),
                };
                (field.id.clone(), value)
            })
            .collect();
        Self {
            type_tag: spec.type_tag().to_string(),
            fields,
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn get(&self, field: &str) -> Option<&NativeValue> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &NativeValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn scalar(&self, field: &str) -> Option<&Value> {
        match self.fields.get(field) {
            Some(NativeValue::Scalar(value)) => Some(value),
            _ => None,
        }
    }

    pub fn reference(&self, field: &str) -> Option<SurrogateRef> {
        match self.fields.get(field) {
            Some(NativeValue::Reference(target)) => target.clone(),
            _ => None,
        }
    }

    pub fn embedded(&self, field: &str) -> Option<SurrogateRef> {
        match self.fields.get(field) {
            Some(NativeValue::Embedded(child)) => child.clone(),
            _ => None,
        }
    }

    pub fn collection(&self, field: &str) -> Option<&CollectionHandle> {
        match self.fields.get(field) {
            Some(NativeValue::Collection(handle)) => Some(handle),
            _ => None,
        }
    }

    pub(crate) fn collection_mut(&mut self, field: &str) -> Option<&mut CollectionHandle> {
        match self.fields.get_mut(field) {
            Some(NativeValue::Collection(handle)) => Some(handle),
            _ => None,
        }
    }

    pub(crate) fn set(&mut self, field: &str, value: NativeValue) {
        self.fields.insert(field.to_string(), value);
    }

    pub(crate) fn reparent_collections(&mut self, old_root: &Identity, new_root: &Identity) {
        for value in self.fields.values_mut() {
            if let NativeValue::Collection(handle) = value {
                handle.reparent(old_root, new_root);
            }
        }
    }

    /// Drops every surrogate this object points at.
    pub(crate) fn release(&mut self) {
        for value in self.fields.values_mut() {
            match value {
                NativeValue::Reference(target) | NativeValue::Embedded(target) => *target = None,
                NativeValue::Collection(handle) => handle.elements.clear(),
                NativeValue::Scalar(_) => {}
            }
        }
    }
}
