//! Shape information consumed by the persistence core.
//!
//! The core never inspects native objects reflectively. A [`Metamodel`]
//! tells it, per type, which fields exist, which of them are persisted and
//! whether each one holds a scalar, a to-one reference, a to-many collection
//! or an embedded aggregate. [`TypeRegistry`] is the in-crate implementation.

pub mod codec;

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::identity::validate_type_tag;
use crate::core::{PersistError, Result, ScalarType};

pub use codec::{NULL_SENTINEL, ScalarCodec, ValueCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistability {
    Persistent,
    /// Instances live in memory only and never reach a record store.
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(ScalarType),
    Reference { target: String },
    Collection { element: String },
    Embedded { type_tag: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub id: String,
    pub kind: FieldKind,
    pub persisted: bool,
}

impl FieldDescriptor {
    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, FieldKind::Scalar(_))
    }
}

/// Field layout of one domain type.
#[derive(Debug, Clone)]
pub struct TypeSpec {
    type_tag: String,
    persistability: Persistability,
    fields: Vec<FieldDescriptor>,
}

impl TypeSpec {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            persistability: Persistability::Persistent,
            fields: Vec::new(),
        }
    }

    pub fn transient(mut self) -> Self {
        self.persistability = Persistability::Transient;
        self
    }

    pub fn scalar(self, id: &str, scalar_type: ScalarType) -> Self {
        self.field(id, FieldKind::Scalar(scalar_type), true)
    }

    /// Scalar that is held in memory but never written to a record.
    pub fn derived(self, id: &str, scalar_type: ScalarType) -> Self {
        self.field(id, FieldKind::Scalar(scalar_type), false)
    }

    pub fn reference(self, id: &str, target: &str) -> Self {
        self.field(
            id,
            FieldKind::Reference {
                target: target.to_string(),
            },
            true,
        )
    }

    pub fn collection(self, id: &str, element: &str) -> Self {
        self.field(
            id,
            FieldKind::Collection {
                element: element.to_string(),
            },
            true,
        )
    }

    pub fn embedded(self, id: &str, type_tag: &str) -> Self {
        self.field(
            id,
            FieldKind::Embedded {
                type_tag: type_tag.to_string(),
            },
            true,
        )
    }

    fn field(mut self, id: &str, kind: FieldKind, persisted: bool) -> Self {
        self.fields.push(FieldDescriptor {
            id: id.to_string(),
            kind,
            persisted,
        });
        self
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn persistability(&self) -> Persistability {
        self.persistability
    }

    pub fn is_persistent(&self) -> bool {
        self.persistability == Persistability::Persistent
    }

    /// All declared fields, in declaration order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn persisted_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.persisted)
    }

    pub fn field_descriptor(&self, id: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn require_field(&self, id: &str) -> Result<&FieldDescriptor> {
        self.field_descriptor(id)
            .ok_or_else(|| PersistError::UnknownField {
                type_tag: self.type_tag.clone(),
                field: id.to_string(),
            })
    }

    fn validate(&self) -> Result<()> {
        validate_type_tag(&self.type_tag)?;
        for (index, field) in self.fields.iter().enumerate() {
            let valid = !field.id.is_empty()
                && field
                    .id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(PersistError::InvalidIdentity(format!(
                    "field '{}' on '{}' must be an identifier",
                    field.id, self.type_tag
                )));
            }
            if self.fields[..index].iter().any(|f| f.id == field.id) {
                return Err(PersistError::InvalidIdentity(format!(
                    "field '{}' declared twice on '{}'",
                    field.id, self.type_tag
                )));
            }
        }
        Ok(())
    }
}

/// Capability interface of the metamodel collaborator.
pub trait Metamodel {
    fn type_spec(&self, type_tag: &str) -> Result<Arc<TypeSpec>>;
    fn codec(&self) -> &dyn ScalarCodec;
}

/// Metamodel built from explicitly registered [`TypeSpec`]s.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<TypeSpec>>,
    codec: ValueCodec,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: TypeSpec) -> Result<()> {
        spec.validate()?;
        if self.types.contains_key(spec.type_tag()) {
            return Err(PersistError::InvalidIdentity(format!(
                "type '{}' registered twice",
                spec.type_tag()
            )));
        }
        self.types.insert(spec.type_tag().to_string(), Arc::new(spec));
        Ok(())
    }

    pub fn with(mut self, spec: TypeSpec) -> Result<Self> {
        self.register(spec)?;
        Ok(self)
    }

    pub fn type_tags(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

impl Metamodel for TypeRegistry {
    fn type_spec(&self, type_tag: &str) -> Result<Arc<TypeSpec>> {
        self.types
            .get(type_tag)
            .cloned()
            .ok_or_else(|| PersistError::UnknownType(type_tag.to_string()))
    }

    fn codec(&self) -> &dyn ScalarCodec {
        &self.codec
    }
}
