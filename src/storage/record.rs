// ============================================================================
// Record Model
// ============================================================================
//
// The flattened form of objects as record stores see them. Scalars are
// already encoded by the metamodel codec; references are identities.
//
// ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{Identity, Result, VersionStamp};

/// One stored field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    /// Codec-encoded scalar.
    Scalar(String),
    /// To-one reference.
    Reference(Identity),
    /// Ordered to-many reference vector.
    References(Vec<Identity>),
    /// Aggregated sub-object stored inline in its root's record.
    Embedded(EmbeddedRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedRecord {
    pub type_tag: String,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Record of one root object. `version` is set on every stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub type_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionStamp>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl ObjectRecord {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            version: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, id: &str, value: FieldValue) -> Self {
        self.fields.insert(id.to_string(), value);
        self
    }

    pub fn scalar(&self, id: &str) -> Option<&str> {
        match self.fields.get(id) {
            Some(FieldValue::Scalar(encoded)) => Some(encoded),
            _ => None,
        }
    }

    /// Field addressed by a dotted path through embedded records, as used in
    /// the local id of parented identities (`billing.tags`).
    pub fn field_at_path(&self, path: &str) -> Option<&FieldValue> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            match current {
                FieldValue::Embedded(embedded) => current = embedded.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Every identity this record points at, in field order.
    pub fn referenced_identities(&self) -> Vec<&Identity> {
        fn collect<'a>(fields: &'a BTreeMap<String, FieldValue>, out: &mut Vec<&'a Identity>) {
            for value in fields.values() {
                match value {
                    FieldValue::Scalar(_) => {}
                    FieldValue::Reference(target) => out.push(target),
                    FieldValue::References(targets) => out.extend(targets.iter()),
                    FieldValue::Embedded(embedded) => collect(&embedded.fields, out),
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.fields, &mut out);
        out
    }

    /// Text form written by the file store.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Ordered element identities of a to-many field, loaded on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub element_identities: Vec<Identity>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Object(ObjectRecord),
    Collection(CollectionRecord),
}

impl Record {
    pub fn into_object(self) -> Option<ObjectRecord> {
        match self {
            Record::Object(record) => Some(record),
            Record::Collection(_) => None,
        }
    }

    pub fn into_collection(self) -> Option<CollectionRecord> {
        match self {
            Record::Collection(record) => Some(record),
            Record::Object(_) => None,
        }
    }
}

/// Store-level form of a queued command, with the object already flattened.
#[derive(Debug, Clone)]
pub enum RecordWrite {
    /// Inserts a new root. With no identity the store allocates one.
    Create {
        type_tag: String,
        identity: Option<Identity>,
        record: ObjectRecord,
    },
    /// Replaces a root record after checking `expected` against the stored stamp.
    Update {
        identity: Identity,
        expected: Option<VersionStamp>,
        record: ObjectRecord,
    },
    Destroy { identity: Identity },
}

impl RecordWrite {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            RecordWrite::Create { identity, .. } => identity.as_ref(),
            RecordWrite::Update { identity, .. } | RecordWrite::Destroy { identity } => {
                Some(identity)
            }
        }
    }
}

/// Outcome of one write, in the order the writes were given.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedWrite {
    Created { identity: Identity, version: VersionStamp },
    Updated { identity: Identity, version: VersionStamp },
    Destroyed { identity: Identity },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UserId;

    fn sample() -> ObjectRecord {
        let customer = Identity::root("Customer", "7").unwrap();
        let line_a = Identity::root("Line", "1").unwrap();
        let line_b = Identity::root("Line", "2").unwrap();
        let mut address = BTreeMap::new();
        address.insert("city".to_string(), FieldValue::Scalar("Lisbon".into()));
        address.insert("tags".to_string(), FieldValue::References(vec![line_b.clone()]));

        let mut record = ObjectRecord::new("Invoice")
            .with_field("number", FieldValue::Scalar("INV-1".into()))
            .with_field("note", FieldValue::Scalar("NULL".into()))
            .with_field("customer", FieldValue::Reference(customer))
            .with_field("lines", FieldValue::References(vec![line_a, line_b]))
            .with_field(
                "billing",
                FieldValue::Embedded(EmbeddedRecord {
                    type_tag: "Address".into(),
                    fields: address,
                }),
            );
        record.version = Some(VersionStamp::at(4, &UserId::from("alice")));
        record
    }

    #[test]
    fn test_record_text_round_trip() {
        let record = sample();
        let decoded = ObjectRecord::decode(&record.encode().unwrap()).unwrap();

        assert_eq!(decoded, record);
        assert_eq!(decoded.version.as_ref().unwrap().changed_by, UserId::from("alice"));
        assert_eq!(decoded.version.unwrap().changed_at, record.version.unwrap().changed_at);
    }

    #[test]
    fn test_field_at_path_walks_embedded_records() {
        let record = sample();
        assert!(matches!(record.field_at_path("lines"), Some(FieldValue::References(v)) if v.len() == 2));
        assert!(matches!(record.field_at_path("billing.tags"), Some(FieldValue::References(v)) if v.len() == 1));
        assert!(record.field_at_path("billing.missing").is_none());
        assert!(record.field_at_path("number.x").is_none());
    }

    #[test]
    fn test_referenced_identities_include_embedded() {
        let record = sample();
        assert_eq!(record.referenced_identities().len(), 4);
    }
}
