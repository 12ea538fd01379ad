use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{PersistError, Result};
use crate::metamodel::NULL_SENTINEL;
use crate::storage::{FieldValue, ObjectRecord, PatternCache};

pub type RecordPredicate = Arc<dyn Fn(&ObjectRecord) -> bool>;

/// Filter applied by `RecordStore::scan` to records of one type.
#[derive(Clone)]
pub enum Query {
    All,
    /// Every listed field must be stored with exactly this value.
    Pattern(BTreeMap<String, FieldValue>),
    /// SQL LIKE against the text of one scalar field.
    FieldLike {
        field: String,
        pattern: String,
        case_sensitive: bool,
    },
    /// Caller-supplied test over the stored record.
    Predicate(RecordPredicate),
    /// Repository-defined query; the built-in stores cannot run these.
    Named {
        name: String,
        parameters: BTreeMap<String, String>,
    },
}

impl Query {
    pub fn like(field: &str, pattern: &str) -> Self {
        Query::FieldLike {
            field: field.to_string(),
            pattern: pattern.to_string(),
            case_sensitive: true,
        }
    }

    pub fn predicate(test: impl Fn(&ObjectRecord) -> bool + 'static) -> Self {
        Query::Predicate(Arc::new(test))
    }

    /// Rejects queries that the built-in stores cannot interpret.
    pub fn validate(&self) -> Result<()> {
        match self {
            Query::Named { name, .. } => Err(PersistError::UnsupportedQuery(format!(
                "named query '{}' needs a repository-backed store",
                name
            ))),
            _ => Ok(()),
        }
    }

    pub fn matches(&self, record: &ObjectRecord, patterns: &PatternCache) -> Result<bool> {
        match self {
            Query::All => Ok(true),
            Query::Pattern(expected) => Ok(expected
                .iter()
                .all(|(field, value)| record.fields.get(field) == Some(value))),
            Query::FieldLike {
                field,
                pattern,
                case_sensitive,
            } => match record.fields.get(field) {
                None => Ok(false),
                Some(FieldValue::Scalar(encoded)) if encoded == NULL_SENTINEL => Ok(false),
                Some(FieldValue::Scalar(encoded)) => {
                    let text = encoded.strip_prefix('\\').unwrap_or(encoded);
                    patterns.is_match(text, pattern, *case_sensitive)
                }
                Some(_) => Err(PersistError::UnsupportedQuery(format!(
                    "LIKE on non-scalar field '{}'",
                    field
                ))),
            },
            Query::Predicate(test) => Ok(test(record)),
            Query::Named { .. } => self.validate().map(|_| false),
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::All => write!(f, "All"),
            Query::Pattern(fields) => f.debug_tuple("Pattern").field(fields).finish(),
            Query::FieldLike {
                field,
                pattern,
                case_sensitive,
            } => f
                .debug_struct("FieldLike")
                .field("field", field)
                .field("pattern", pattern)
                .field("case_sensitive", case_sensitive)
                .finish(),
            Query::Predicate(_) => write!(f, "Predicate(..)"),
            Query::Named { name, parameters } => f
                .debug_struct("Named")
                .field("name", name)
                .field("parameters", parameters)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Identity;

    fn invoice(number: &str) -> ObjectRecord {
        ObjectRecord::new("Invoice")
            .with_field("number", FieldValue::Scalar(number.into()))
            .with_field(
                "customer",
                FieldValue::Reference(Identity::root("Customer", "1").unwrap()),
            )
    }

    #[test]
    fn test_pattern_requires_all_fields() {
        let patterns = PatternCache::default();
        let mut fields = BTreeMap::new();
        fields.insert("number".to_string(), FieldValue::Scalar("A-1".into()));
        let query = Query::Pattern(fields.clone());
        assert!(query.matches(&invoice("A-1"), &patterns).unwrap());
        assert!(!query.matches(&invoice("A-2"), &patterns).unwrap());

        fields.insert(
            "customer".to_string(),
            FieldValue::Reference(Identity::root("Customer", "2").unwrap()),
        );
        assert!(!Query::Pattern(fields).matches(&invoice("A-1"), &patterns).unwrap());
    }

    #[test]
    fn test_like_reads_unescaped_text() {
        let patterns = PatternCache::default();
        assert!(Query::like("number", "NULL%").matches(&invoice("\\NULL-ish"), &patterns).unwrap());
        assert!(!Query::like("number", "%").matches(&invoice(NULL_SENTINEL), &patterns).unwrap());
        assert!(!Query::like("missing", "%").matches(&invoice("x"), &patterns).unwrap());
    }

    #[test]
    fn test_unsupported_queries() {
        let patterns = PatternCache::default();
        let err = Query::like("customer", "%").matches(&invoice("x"), &patterns).unwrap_err();
        assert!(matches!(err, PersistError::UnsupportedQuery(_)));

        let named = Query::Named {
            name: "overdue".into(),
            parameters: BTreeMap::new(),
        };
        assert!(matches!(named.validate(), Err(PersistError::UnsupportedQuery(_))));
    }
}
