// ============================================================================
// Record Store Contract
// ============================================================================
//
// Keyed durable storage for root records. Both realizations share the write
// staging below, so optimistic checks and identity assignment behave the same
// whether records live on disk or in memory.
//
// ============================================================================

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::core::{Identity, PersistError, Result, UserId, VersionStamp};
use crate::storage::{AppliedWrite, CollectionRecord, FieldValue, ObjectRecord, Query, Record, RecordWrite};

/// A root record together with the identity it is stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub identity: Identity,
    pub record: ObjectRecord,
}

/// Lazy, finite, non-restartable sequence produced by `RecordStore::scan`.
pub type RecordScan<'a> = Box<dyn Iterator<Item = Result<StoredRecord>> + 'a>;

pub trait RecordStore {
    /// Record stored for `identity`. Parented identities resolve inside their
    /// root's record: collections come back as `Record::Collection`, embedded
    /// objects as `Record::Object` without a version.
    fn load(&self, identity: &Identity) -> Result<Option<Record>>;

    fn exists(&self, identity: &Identity) -> Result<bool> {
        Ok(self.load(identity)?.is_some())
    }

    /// Records of `type_tag` accepted by `query`, in store order.
    fn scan<'a>(&'a self, type_tag: &str, query: &'a Query) -> Result<RecordScan<'a>>;

    fn count(&self, type_tag: &str) -> Result<usize>;

    /// Reserves a fresh persistent root identity. Reserved ids are never
    /// handed out twice, even if nothing is ever stored under them.
    fn allocate_identity(&mut self, type_tag: &str) -> Result<Identity>;

    /// Applies every write in order, or none of them.
    fn apply(&mut self, writes: Vec<RecordWrite>, actor: &UserId) -> Result<Vec<AppliedWrite>>;

    /// Binds `name` to `identity`, returning the previous binding.
    fn register_service(&mut self, name: &str, identity: &Identity) -> Result<Option<Identity>>;

    fn lookup_service(&self, name: &str) -> Result<Option<Identity>>;

    fn services(&self) -> Result<BTreeMap<String, Identity>>;

    /// Type tags that currently have at least one record.
    fn type_tags(&self) -> Result<Vec<String>>;
}

/// Resolves a parented identity against its root's record.
pub(crate) fn load_parented(root: &ObjectRecord, identity: &Identity) -> Option<Record> {
    match root.field_at_path(identity.local_id())? {
        FieldValue::References(targets) => Some(Record::Collection(CollectionRecord {
            element_identities: targets.clone(),
        })),
        FieldValue::Embedded(embedded) if embedded.type_tag == identity.type_tag() => {
            Some(Record::Object(ObjectRecord {
                type_tag: embedded.type_tag.clone(),
                version: None,
                fields: embedded.fields.clone(),
            }))
        }
        _ => None,
    }
}

/// Numeric local ids at or above the allocation counter must push it forward.
pub(crate) fn next_id_after(current: u64, local_id: &str) -> u64 {
    match local_id.parse::<u64>() {
        Ok(n) if n >= current => n + 1,
        _ => current,
    }
}

/// Outcome of staging a batch against the current store contents.
#[derive(Debug, Default)]
pub(crate) struct StagedBatch {
    pub applied: Vec<AppliedWrite>,
    /// Final image per touched identity; `None` means removed.
    pub images: BTreeMap<Identity, Option<ObjectRecord>>,
    /// Roots new in this batch, in creation order.
    pub created: Vec<Identity>,
    /// Pre-existing roots removed by this batch.
    pub destroyed: Vec<Identity>,
}

impl StagedBatch {
    fn current(
        &self,
        identity: &Identity,
        stored: &mut impl FnMut(&Identity) -> Result<Option<ObjectRecord>>,
    ) -> Result<Option<ObjectRecord>> {
        match self.images.get(identity) {
            Some(image) => Ok(image.clone()),
            None => stored(identity),
        }
    }

    /// Type tags whose index changes with this batch.
    pub fn touched_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .images
            .keys()
            .map(|identity| identity.type_tag().to_string())
            .collect();
        tags.dedup();
        tags
    }
}

fn require_root(identity: &Identity) -> Result<()> {
    if identity.is_parented() {
        return Err(PersistError::StoreError(format!(
            "{} is not a root identity; write its aggregate root instead",
            identity
        )));
    }
    if identity.is_transient() {
        return Err(PersistError::StoreError(format!(
            "{} has no persistent identity yet",
            identity
        )));
    }
    Ok(())
}

fn require_type(identity: &Identity, record: &ObjectRecord) -> Result<()> {
    if identity.type_tag() != record.type_tag {
        return Err(PersistError::TypeMismatch(format!(
            "record of type '{}' cannot be stored under {}",
            record.type_tag, identity
        )));
    }
    Ok(())
}

/// Runs every check a batch needs and computes the resulting images without
/// touching the store. Later writes see the effect of earlier ones.
pub(crate) fn stage_writes(
    writes: Vec<RecordWrite>,
    actor: &UserId,
    mut stored: impl FnMut(&Identity) -> Result<Option<ObjectRecord>>,
    mut allocate: impl FnMut(&str) -> Result<Identity>,
) -> Result<StagedBatch> {
    let mut batch = StagedBatch::default();
    let mut existed: HashMap<Identity, bool> = HashMap::new();

    for write in writes {
        match write {
            RecordWrite::Create {
                type_tag,
                identity,
                mut record,
            } => {
                let identity = match identity {
                    Some(identity) => identity.without_version(),
                    None => allocate(&type_tag)?,
                };
                require_root(&identity)?;
                require_type(&identity, &record)?;
                let previous = batch.current(&identity, &mut stored)?;
                existed
                    .entry(identity.clone())
                    .or_insert_with(|| previous.is_some());
                if previous.is_some() {
                    return Err(PersistError::DuplicateIdentity(identity));
                }

                let version = VersionStamp::initial(actor);
                record.version = Some(version.clone());
                batch.images.insert(identity.clone(), Some(record));
                batch.destroyed.retain(|d| d != &identity);
                if !existed.get(&identity).copied().unwrap_or(false) {
                    batch.created.push(identity.clone());
                }
                batch.applied.push(AppliedWrite::Created { identity, version });
            }
            RecordWrite::Update {
                identity,
                expected,
                mut record,
            } => {
                let identity = identity.without_version();
                require_root(&identity)?;
                require_type(&identity, &record)?;
                let previous = batch
                    .current(&identity, &mut stored)?
                    .ok_or_else(|| PersistError::ObjectNotFound(identity.clone()))?;
                existed.entry(identity.clone()).or_insert(true);

                let version = match (&expected, &previous.version) {
                    (Some(expected), Some(found)) if expected.differs(found) => {
                        warn!(
                            identity = %identity,
                            expected = expected.sequence,
                            found = found.sequence,
                            changed_by = %found.changed_by,
                            "version conflict"
                        );
                        return Err(PersistError::ConcurrencyConflict {
                            actor: found.changed_by.clone(),
                            identity,
                            expected: expected.sequence,
                            found: found.sequence,
                        });
                    }
                    (_, Some(found)) => found.next(actor),
                    (_, None) => VersionStamp::initial(actor),
                };
                record.version = Some(version.clone());
                batch.images.insert(identity.clone(), Some(record));
                batch.applied.push(AppliedWrite::Updated { identity, version });
            }
            RecordWrite::Destroy { identity } => {
                let identity = identity.without_version();
                require_root(&identity)?;
                if batch.current(&identity, &mut stored)?.is_none() {
                    return Err(PersistError::ObjectNotFound(identity));
                }
                let was_stored = *existed.entry(identity.clone()).or_insert(true);
                batch.images.insert(identity.clone(), None);
                if was_stored {
                    batch.destroyed.push(identity.clone());
                }
                batch.created.retain(|c| c != &identity);
                batch.applied.push(AppliedWrite::Destroyed { identity });
            }
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EmbeddedRecord;

    fn invoice(number: &str) -> ObjectRecord {
        ObjectRecord::new("Invoice").with_field("number", FieldValue::Scalar(number.into()))
    }

    fn stored_at(sequence: u64) -> ObjectRecord {
        let mut record = invoice("A-1");
        record.version = Some(VersionStamp::at(sequence, &UserId::from("bob")));
        record
    }

    fn counter() -> impl FnMut(&str) -> Result<Identity> {
        let mut next = 10;
        move |type_tag| {
            next += 1;
            Identity::root(type_tag, next.to_string())
        }
    }

    #[test]
    fn test_create_allocates_and_stamps_initial_version() {
        let batch = stage_writes(
            vec![RecordWrite::Create {
                type_tag: "Invoice".into(),
                identity: None,
                record: invoice("A-1"),
            }],
            &UserId::from("alice"),
            |_| Ok(None),
            counter(),
        )
        .unwrap();

        let identity = Identity::root("Invoice", "11").unwrap();
        assert_eq!(batch.created, vec![identity.clone()]);
        let image = batch.images[&identity].as_ref().unwrap();
        assert_eq!(image.version.as_ref().unwrap().sequence, 0);
        assert!(matches!(&batch.applied[0], AppliedWrite::Created { version, .. } if version.changed_by == UserId::from("alice")));
    }

    #[test]
    fn test_update_checks_version() {
        let identity = Identity::root("Invoice", "1").unwrap();
        let actor = UserId::from("alice");

        let ok = stage_writes(
            vec![RecordWrite::Update {
                identity: identity.clone(),
                expected: Some(VersionStamp::at(2, &actor)),
                record: invoice("A-2"),
            }],
            &actor,
            |_| Ok(Some(stored_at(2))),
            counter(),
        )
        .unwrap();
        assert!(matches!(&ok.applied[0], AppliedWrite::Updated { version, .. } if version.sequence == 3));

        let err = stage_writes(
            vec![RecordWrite::Update {
                identity: identity.clone(),
                expected: Some(VersionStamp::at(2, &actor)),
                record: invoice("A-2"),
            }],
            &actor,
            |_| Ok(Some(stored_at(3))),
            counter(),
        )
        .unwrap_err();
        match err {
            PersistError::ConcurrencyConflict {
                actor,
                expected,
                found,
                ..
            } => {
                assert_eq!((expected, found), (2, 3));
                assert_eq!(actor, UserId::from("bob"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_later_writes_see_earlier_ones() {
        let identity = Identity::root("Invoice", "5").unwrap();
        let batch = stage_writes(
            vec![
                RecordWrite::Create {
                    type_tag: "Invoice".into(),
                    identity: Some(identity.clone()),
                    record: invoice("A-1"),
                },
                RecordWrite::Update {
                    identity: identity.clone(),
                    expected: Some(VersionStamp::at(0, &UserId::default())),
                    record: invoice("A-2"),
                },
                RecordWrite::Destroy {
                    identity: identity.clone(),
                },
            ],
            &UserId::default(),
            |_| Ok(None),
            counter(),
        )
        .unwrap();

        assert!(batch.created.is_empty());
        assert!(batch.destroyed.is_empty());
        assert_eq!(batch.images[&identity], None);
        assert_eq!(batch.applied.len(), 3);
    }

    #[test]
    fn test_missing_and_duplicate_targets() {
        let identity = Identity::root("Invoice", "1").unwrap();
        let missing = stage_writes(
            vec![RecordWrite::Destroy {
                identity: identity.clone(),
            }],
            &UserId::default(),
            |_| Ok(None),
            counter(),
        )
        .unwrap_err();
        assert!(matches!(missing, PersistError::ObjectNotFound(_)));

        let duplicate = stage_writes(
            vec![RecordWrite::Create {
                type_tag: "Invoice".into(),
                identity: Some(identity),
                record: invoice("A-1"),
            }],
            &UserId::default(),
            |_| Ok(Some(stored_at(0))),
            counter(),
        )
        .unwrap_err();
        assert!(matches!(duplicate, PersistError::DuplicateIdentity(_)));
    }

    #[test]
    fn test_parented_writes_are_rejected() {
        let child = Identity::root("Invoice", "1").unwrap().child("Address", "billing");
        let err = stage_writes(
            vec![RecordWrite::Destroy { identity: child }],
            &UserId::default(),
            |_| Ok(None),
            counter(),
        )
        .unwrap_err();
        assert!(matches!(err, PersistError::StoreError(_)));
    }

    #[test]
    fn test_load_parented_reads_inside_root() {
        let line = Identity::root("Line", "1").unwrap();
        let root_id = Identity::root("Invoice", "1").unwrap();
        let record = invoice("A-1")
            .with_field("lines", FieldValue::References(vec![line.clone()]))
            .with_field(
                "billing",
                FieldValue::Embedded(EmbeddedRecord {
                    type_tag: "Address".into(),
                    fields: BTreeMap::new(),
                }),
            );

        let lines = load_parented(&record, &root_id.child("Line", "lines")).unwrap();
        assert_eq!(lines.into_collection().unwrap().element_identities, vec![line]);
        let billing = load_parented(&record, &root_id.child("Address", "billing")).unwrap();
        assert_eq!(billing.into_object().unwrap().type_tag, "Address");
        assert!(load_parented(&record, &root_id.child("Address", "shipping")).is_none());
    }

    #[test]
    fn test_next_id_after() {
        assert_eq!(next_id_after(1, "7"), 8);
        assert_eq!(next_id_after(9, "7"), 9);
        assert_eq!(next_id_after(3, "abc"), 3);
    }
}
