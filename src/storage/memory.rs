use im::{OrdMap, Vector};
use std::collections::BTreeMap;
use tracing::{Level, event, info_span};

use crate::core::{Identity, PersistError, Result, UserId};
use crate::storage::engine::{load_parented, next_id_after, stage_writes};
use crate::storage::{
    AppliedWrite, ObjectRecord, PatternCache, Query, Record, RecordScan, RecordStore, RecordWrite,
    StoredRecord,
};

#[derive(Debug, Clone)]
struct TypeTable {
    next_id: u64,
    order: Vector<String>,
    records: OrdMap<String, ObjectRecord>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self {
            next_id: 1,
            order: Vector::new(),
            records: OrdMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StoreSnapshot {
    types: OrdMap<String, TypeTable>,
    services: OrdMap<String, Identity>,
}

impl StoreSnapshot {
    fn record(&self, identity: &Identity) -> Option<&ObjectRecord> {
        if identity.is_transient() {
            return None;
        }
        self.types
            .get(identity.type_tag())?
            .records
            .get(identity.local_id())
    }

    fn table_mut(&mut self, type_tag: &str) -> &mut TypeTable {
        self.types.entry(type_tag.to_string()).or_insert_with(TypeTable::default)
    }
}

/// Record store kept entirely in memory.
///
/// A batch is applied to a clone of the current snapshot and swapped in only
/// when every write succeeded. Cloning is cheap because the maps share
/// structure.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    snapshot: StoreSnapshot,
    patterns: PatternCache,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn load(&self, identity: &Identity) -> Result<Option<Record>> {
        if identity.is_parented() {
            return Ok(self
                .snapshot
                .record(identity.root_identity())
                .and_then(|root| load_parented(root, identity)));
        }
        Ok(self.snapshot.record(identity).cloned().map(Record::Object))
    }

    fn scan<'a>(&'a self, type_tag: &str, query: &'a Query) -> Result<RecordScan<'a>> {
        query.validate()?;
        let Some(table) = self.snapshot.types.get(type_tag) else {
            return Ok(Box::new(std::iter::empty()));
        };
        let type_tag = type_tag.to_string();
        let records = table.order.iter().filter_map(move |local_id| {
            let record = table.records.get(local_id)?;
            let found = query.matches(record, &self.patterns).and_then(|matched| {
                if !matched {
                    return Ok(None);
                }
                Ok(Some(StoredRecord {
                    identity: Identity::root(type_tag.as_str(), local_id.as_str())?,
                    record: record.clone(),
                }))
            });
            found.transpose()
        });
        Ok(Box::new(records))
    }

    fn count(&self, type_tag: &str) -> Result<usize> {
        Ok(self
            .snapshot
            .types
            .get(type_tag)
            .map_or(0, |table| table.order.len()))
    }

    fn allocate_identity(&mut self, type_tag: &str) -> Result<Identity> {
        let table = self.snapshot.table_mut(type_tag);
        let id = table.next_id;
        table.next_id += 1;
        Identity::root(type_tag, id.to_string())
    }

    fn apply(&mut self, writes: Vec<RecordWrite>, actor: &UserId) -> Result<Vec<AppliedWrite>> {
        let span = info_span!("store.apply", writes = writes.len(), actor = %actor);
        let _enter = span.enter();

        let current = &self.snapshot;
        let mut next = current.clone();
        let batch = stage_writes(
            writes,
            actor,
            |identity| Ok(current.record(identity).cloned()),
            |type_tag| {
                let table = next.table_mut(type_tag);
                let id = table.next_id;
                table.next_id += 1;
                Identity::root(type_tag, id.to_string())
            },
        )?;

        for (identity, image) in batch.images {
            let table = next.table_mut(identity.type_tag());
            match image {
                Some(record) => {
                    table.records.insert(identity.local_id().to_string(), record);
                }
                None => {
                    table.records.remove(identity.local_id());
                }
            }
        }
        for identity in &batch.created {
            let table = next.table_mut(identity.type_tag());
            table.next_id = next_id_after(table.next_id, identity.local_id());
            table.order.push_back(identity.local_id().to_string());
        }
        for identity in &batch.destroyed {
            let table = next.table_mut(identity.type_tag());
            table.order = table
                .order
                .iter()
                .filter(|local_id| local_id.as_str() != identity.local_id())
                .cloned()
                .collect();
        }

        self.snapshot = next;
        event!(Level::DEBUG, applied = batch.applied.len(), "record batch applied");
        Ok(batch.applied)
    }

    fn register_service(&mut self, name: &str, identity: &Identity) -> Result<Option<Identity>> {
        if identity.is_transient() {
            return Err(PersistError::InvalidIdentity(format!(
                "service '{}' cannot point at uncommitted {}",
                name, identity
            )));
        }
        Ok(self
            .snapshot
            .services
            .insert(name.to_string(), identity.without_version()))
    }

    fn lookup_service(&self, name: &str) -> Result<Option<Identity>> {
        Ok(self.snapshot.services.get(name).cloned())
    }

    fn services(&self) -> Result<BTreeMap<String, Identity>> {
        Ok(self
            .snapshot
            .services
            .iter()
            .map(|(name, identity)| (name.clone(), identity.clone()))
            .collect())
    }

    fn type_tags(&self) -> Result<Vec<String>> {
        Ok(self
            .snapshot
            .types
            .iter()
            .filter(|(_, table)| !table.order.is_empty())
            .map(|(type_tag, _)| type_tag.clone())
            .collect())
    }
}
