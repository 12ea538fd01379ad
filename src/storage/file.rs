// ============================================================================
// File Record Store
// ============================================================================
//
// Layout under the store root:
//
//   <type_tag>/<local_id>.json   one JSON record per root identity
//   <type_tag>/_index.json       allocation counter and insertion order
//   _services.json               service name -> identity
//   _journal.json                only present while a commit is in flight
//
// ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{Level, event, info_span};

use crate::core::identity::{validate_segment, validate_type_tag};
use crate::core::{Identity, PersistError, Result, UserId};
use crate::storage::engine::{load_parented, next_id_after, stage_writes};
use crate::storage::journal::{
    CommitJournal, DurabilityMode, JournalEntry, JournalManager, read_optional, restore, write_atomic,
};
use crate::storage::{AppliedWrite, ObjectRecord, PatternCache, Query, Record, RecordScan, RecordStore, RecordWrite, StoredRecord};

const INDEX_FILE: &str = "_index.json";
const INDEX_STEM: &str = "_index";
const SERVICES_FILE: &str = "_services.json";
const RECORD_EXT: &str = "json";

/// Per-type allocation counter and record order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeIndex {
    pub next_id: u64,
    pub order: Vec<String>,
}

impl Default for TypeIndex {
    fn default() -> Self {
        Self {
            next_id: 1,
            order: Vec::new(),
        }
    }
}

impl TypeIndex {
    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

pub struct FileRecordStore {
    root: PathBuf,
    durability: DurabilityMode,
    journal: JournalManager,
    patterns: PatternCache,
}

fn check_type_dir(type_tag: &str) -> Result<()> {
    validate_type_tag(type_tag)?;
    check_not_relative(type_tag)
}

fn check_record_stem(local_id: &str) -> Result<()> {
    validate_segment("local id", local_id)?;
    check_not_relative(local_id)?;
    if local_id == INDEX_STEM {
        return Err(PersistError::InvalidIdentity(format!(
            "'{}' is reserved by the file store",
            local_id
        )));
    }
    Ok(())
}

fn check_not_relative(segment: &str) -> Result<()> {
    if segment.chars().all(|c| c == '.') {
        return Err(PersistError::InvalidIdentity(format!(
            "'{}' cannot be used as a file store path segment",
            segment
        )));
    }
    Ok(())
}

impl FileRecordStore {
    /// Opens (creating if needed) the store at `root`, replaying any commit
    /// journal an earlier process left behind.
    pub fn open<P: AsRef<Path>>(root: P, durability: DurabilityMode) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let journal = JournalManager::new(&root, durability);
        let replayed = journal.recover()?;
        event!(
            Level::DEBUG,
            root = %root.display(),
            ?durability,
            replayed,
            "file record store opened"
        );
        Ok(Self {
            root,
            durability,
            journal,
            patterns: PatternCache::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    fn relative_record_path(identity: &Identity) -> Result<PathBuf> {
        check_type_dir(identity.type_tag())?;
        check_record_stem(identity.local_id())?;
        Ok(PathBuf::from(identity.type_tag()).join(format!("{}.{}", identity.local_id(), RECORD_EXT)))
    }

    fn relative_index_path(type_tag: &str) -> Result<PathBuf> {
        check_type_dir(type_tag)?;
        Ok(PathBuf::from(type_tag).join(INDEX_FILE))
    }

    fn read_root_record(&self, identity: &Identity) -> Result<Option<ObjectRecord>> {
        if identity.is_transient() {
            return Ok(None);
        }
        let path = self.root.join(Self::relative_record_path(identity)?);
        read_optional(&path)?
            .map(|text| ObjectRecord::decode(&text))
            .transpose()
    }

    pub fn read_index(&self, type_tag: &str) -> Result<TypeIndex> {
        let path = self.root.join(Self::relative_index_path(type_tag)?);
        match read_optional(&path)? {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(TypeIndex::default()),
        }
    }

    fn write_index(&self, type_tag: &str, index: &TypeIndex) -> Result<()> {
        let path = self.root.join(Self::relative_index_path(type_tag)?);
        write_atomic(&path, &serde_json::to_string_pretty(index)?, self.durability)
    }

    fn read_services(&self) -> Result<BTreeMap<String, Identity>> {
        match read_optional(&self.root.join(SERVICES_FILE))? {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Rewrites every file in `entries`, restoring before-images if any
    /// write fails part way.
    fn write_entries(&self, entries: &[JournalEntry], actor: &UserId) -> Result<()> {
        self.journal.write(&CommitJournal::new(actor, entries.to_vec()))?;
        for (applied, entry) in entries.iter().enumerate() {
            if let Err(err) = restore(&self.root, &entry.path, entry.after.as_deref(), self.durability) {
                event!(Level::ERROR, path = %entry.path.display(), error = %err, "record write failed");
                self.journal.roll_back(&entries[..=applied])?;
                return Err(err);
            }
        }
        self.journal.clear()
    }
}

impl RecordStore for FileRecordStore {
    fn load(&self, identity: &Identity) -> Result<Option<Record>> {
        if identity.is_parented() {
            return Ok(self
                .read_root_record(identity.root_identity())?
                .and_then(|root| load_parented(&root, identity)));
        }
        Ok(self.read_root_record(identity)?.map(Record::Object))
    }

    fn exists(&self, identity: &Identity) -> Result<bool> {
        if identity.is_parented() {
            return Ok(self.load(identity)?.is_some());
        }
        if identity.is_transient() {
            return Ok(false);
        }
        Ok(self.root.join(Self::relative_record_path(identity)?).is_file())
    }

    fn scan<'a>(&'a self, type_tag: &str, query: &'a Query) -> Result<RecordScan<'a>> {
        query.validate()?;
        let type_tag = type_tag.to_string();
        let order = self.read_index(&type_tag)?.order;
        let records = order.into_iter().filter_map(move |local_id| {
            let found = Identity::root(type_tag.as_str(), local_id).and_then(|identity| {
                let Some(record) = self.read_root_record(&identity)? else {
                    return Ok(None);
                };
                if query.matches(&record, &self.patterns)? {
                    Ok(Some(StoredRecord { identity, record }))
                } else {
                    Ok(None)
                }
            });
            found.transpose()
        });
        Ok(Box::new(records))
    }

    fn count(&self, type_tag: &str) -> Result<usize> {
        Ok(self.read_index(type_tag)?.order.len())
    }

    fn allocate_identity(&mut self, type_tag: &str) -> Result<Identity> {
        let mut index = self.read_index(type_tag)?;
        let id = index.allocate();
        self.write_index(type_tag, &index)?;
        Identity::root(type_tag, id.to_string())
    }

    fn apply(&mut self, writes: Vec<RecordWrite>, actor: &UserId) -> Result<Vec<AppliedWrite>> {
        let span = info_span!("store.apply", writes = writes.len(), actor = %actor);
        let _enter = span.enter();

        let mut indexes: BTreeMap<String, TypeIndex> = BTreeMap::new();
        let mut allocated: BTreeSet<String> = BTreeSet::new();
        let batch = stage_writes(
            writes,
            actor,
            |identity| self.read_root_record(identity),
            |type_tag| {
                let index = match indexes.entry(type_tag.to_string()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(self.read_index(type_tag)?),
                };
                let id = index.allocate();
                allocated.insert(type_tag.to_string());
                Identity::root(type_tag, id.to_string())
            },
        )?;

        let mut touched: BTreeSet<String> = batch.touched_types().into_iter().collect();
        touched.extend(allocated);
        for type_tag in touched {
            if let Entry::Vacant(entry) = indexes.entry(type_tag) {
                let index = self.read_index(entry.key())?;
                entry.insert(index);
            }
        }
        for identity in &batch.created {
            if let Some(index) = indexes.get_mut(identity.type_tag()) {
                index.next_id = next_id_after(index.next_id, identity.local_id());
                index.order.push(identity.local_id().to_string());
            }
        }
        for identity in &batch.destroyed {
            if let Some(index) = indexes.get_mut(identity.type_tag()) {
                index.order.retain(|local_id| local_id != identity.local_id());
            }
        }

        let mut entries = Vec::with_capacity(batch.images.len() + indexes.len());
        for (identity, image) in &batch.images {
            let path = Self::relative_record_path(identity)?;
            let before = read_optional(&self.root.join(&path))?;
            let after = image.as_ref().map(ObjectRecord::encode).transpose()?;
            entries.push(JournalEntry { path, before, after });
        }
        for (type_tag, index) in &indexes {
            let path = Self::relative_index_path(type_tag)?;
            let before = read_optional(&self.root.join(&path))?;
            let after = Some(serde_json::to_string_pretty(index)?);
            entries.push(JournalEntry { path, before, after });
        }

        self.write_entries(&entries, actor)?;
        event!(
            Level::DEBUG,
            created = batch.created.len(),
            destroyed = batch.destroyed.len(),
            files = entries.len(),
            "record batch applied"
        );
        Ok(batch.applied)
    }

    fn register_service(&mut self, name: &str, identity: &Identity) -> Result<Option<Identity>> {
        if identity.is_transient() {
            return Err(PersistError::InvalidIdentity(format!(
                "service '{}' cannot point at uncommitted {}",
                name, identity
            )));
        }
        let mut services = self.read_services()?;
        let previous = services.insert(name.to_string(), identity.without_version());
        write_atomic(
            &self.root.join(SERVICES_FILE),
            &serde_json::to_string_pretty(&services)?,
            self.durability,
        )?;
        Ok(previous)
    }

    fn lookup_service(&self, name: &str) -> Result<Option<Identity>> {
        Ok(self.read_services()?.remove(name))
    }

    fn services(&self) -> Result<BTreeMap<String, Identity>> {
        self.read_services()
    }

    fn type_tags(&self) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(type_tag) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if check_type_dir(&type_tag).is_ok() && !self.read_index(&type_tag)?.order.is_empty() {
                tags.push(type_tag);
            }
        }
        tags.sort();
        Ok(tags)
    }
}
