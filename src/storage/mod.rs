pub mod engine;
pub mod file;
pub mod journal;
pub mod memory;
pub mod pattern;
pub mod query;
pub mod record;

pub use engine::{RecordScan, RecordStore, StoredRecord};
pub use file::{FileRecordStore, TypeIndex};
pub use journal::{CommitJournal, DurabilityMode, JournalEntry, JournalManager};
pub use memory::MemoryRecordStore;
pub use pattern::PatternCache;
pub use query::{Query, RecordPredicate};
pub use record::{
    AppliedWrite, CollectionRecord, EmbeddedRecord, FieldValue, ObjectRecord, Record, RecordWrite,
};
