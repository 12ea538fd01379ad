//! Common imports for code that drives sessions.
//!
//! `use rustobjstore::prelude::*;` brings in the façade, the metamodel
//! builders and the value types. Store internals stay behind `advanced`.

pub use crate::core::{Identity, PersistError, Result, ScalarType, UserId, Value, VersionStamp};
pub use crate::facade::{Session, SessionConfig};
pub use crate::metamodel::{Metamodel, TypeRegistry, TypeSpec};
pub use crate::object::{DanglingReference, MaterializationState, SurrogateRef};
pub use crate::storage::{DurabilityMode, Query};

pub mod advanced {
    //! Record-level access for tools and custom stores.
    pub use crate::storage::{
        AppliedWrite, FieldValue, FileRecordStore, MemoryRecordStore, ObjectRecord, Record,
        RecordStore, RecordWrite, StoredRecord,
    };
    pub use crate::transaction::{CommandKind, RecordCommand};
}
