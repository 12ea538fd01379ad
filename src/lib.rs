// ============================================================================
// RustObjStore Library
// ============================================================================
//
// Persistence core for object graphs: identities, ghost-first lazy loading,
// a per-session identity map, optimistic version stamps and record stores
// that apply transactions all-or-nothing.
//
// ============================================================================

pub mod core;
pub mod facade;
pub mod metamodel;
pub mod object;
pub mod prelude;
pub mod storage;
pub mod transaction;

pub use crate::core::{Identity, PersistError, Result, ScalarType, UserId, Value, VersionStamp};
pub use facade::{Session, SessionConfig};
pub use metamodel::{Metamodel, TypeRegistry, TypeSpec};
pub use object::{MaterializationState, SurrogateRef};
pub use storage::{DurabilityMode, FileRecordStore, MemoryRecordStore, Query, RecordStore};

/// Opens a session from a connection string such as
/// `objstore://alice@/var/lib/records?durability=sync`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rustobjstore::{ScalarType, TypeRegistry, TypeSpec};
///
/// # fn main() -> rustobjstore::Result<()> {
/// let types = TypeRegistry::new().with(TypeSpec::new("Note").scalar("text", ScalarType::Text))?;
/// let mut session = rustobjstore::connect("objstore://alice@memory", Arc::new(types))?;
///
/// let note = session.create_instance("Note")?;
/// session.set_field(&note, "text", "hello")?;
/// session.with_transaction(|s| s.create(&note))?;
/// assert_eq!(session.instance_count("Note")?, 1);
/// # Ok(())
/// # }
/// ```
pub fn connect(url: &str, metamodel: std::sync::Arc<dyn Metamodel>) -> Result<Session> {
    let config = SessionConfig::from_url(url)?;
    Session::open(&config, metamodel)
}
