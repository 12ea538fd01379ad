// ============================================================================
// Object Module
// ============================================================================
//
// In-memory side of the persistence core: the materialization state machine,
// native objects, surrogates and the identity map.
//
// ============================================================================

pub mod identity_map;
pub mod native;
pub mod state;
pub mod surrogate;

pub use identity_map::IdentityMap;
pub use native::{CollectionHandle, NativeObject, NativeValue};
pub use state::MaterializationState;
pub use surrogate::{DanglingReference, MaterializeOutcome, ObjectContext, Surrogate, SurrogateRef};
