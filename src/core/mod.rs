pub mod error;
pub mod identity;
pub mod value;
pub mod version;

pub use error::{PersistError, Result};
pub use identity::{Identity, IdentityKind};
pub use value::{ScalarType, Value};
pub use version::{UserId, VersionStamp};
