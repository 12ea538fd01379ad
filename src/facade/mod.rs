pub mod access;
pub mod commit;
pub mod config;
pub(crate) mod context;
pub mod session;

pub use config::{SessionConfig, StoreLocation};
pub use session::{Instances, Session};
