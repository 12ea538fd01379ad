use std::path::{Path, PathBuf};

use crate::core::{PersistError, Result, UserId};
use crate::storage::DurabilityMode;

const URL_SCHEME: &str = "objstore://";
const MEMORY_HOST: &str = "memory";

/// Where a session keeps its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// File record store rooted at this directory.
    Directory(PathBuf),
    Memory,
}

/// Session configuration
///
/// Similar to a database connection string: the actor is the user stamped
/// into every version a session writes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub location: StoreLocation,
    pub actor: UserId,
    pub durability: DurabilityMode,
}

impl SessionConfig {
    /// File-backed session rooted at `root_dir`.
    pub fn new<P: AsRef<Path>>(root_dir: P) -> Self {
        Self {
            location: StoreLocation::Directory(root_dir.as_ref().to_path_buf()),
            actor: UserId::default(),
            durability: DurabilityMode::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::Memory,
            actor: UserId::default(),
            durability: DurabilityMode::None,
        }
    }

    pub fn actor(mut self, actor: impl Into<UserId>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    pub fn root_dir(&self) -> Option<&Path> {
        match &self.location {
            StoreLocation::Directory(path) => Some(path),
            StoreLocation::Memory => None,
        }
    }

    /// Parse from a connection string
    ///
    /// Format: `objstore://[actor@]/path/to/store[?durability=sync|async|none]`
    /// or `objstore://[actor@]memory`.
    ///
    /// ```ignore
    /// let config = SessionConfig::from_url("objstore://alice@/var/lib/records?durability=async")?;
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let invalid = |detail: &str| PersistError::StoreError(format!("invalid store url '{}': {}", url, detail));
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| invalid("must start with 'objstore://'"))?;

        let (rest, params) = match rest.split_once('?') {
            Some((rest, params)) => (rest, Some(params)),
            None => (rest, None),
        };
        let (actor, location) = match rest.split_once('@') {
            Some((actor, location)) if !actor.is_empty() => (Some(actor), location),
            Some((_, _)) => return Err(invalid("empty actor before '@'")),
            None => (None, rest),
        };

        let mut config = if location == MEMORY_HOST {
            Self::in_memory()
        } else if location.starts_with('/') {
            Self::new(location)
        } else {
            return Err(invalid("location must be an absolute path or 'memory'"));
        };
        if let Some(actor) = actor {
            config = config.actor(actor);
        }

        for pair in params.into_iter().flat_map(|p| p.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid("parameters must be key=value"))?;
            match key {
                "durability" => config.durability = value.parse()?,
                other => return Err(invalid(&format!("unknown parameter '{}'", other))),
            }
        }
        Ok(config)
    }

    /// Convert to a connection string
    pub fn to_url(&self) -> String {
        let location = match &self.location {
            StoreLocation::Directory(path) => path.display().to_string(),
            StoreLocation::Memory => MEMORY_HOST.to_string(),
        };
        let durability = match self.durability {
            DurabilityMode::Sync => "sync",
            DurabilityMode::Async => "async",
            DurabilityMode::None => "none",
        };
        format!("{}{}@{}?durability={}", URL_SCHEME, self.actor, location, durability)
    }
}
