//! Commit journal for the file record store.
//!
//! A commit writes the before and after image of every file it is about to
//! touch into `_journal.json`, then rewrites the files, then removes the
//! journal. A journal left behind by a crash is replayed forward on open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{Level, event};

use crate::core::{PersistError, Result, UserId};

pub const JOURNAL_FILE: &str = "_journal.json";

/// How hard a commit pushes its writes to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// fsync record files and the journal before returning.
    #[default]
    Sync,
    /// Flush without fsync.
    Async,
    /// No commit journal at all.
    None,
}

impl std::str::FromStr for DurabilityMode {
    type Err = PersistError;

    fn from_str(text: &str) -> Result<Self> {
        match text.to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "none" => Ok(Self::None),
            other => Err(PersistError::StoreError(format!(
                "unknown durability mode '{}'",
                other
            ))),
        }
    }
}

/// Before and after text of one file, relative to the store root.
/// `None` means the file does not exist on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub path: PathBuf,
    pub before: Option<String>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitJournal {
    pub actor: UserId,
    pub started_at: DateTime<Utc>,
    pub entries: Vec<JournalEntry>,
}

impl CommitJournal {
    pub fn new(actor: &UserId, entries: Vec<JournalEntry>) -> Self {
        Self {
            actor: actor.clone(),
            started_at: Utc::now(),
            entries,
        }
    }
}

/// Writes `contents` next to `path` and renames it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str, durability: DurabilityMode) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PersistError::StoreError(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(contents.as_bytes())?;
    temp.flush()?;
    if durability == DurabilityMode::Sync {
        temp.as_file().sync_all()?;
    }
    temp.persist(path)
        .map_err(|e| PersistError::StoreError(format!("failed to replace {}: {}", path.display(), e.error)))?;
    Ok(())
}

pub(crate) fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn remove_optional(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Writes one side of an entry into the tree under `root`.
pub(crate) fn restore(
    root: &Path,
    path: &Path,
    contents: Option<&str>,
    durability: DurabilityMode,
) -> Result<()> {
    let target = root.join(path);
    match contents {
        Some(text) => write_atomic(&target, text, durability),
        None => remove_optional(&target),
    }
}

pub struct JournalManager {
    root: PathBuf,
    durability: DurabilityMode,
}

impl JournalManager {
    pub fn new<P: AsRef<Path>>(root: P, durability: DurabilityMode) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            durability,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    pub fn is_enabled(&self) -> bool {
        self.durability != DurabilityMode::None
    }

    pub fn write(&self, journal: &CommitJournal) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let text = serde_json::to_string(journal)?;
        write_atomic(&self.path(), &text, self.durability)
    }

    /// Journal left behind by an interrupted commit, if any.
    pub fn read(&self) -> Result<Option<CommitJournal>> {
        match read_optional(&self.path())? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) -> Result<()> {
        remove_optional(&self.path())
    }

    /// Replays a leftover journal forward and removes it. Returns the number
    /// of files rewritten.
    pub fn recover(&self) -> Result<usize> {
        let Some(journal) = self.read()? else {
            return Ok(0);
        };
        event!(
            Level::WARN,
            actor = %journal.actor,
            started_at = %journal.started_at,
            entries = journal.entries.len(),
            "replaying interrupted commit"
        );
        for entry in &journal.entries {
            restore(&self.root, &entry.path, entry.after.as_deref(), self.durability)?;
        }
        self.clear()?;
        Ok(journal.entries.len())
    }

    /// Puts every before-image back after a failed commit.
    pub fn roll_back(&self, entries: &[JournalEntry]) -> Result<()> {
        let mut first_error = None;
        for entry in entries.iter().rev() {
            if let Err(err) = restore(&self.root, &entry.path, entry.before.as_deref(), self.durability) {
                event!(Level::ERROR, path = %entry.path.display(), error = %err, "rollback failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            // The journal stays behind so the next open can roll forward.
            Some(err) => Err(err),
            None => self.clear(),
        }
    }
}
