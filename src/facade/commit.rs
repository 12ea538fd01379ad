use std::collections::HashMap;

use tracing::{Level, event};

use crate::core::{Identity, PersistError, Result};
use crate::facade::Session;
use crate::facade::context::SessionContext;
use crate::object::{MaterializationState, SurrogateRef};
use crate::storage::{AppliedWrite, ObjectRecord, RecordWrite};
use crate::transaction::{CommandKind, RecordCommand};

/// Update targets moved to `Updating` for the duration of a batch.
struct UpdateGuard {
    targets: Vec<SurrogateRef>,
}

impl UpdateGuard {
    fn begin(&mut self, target: &SurrogateRef) -> Result<()> {
        if target.state() == MaterializationState::Resolved {
            target.transition(MaterializationState::Updating)?;
            self.targets.push(target.clone());
        }
        Ok(())
    }
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        for target in &self.targets {
            if target.state() == MaterializationState::Updating {
                // Updating -> Resolved is always permitted.
                let _ = target.transition(MaterializationState::Resolved);
            }
        }
    }
}

impl Session {
    /// Lowers `commands` to record writes and applies them as one batch.
    ///
    /// Creates get persistent identities reserved up front so that objects
    /// created together can reference each other. On success the identity
    /// map is re-keyed, versions are refreshed and destroyed surrogates are
    /// marked; on failure no surrogate is touched.
    pub(crate) fn apply_commands(&mut self, commands: &[RecordCommand]) -> Result<Vec<AppliedWrite>> {
        let mut pending: HashMap<Identity, Identity> = HashMap::new();
        for command in commands {
            let target = command.target();
            target.require_live("commit")?;
            if command.kind() != CommandKind::Create {
                continue;
            }
            let identity = target
                .identity()
                .ok_or_else(|| PersistError::NotPersistable(target.type_tag()))?;
            if !identity.is_transient() {
                return Err(PersistError::DuplicateIdentity(identity));
            }
            if !pending.contains_key(&identity) {
                let reserved = self.store.allocate_identity(identity.type_tag())?;
                pending.insert(identity, reserved);
            }
        }

        let mut guard = UpdateGuard { targets: Vec::new() };
        let mut writes = Vec::with_capacity(commands.len());
        let mut targets = Vec::with_capacity(commands.len());
        let mut written: Vec<SurrogateRef> = Vec::new();

        for command in commands {
            let target = command.target();
            let identity = target
                .identity()
                .ok_or_else(|| PersistError::NotPersistable(target.type_tag()))?;
            let write = match command.kind() {
                CommandKind::Create | CommandKind::Update => {
                    if written.iter().any(|w| w.ptr_eq(target)) {
                        // The earlier write already carries the current fields.
                        continue;
                    }
                    if command.kind() == CommandKind::Update && identity.is_transient() {
                        if pending.contains_key(&identity) {
                            continue;
                        }
                        return Err(PersistError::Transaction(format!(
                            "{} must be created before it is saved",
                            identity
                        )));
                    }
                    written.push(target.clone());
                    guard.begin(target)?;
                    let record = self.flatten_for_write(target, &pending)?;
                    match command.kind() {
                        CommandKind::Create => RecordWrite::Create {
                            type_tag: identity.type_tag().to_string(),
                            identity: pending.get(&identity).cloned(),
                            record,
                        },
                        _ => RecordWrite::Update {
                            identity: identity.without_version(),
                            expected: target.version(),
                            record,
                        },
                    }
                }
                CommandKind::Destroy => {
                    let stored = match pending.get(&identity) {
                        Some(reserved) => reserved.clone(),
                        None if identity.is_transient() => {
                            return Err(PersistError::Transaction(format!(
                                "{} was never created",
                                identity
                            )));
                        }
                        None => identity.without_version(),
                    };
                    RecordWrite::Destroy { identity: stored }
                }
            };
            writes.push(write);
            targets.push(target.clone());
        }

        if writes.is_empty() {
            return Ok(Vec::new());
        }
        let applied = self.store.apply(writes, &self.actor)?;
        drop(guard);

        for (outcome, target) in applied.iter().zip(&targets) {
            match outcome {
                AppliedWrite::Created { identity, version } => {
                    self.adopt_identity(target, identity)?;
                    target.set_version(Some(version.clone()));
                }
                AppliedWrite::Updated { version, .. } => {
                    target.set_version(Some(version.clone()));
                }
                AppliedWrite::Destroyed { identity } => {
                    target.mark_destroyed();
                    event!(Level::DEBUG, identity = %identity, "object destroyed");
                }
            }
        }
        Ok(applied)
    }

    fn flatten_for_write(
        &mut self,
        target: &SurrogateRef,
        pending: &HashMap<Identity, Identity>,
    ) -> Result<ObjectRecord> {
        let mut ctx = SessionContext {
            store: self.store.as_ref(),
            metamodel: self.metamodel.as_ref(),
            specs: &mut self.specs,
            identity_map: &mut self.identity_map,
            pending: Some(pending),
        };
        let fields = target.flatten(&mut ctx)?;
        Ok(ObjectRecord {
            type_tag: target.type_tag(),
            version: None,
            fields,
        })
    }

    /// Swaps a transient identity for the persistent one, re-keying the
    /// root and every sub-object registered under it.
    fn adopt_identity(&mut self, target: &SurrogateRef, persistent: &Identity) -> Result<()> {
        let Some(old) = target.identity() else {
            return Ok(());
        };
        if old == *persistent {
            return Ok(());
        }
        self.identity_map.remap(&old, persistent)?;
        target.set_identity(persistent.without_version());
        target.reparent(&old, persistent);
        for (child_identity, child) in self.identity_map.children_of(&old) {
            if let Some(moved) = child_identity.reparent(&old, persistent) {
                self.identity_map.remap(&child_identity, &moved)?;
            }
            child.reparent(&old, persistent);
        }
        Ok(())
    }
}
