// ============================================================================
// Session Façade
// ============================================================================
//
// One unit of work: an identity map, a record store handle and at most one
// active transaction. Nothing here is shared between sessions.
//
// ============================================================================

use std::sync::Arc;

use tracing::{Level, event, info_span};

use crate::core::{Identity, PersistError, Result, UserId};
use crate::facade::context::{SessionContext, SpecCache};
use crate::facade::{SessionConfig, StoreLocation};
use crate::metamodel::{Metamodel, Persistability, TypeSpec};
use crate::object::{
    DanglingReference, IdentityMap, MaterializationState, MaterializeOutcome, NativeObject, NativeValue, ObjectContext,
    SurrogateRef,
};
use crate::storage::{
    AppliedWrite, FileRecordStore, MemoryRecordStore, Query, RecordScan, RecordStore,
};
use crate::transaction::{RecordCommand, Transaction, TransactionId};

pub struct Session {
    pub(crate) store: Box<dyn RecordStore>,
    pub(crate) metamodel: Arc<dyn Metamodel>,
    pub(crate) specs: SpecCache,
    pub(crate) identity_map: IdentityMap,
    pub(crate) actor: UserId,
    transaction: Option<Transaction>,
    next_transaction: TransactionId,
    open: bool,
    /// Found by loads the caller did not ask for explicitly.
    dangling: Vec<DanglingReference>,
}

impl Session {
    /// Opens a session on the store described by `config`.
    pub fn open(config: &SessionConfig, metamodel: Arc<dyn Metamodel>) -> Result<Self> {
        let store: Box<dyn RecordStore> = match &config.location {
            StoreLocation::Directory(root) => Box::new(FileRecordStore::open(root, config.durability)?),
            StoreLocation::Memory => Box::new(MemoryRecordStore::new()),
        };
        event!(Level::DEBUG, url = %config.to_url(), "session opened");
        Ok(Self::with_store(store, metamodel, config.actor.clone()))
    }

    pub fn with_store(
        store: Box<dyn RecordStore>,
        metamodel: Arc<dyn Metamodel>,
        actor: UserId,
    ) -> Self {
        Self {
            store,
            metamodel,
            specs: SpecCache::default(),
            identity_map: IdentityMap::new(),
            actor,
            transaction: None,
            next_transaction: TransactionId::first(),
            open: true,
            dangling: Vec::new(),
        }
    }

    pub fn actor(&self) -> &UserId {
        &self.actor
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// Aborts any active transaction, breaks reference cycles between
    /// surrogates and empties the identity map. Closing twice is allowed.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        if self.transaction.is_some() {
            self.abort()?;
        }
        self.release_surrogates();
        self.open = false;
        event!(Level::DEBUG, "session closed");
        Ok(())
    }

    fn release_surrogates(&mut self) {
        for surrogate in self.identity_map.drain() {
            surrogate.release();
        }
    }

    pub(crate) fn require_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(PersistError::SessionClosed)
        }
    }

    pub(crate) fn context(&mut self) -> SessionContext<'_> {
        SessionContext {
            store: self.store.as_ref(),
            metamodel: self.metamodel.as_ref(),
            specs: &mut self.specs,
            identity_map: &mut self.identity_map,
            pending: None,
        }
    }

    pub(crate) fn type_spec(&mut self, type_tag: &str) -> Result<Arc<TypeSpec>> {
        self.specs.get(self.metamodel.as_ref(), type_tag)
    }

    // ------------------------------------------------------------------
    // Object creation
    // ------------------------------------------------------------------

    /// New persistable object, fully populated in memory and registered
    /// under a transient identity until its first commit.
    pub fn create_instance(&mut self, type_tag: &str) -> Result<SurrogateRef> {
        self.require_open()?;
        let spec = self.type_spec(type_tag)?;
        if !spec.is_persistent() {
            return Err(PersistError::NotPersistable(type_tag.to_string()));
        }
        let identity = Identity::transient(type_tag);
        let native = NativeObject::blank(&spec, Some(&identity), true);
        let surrogate = SurrogateRef::new_instance(native, identity);
        surrogate.transition(MaterializationState::Resolved)?;
        self.identity_map.intern(surrogate)
    }

    /// Object of a non-persistable type. It stays `Transient` and is never
    /// registered in the identity map.
    pub fn create_transient(&mut self, type_tag: &str) -> Result<SurrogateRef> {
        self.require_open()?;
        let spec = self.type_spec(type_tag)?;
        if spec.persistability() != Persistability::Transient {
            return Err(PersistError::TypeMismatch(format!(
                "type '{}' is persistable; use create_instance",
                type_tag
            )));
        }
        let identity = Identity::transient(type_tag);
        let native = NativeObject::blank(&spec, Some(&identity), true);
        Ok(SurrogateRef::transient(native, identity))
    }

    /// Identity-less object used as a query-by-example pattern.
    pub fn create_pattern(&mut self, type_tag: &str) -> Result<SurrogateRef> {
        self.require_open()?;
        let spec = self.type_spec(type_tag)?;
        Ok(SurrogateRef::value(NativeObject::blank(&spec, None, true)))
    }

    // ------------------------------------------------------------------
    // Lookup and loading
    // ------------------------------------------------------------------

    /// Surrogate for `identity`: the one already in the identity map, or a
    /// new ghost if the store has a record for it.
    pub fn fetch(&mut self, identity: &Identity) -> Result<SurrogateRef> {
        self.require_open()?;
        let identity = identity.without_version();
        if let Some(existing) = self.identity_map.lookup(&identity) {
            if existing.state().is_destroyed() {
                return Err(PersistError::ObjectNotFound(identity));
            }
            return Ok(existing);
        }
        if identity.is_parented() {
            // Sub-objects are only reachable through their root.
            let root = self.fetch(identity.root_identity())?;
            self.resolve(&root)?;
            return self
                .identity_map
                .lookup(&identity)
                .ok_or(PersistError::ObjectNotFound(identity));
        }
        if !self.store.exists(&identity)? {
            return Err(PersistError::ObjectNotFound(identity));
        }
        self.context().ghost(&identity)
    }

    /// Forces a ghost to load. Parented surrogates load their root.
    /// Surrogates that are already loaded are left alone.
    pub fn resolve(&mut self, surrogate: &SurrogateRef) -> Result<MaterializeOutcome> {
        self.require_open()?;
        surrogate.require_live("resolve")?;
        let owner = surrogate.lifecycle_owner();
        if !owner.state().is_ghost() {
            return Ok(MaterializeOutcome {
                skipped: true,
                ..MaterializeOutcome::default()
            });
        }
        let identity = owner
            .identity()
            .ok_or_else(|| PersistError::TypeMismatch("value objects cannot be resolved".to_string()))?;
        let record = self.store.load(&identity)?.and_then(|record| record.into_object());
        let Some(record) = record else {
            event!(Level::WARN, identity = %identity, "record vanished before resolve");
            owner.mark_destroyed();
            return Err(PersistError::ObjectNotFound(identity));
        };
        let mut ctx = self.context();
        owner.materialize(&record, &mut ctx)
    }

    /// Loads a ghost before the caller touches its fields.
    pub(crate) fn ensure_resolved(&mut self, surrogate: &SurrogateRef) -> Result<()> {
        if surrogate.lifecycle_owner().state().is_ghost() {
            let outcome = self.resolve(surrogate)?;
            self.note_dangling(outcome);
        }
        Ok(())
    }

    pub(crate) fn note_dangling(&mut self, outcome: MaterializeOutcome) {
        self.dangling.extend(outcome.dangling);
    }

    /// Dangling references met by field access and collection loads since
    /// the last call. `resolve` and `instances` report their own.
    pub fn take_dangling(&mut self) -> Vec<DanglingReference> {
        std::mem::take(&mut self.dangling)
    }

    /// Every record of `type_tag` accepted by `query`, materialized through
    /// the identity map. The sequence is lazy and can be walked once.
    pub fn instances<'a>(&'a mut self, type_tag: &str, query: &'a Query) -> Result<Instances<'a>> {
        self.require_open()?;
        let Session {
            store,
            metamodel,
            specs,
            identity_map,
            ..
        } = self;
        let store: &'a dyn RecordStore = &**store;
        let scan = store.scan(type_tag, query)?;
        Ok(Instances {
            scan,
            dangling: Vec::new(),
            context: SessionContext {
                store,
                metamodel: &**metamodel,
                specs,
                identity_map,
                pending: None,
            },
        })
    }

    /// Query matching every set field of a pattern object. Null scalars
    /// and empty collections are left out of the pattern.
    pub fn query_by_example(&mut self, pattern: &SurrogateRef) -> Result<Query> {
        self.require_open()?;
        let unset: Vec<String> = pattern
            .native()
            .fields()
            .filter(|(_, value)| match value {
                NativeValue::Scalar(value) => value.is_null(),
                NativeValue::Collection(handle) => handle.is_empty(),
                NativeValue::Reference(target) | NativeValue::Embedded(target) => target.is_none(),
            })
            .map(|(id, _)| id.to_string())
            .collect();
        let mut ctx = self.context();
        let mut fields = pattern.flatten(&mut ctx)?;
        fields.retain(|id, _| !unset.contains(id));
        Ok(Query::Pattern(fields))
    }

    pub fn instance_count(&self, type_tag: &str) -> Result<usize> {
        self.require_open()?;
        self.store.count(type_tag)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(&mut self) -> Result<TransactionId> {
        self.require_open()?;
        if let Some(active) = &self.transaction {
            return Err(PersistError::Transaction(format!(
                "transaction {} is already active",
                active.id()
            )));
        }
        let id = self.next_transaction;
        self.next_transaction = id.next();
        self.transaction = Some(Transaction::new(id));
        event!(Level::DEBUG, txn = %id, "transaction started");
        Ok(id)
    }

    pub fn active_transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    fn enqueue(&mut self, command: RecordCommand) -> Result<()> {
        self.require_open()?;
        let transaction = self
            .transaction
            .as_mut()
            .ok_or_else(|| PersistError::Transaction("no active transaction".to_string()))?;
        transaction.enqueue(command)
    }

    /// Queues the first write of a new object.
    pub fn create(&mut self, surrogate: &SurrogateRef) -> Result<()> {
        surrogate.require_live("create")?;
        let identity = surrogate
            .identity()
            .ok_or_else(|| PersistError::NotPersistable(surrogate.type_tag()))?;
        if surrogate.is_parented() {
            return Err(PersistError::TypeMismatch(format!(
                "{} is part of an aggregate; create its root",
                identity
            )));
        }
        if surrogate.state() == MaterializationState::Transient {
            return Err(PersistError::NotPersistable(surrogate.type_tag()));
        }
        if !identity.is_transient() {
            return Err(PersistError::DuplicateIdentity(identity));
        }
        self.enqueue(RecordCommand::create(surrogate.clone()))
    }

    /// Queues a write of the object's current fields. Sub-objects save
    /// their aggregate root. Saving a ghost changes nothing.
    pub fn save(&mut self, surrogate: &SurrogateRef) -> Result<()> {
        surrogate.require_live("save")?;
        let owner = surrogate.lifecycle_owner();
        if owner.is_value() || owner.state() == MaterializationState::Transient {
            return Err(PersistError::NotPersistable(owner.type_tag()));
        }
        if owner.state().is_ghost() {
            self.require_open()?;
            return Ok(());
        }
        self.enqueue(RecordCommand::update(owner))
    }

    /// Queues removal of a root record. References held elsewhere are left
    /// to be discovered as dangling.
    pub fn destroy(&mut self, surrogate: &SurrogateRef) -> Result<()> {
        surrogate.require_live("destroy")?;
        if surrogate.is_value() || surrogate.state() == MaterializationState::Transient {
            return Err(PersistError::NotPersistable(surrogate.type_tag()));
        }
        if surrogate.is_parented() {
            return Err(PersistError::TypeMismatch(
                "sub-objects are destroyed with their aggregate root".to_string(),
            ));
        }
        self.enqueue(RecordCommand::destroy(surrogate.clone()))
    }

    /// Applies the queued commands as one batch. Any failure aborts the
    /// whole transaction and leaves the store untouched.
    pub fn commit(&mut self) -> Result<Vec<AppliedWrite>> {
        self.require_open()?;
        let mut transaction = self
            .transaction
            .take()
            .ok_or_else(|| PersistError::Transaction("no active transaction to commit".to_string()))?;
        let span = info_span!(
            "session.commit",
            txn = %transaction.id(),
            actor = %self.actor,
            commands = transaction.command_count()
        );
        let _enter = span.enter();

        let commands = transaction.take_commands()?;
        match self.apply_commands(&commands) {
            Ok(applied) => {
                transaction.mark_committed()?;
                event!(Level::DEBUG, writes = applied.len(), "transaction committed");
                Ok(applied)
            }
            Err(err) => {
                transaction.mark_aborted()?;
                event!(Level::WARN, error = %err, "transaction aborted");
                Err(err)
            }
        }
    }

    /// Drops every queued command.
    pub fn abort(&mut self) -> Result<()> {
        let mut transaction = self
            .transaction
            .take()
            .ok_or_else(|| PersistError::Transaction("no active transaction to abort".to_string()))?;
        transaction.mark_aborted()?;
        event!(Level::DEBUG, txn = %transaction.id(), "transaction aborted");
        Ok(())
    }

    /// Applies `commands` directly, outside any transaction queue.
    pub fn execute(&mut self, commands: Vec<RecordCommand>) -> Result<Vec<AppliedWrite>> {
        self.require_open()?;
        let span = info_span!("session.execute", actor = %self.actor, commands = commands.len());
        let _enter = span.enter();
        self.apply_commands(&commands)
    }

    /// Runs `work` inside a transaction: commit when it returns `Ok`, abort
    /// when it returns `Err`.
    pub fn with_transaction<T>(&mut self, work: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        self.begin_transaction()?;
        match work(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if self.transaction.is_some() {
                    self.abort()?;
                }
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    pub fn register_service(&mut self, name: &str, identity: &Identity) -> Result<Option<Identity>> {
        self.require_open()?;
        self.store.register_service(name, identity)
    }

    pub fn lookup_service(&self, name: &str) -> Result<Option<Identity>> {
        self.require_open()?;
        self.store.lookup_service(name)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release_surrogates();
    }
}

/// Lazy sequence returned by [`Session::instances`].
pub struct Instances<'a> {
    scan: RecordScan<'a>,
    context: SessionContext<'a>,
    dangling: Vec<DanglingReference>,
}

impl Instances<'_> {
    /// Dangling references found in the objects yielded so far.
    pub fn dangling(&self) -> &[DanglingReference] {
        &self.dangling
    }
}

impl Iterator for Instances<'_> {
    type Item = Result<SurrogateRef>;

    fn next(&mut self) -> Option<Self::Item> {
        let found = match self.scan.next()? {
            Ok(found) => found,
            Err(err) => return Some(Err(err)),
        };
        let loaded = self.context.ghost(&found.identity).and_then(|surrogate| {
            if surrogate.state().is_ghost() {
                let outcome = surrogate.materialize(&found.record, &mut self.context)?;
                self.dangling.extend(outcome.dangling);
            }
            Ok(surrogate)
        });
        Some(loaded)
    }
}
