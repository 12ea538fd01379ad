use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::warn;

use crate::core::{Identity, PersistError, Result, Value, VersionStamp};
use crate::metamodel::{FieldKind, ScalarCodec, TypeSpec};
use crate::object::{CollectionHandle, MaterializationState, NativeObject, NativeValue};
use crate::storage::{CollectionRecord, EmbeddedRecord, FieldValue, ObjectRecord};

/// What a surrogate needs from its session while it loads or flattens
/// itself: type shapes, the codec, and identity-map access for referenced
/// objects.
pub trait ObjectContext {
    fn type_spec(&mut self, type_tag: &str) -> Result<Arc<TypeSpec>>;

    fn codec(&self) -> &dyn ScalarCodec;

    /// The surrogate registered for `identity`, or a new ghost interned for it.
    fn ghost(&mut self, identity: &Identity) -> Result<SurrogateRef>;

    /// The parented surrogate registered for `identity`, or a new one owned
    /// by `root` with every field empty.
    fn embedded(&mut self, identity: &Identity, root: &SurrogateRef) -> Result<SurrogateRef>;

    fn record_exists(&self, identity: &Identity) -> Result<bool>;

    /// Identity to write for a reference. Lets a commit substitute the
    /// persistent identity of an object created in the same batch.
    fn stored_identity(&self, identity: &Identity) -> Identity {
        identity.without_version()
    }
}

/// A reference whose target record no longer exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub owner: Identity,
    pub field: String,
    pub target: Identity,
}

#[derive(Debug, Clone, Default)]
pub struct MaterializeOutcome {
    /// Already resolved; nothing was touched.
    pub skipped: bool,
    /// The surrogate was mid-load; the partially built object was returned.
    pub reentrant: bool,
    pub dangling: Vec<DanglingReference>,
}

impl MaterializeOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn reentrant() -> Self {
        Self {
            reentrant: true,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: MaterializeOutcome) {
        self.dangling.extend(other.dangling);
    }
}

/// Adapter pairing a native object with its identity and load state.
#[derive(Debug)]
pub struct Surrogate {
    native: NativeObject,
    identity: Option<Identity>,
    state: MaterializationState,
    version: Option<VersionStamp>,
    aggregate_root: Option<Weak<RefCell<Surrogate>>>,
}

/// Shared handle to a surrogate. Cloning the handle never clones the object.
#[derive(Clone)]
pub struct SurrogateRef(Rc<RefCell<Surrogate>>);

impl SurrogateRef {
    fn from_parts(
        native: NativeObject,
        identity: Option<Identity>,
        state: MaterializationState,
        aggregate_root: Option<&SurrogateRef>,
    ) -> Self {
        Self(Rc::new(RefCell::new(Surrogate {
            native,
            identity,
            state,
            version: None,
            aggregate_root: aggregate_root.map(|root| Rc::downgrade(&root.0)),
        })))
    }

    /// Fresh instance; the caller completes construction with `New -> Resolved`.
    pub(crate) fn new_instance(native: NativeObject, identity: Identity) -> Self {
        Self::from_parts(native, Some(identity), MaterializationState::New, None)
    }

    pub(crate) fn ghost(native: NativeObject, identity: Identity) -> Self {
        Self::from_parts(native, Some(identity), MaterializationState::Ghost, None)
    }

    pub(crate) fn transient(native: NativeObject, identity: Identity) -> Self {
        Self::from_parts(native, Some(identity), MaterializationState::Transient, None)
    }

    /// Pure value with no identity of its own.
    pub(crate) fn value(native: NativeObject) -> Self {
        Self::from_parts(native, None, MaterializationState::Resolved, None)
    }

    pub(crate) fn parented(native: NativeObject, identity: Identity, root: &SurrogateRef) -> Self {
        Self::from_parts(native, Some(identity), MaterializationState::Resolved, Some(root))
    }

    pub fn identity(&self) -> Option<Identity> {
        self.0.borrow().identity.clone()
    }

    pub fn type_tag(&self) -> String {
        self.0.borrow().native.type_tag().to_string()
    }

    /// The owning root for parented surrogates.
    pub fn aggregate_root(&self) -> Option<SurrogateRef> {
        self.0
            .borrow()
            .aggregate_root
            .as_ref()
            .and_then(Weak::upgrade)
            .map(SurrogateRef)
    }

    pub fn is_parented(&self) -> bool {
        self.0.borrow().aggregate_root.is_some()
    }

    pub fn is_value(&self) -> bool {
        self.0.borrow().identity.is_none()
    }

    /// The surrogate that owns lifecycle and version: the aggregate root for
    /// parented surrogates, `self` otherwise.
    pub fn lifecycle_owner(&self) -> SurrogateRef {
        self.aggregate_root().unwrap_or_else(|| self.clone())
    }

    pub fn state(&self) -> MaterializationState {
        if let Some(root) = self.aggregate_root() {
            return root.state();
        }
        let inner = self.0.borrow();
        if inner.identity.is_none() {
            MaterializationState::Resolved
        } else {
            inner.state
        }
    }

    pub fn version(&self) -> Option<VersionStamp> {
        if let Some(root) = self.aggregate_root() {
            return root.version();
        }
        self.0.borrow().version.clone()
    }

    /// Requests a state change. Parented surrogates and pure values accept
    /// and ignore every request; their state is derived.
    pub fn transition(&self, to: MaterializationState) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.aggregate_root.is_some() || inner.identity.is_none() {
            return Ok(());
        }
        inner.state = inner.state.transition(to)?;
        Ok(())
    }

    /// Moves to `Destroyed` unless already there.
    pub(crate) fn mark_destroyed(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.aggregate_root.is_none() && inner.identity.is_some() {
            inner.state = MaterializationState::Destroyed;
        }
    }

    pub(crate) fn set_version(&self, version: Option<VersionStamp>) {
        self.0.borrow_mut().version = version;
    }

    pub(crate) fn set_identity(&self, identity: Identity) {
        self.0.borrow_mut().identity = Some(identity);
    }

    /// Undoes a failed load so the object can be loaded again.
    fn reset_to_ghost(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.state == MaterializationState::Resolving {
            inner.state = MaterializationState::Ghost;
        }
    }

    pub fn native(&self) -> Ref<'_, NativeObject> {
        Ref::map(self.0.borrow(), |s| &s.native)
    }

    pub(crate) fn native_mut(&self) -> RefMut<'_, NativeObject> {
        RefMut::map(self.0.borrow_mut(), |s| &mut s.native)
    }

    pub fn ptr_eq(&self, other: &SurrogateRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn describe(&self) -> String {
        match self.identity() {
            Some(identity) => identity.to_string(),
            None => format!("value of {}", self.type_tag()),
        }
    }

    pub(crate) fn require_live(&self, operation: &'static str) -> Result<()> {
        if self.state().is_destroyed() {
            return Err(PersistError::IllegalStateAccess {
                identity: self.describe(),
                operation,
            });
        }
        Ok(())
    }

    /// Loads `record` into a ghost: `Ghost -> Resolving`, field population,
    /// stamp, `Resolving -> Resolved`.
    ///
    /// Referenced objects become ghosts; nothing is loaded recursively.
    /// Calling this on a resolved surrogate changes nothing, and calling it
    /// on one that is mid-load returns at once.
    pub fn materialize(
        &self,
        record: &ObjectRecord,
        ctx: &mut dyn ObjectContext,
    ) -> Result<MaterializeOutcome> {
        self.require_live("materialize")?;
        match self.state() {
            MaterializationState::Resolving => return Ok(MaterializeOutcome::reentrant()),
            MaterializationState::Resolved | MaterializationState::Updating => {
                return Ok(MaterializeOutcome::skipped());
            }
            _ => {}
        }
        if record.type_tag != self.type_tag() {
            return Err(PersistError::TypeMismatch(format!(
                "record of type '{}' cannot be loaded into {}",
                record.type_tag,
                self.describe()
            )));
        }
        self.transition(MaterializationState::Resolving)?;

        let mut outcome = MaterializeOutcome::default();
        let populated = ctx
            .type_spec(&record.type_tag)
            .and_then(|spec| populate(self, self, &spec, &record.fields, ctx, &mut outcome));
        if let Err(err) = populated {
            self.reset_to_ghost();
            return Err(err);
        }

        self.set_version(record.version.clone());
        self.transition(MaterializationState::Resolved)?;
        Ok(outcome)
    }

    /// Loads one to-many field without touching the owner's other fields.
    pub fn materialize_collection(
        &self,
        field: &str,
        record: &CollectionRecord,
        ctx: &mut dyn ObjectContext,
    ) -> Result<MaterializeOutcome> {
        self.require_live("materialize")?;
        let state = self
            .native()
            .collection(field)
            .map(CollectionHandle::state)
            .ok_or_else(|| PersistError::UnknownField {
                type_tag: self.type_tag(),
                field: field.to_string(),
            })?;
        if !state.can_transition(MaterializationState::Resolving) {
            return Ok(MaterializeOutcome::skipped());
        }
        let mut outcome = MaterializeOutcome::default();
        let owner = self.identity().ok_or_else(|| {
            PersistError::TypeMismatch("value objects have no stored collections".to_string())
        })?;
        let elements =
            resolve_elements(&owner, field, &record.element_identities, ctx, &mut outcome)?;
        if let Some(handle) = self.native_mut().collection_mut(field) {
            handle.install(elements)?;
        }
        Ok(outcome)
    }

    /// Flattens the persisted fields into the stored representation.
    pub fn flatten(&self, ctx: &mut dyn ObjectContext) -> Result<BTreeMap<String, FieldValue>> {
        let spec = ctx.type_spec(&self.type_tag())?;
        let native = self.native();
        let mut fields = BTreeMap::new();
        for descriptor in spec.persisted_fields() {
            let Some(value) = native.get(&descriptor.id) else {
                continue;
            };
            let stored = match value {
                NativeValue::Scalar(value) => Some(FieldValue::Scalar(ctx.codec().encode(value))),
                NativeValue::Reference(None) | NativeValue::Embedded(None) => None,
                NativeValue::Reference(Some(target)) => {
                    Some(FieldValue::Reference(stored_reference(target, ctx)?))
                }
                NativeValue::Collection(handle) => {
                    if handle.state() != MaterializationState::Resolved {
                        return Err(PersistError::StateViolation {
                            from: handle.state(),
                            to: MaterializationState::Resolved,
                        });
                    }
                    let targets = handle
                        .elements()
                        .iter()
                        .map(|element| stored_reference(element, ctx))
                        .collect::<Result<Vec<_>>>()?;
                    Some(FieldValue::References(targets))
                }
                NativeValue::Embedded(Some(child)) => Some(FieldValue::Embedded(EmbeddedRecord {
                    type_tag: child.type_tag(),
                    fields: child.flatten(ctx)?,
                })),
            };
            if let Some(stored) = stored {
                fields.insert(descriptor.id.clone(), stored);
            }
        }
        Ok(fields)
    }

    /// Rewrites identities after the root's first commit.
    pub(crate) fn reparent(&self, old_root: &Identity, new_root: &Identity) {
        let mut inner = self.0.borrow_mut();
        if let Some(moved) = inner
            .identity
            .as_ref()
            .and_then(|id| id.reparent(old_root, new_root))
        {
            inner.identity = Some(moved);
        }
        inner.native.reparent_collections(old_root, new_root);
    }

    /// Breaks reference cycles when a session ends.
    pub(crate) fn release(&self) {
        if let Ok(mut inner) = self.0.try_borrow_mut() {
            inner.native.release();
            inner.aggregate_root = None;
        }
    }
}

fn stored_reference(target: &SurrogateRef, ctx: &dyn ObjectContext) -> Result<Identity> {
    let identity = target.identity().ok_or_else(|| {
        PersistError::TypeMismatch(format!(
            "cannot store a reference to a value object of type '{}'",
            target.type_tag()
        ))
    })?;
    let stored = ctx.stored_identity(&identity);
    if stored.is_transient() {
        return Err(PersistError::Transaction(format!(
            "reference to {} which has not been created",
            identity
        )));
    }
    Ok(stored)
}

/// Resolves a referenced identity to a surrogate, forcing it to `Destroyed`
/// when its record is gone.
fn resolve_reference(
    owner: &Identity,
    field: &str,
    target: &Identity,
    ctx: &mut dyn ObjectContext,
    outcome: &mut MaterializeOutcome,
) -> Result<SurrogateRef> {
    if !target.is_root() {
        return Err(PersistError::TypeMismatch(format!(
            "field '{}' of {} references non-root {}",
            field, owner, target
        )));
    }
    let surrogate = ctx.ghost(target)?;
    if surrogate.state().is_ghost() && !ctx.record_exists(target)? {
        warn!(owner = %owner, field = %field, target = %target, "dangling reference");
        surrogate.mark_destroyed();
        outcome.dangling.push(DanglingReference {
            owner: owner.clone(),
            field: field.to_string(),
            target: target.clone(),
        });
    }
    Ok(surrogate)
}

fn resolve_elements(
    owner: &Identity,
    field: &str,
    targets: &[Identity],
    ctx: &mut dyn ObjectContext,
    outcome: &mut MaterializeOutcome,
) -> Result<Vec<SurrogateRef>> {
    targets
        .iter()
        .map(|target| resolve_reference(owner, field, target, ctx, outcome))
        .collect()
}

enum Install {
    Value(NativeValue),
    Elements(Vec<SurrogateRef>),
}

/// Builds every persisted field of `target` from `fields`, then installs
/// them under a single borrow. Nothing is borrowed while other surrogates
/// are being looked up, so self-references are safe.
fn populate(
    target: &SurrogateRef,
    root: &SurrogateRef,
    spec: &TypeSpec,
    fields: &BTreeMap<String, FieldValue>,
    ctx: &mut dyn ObjectContext,
    outcome: &mut MaterializeOutcome,
) -> Result<()> {
    let owner = target.identity().ok_or_else(|| {
        PersistError::TypeMismatch("cannot materialize a value object".to_string())
    })?;
    let mismatch = |field: &str, stored: &FieldValue| {
        PersistError::TypeMismatch(format!(
            "field '{}' of {} holds {:?}, which does not match its declaration",
            field, owner, stored
        ))
    };

    let mut installs = Vec::new();
    for descriptor in spec.persisted_fields() {
        let id = descriptor.id.as_str();
        let stored = fields.get(id);
        let install = match (&descriptor.kind, stored) {
            (FieldKind::Scalar(scalar_type), Some(FieldValue::Scalar(encoded))) => Install::Value(
                NativeValue::Scalar(ctx.codec().decode(encoded, *scalar_type)?),
            ),
            (FieldKind::Scalar(_), None) => Install::Value(NativeValue::Scalar(Value::Null)),
            (FieldKind::Reference { .. }, Some(FieldValue::Reference(reference))) => {
                let surrogate = resolve_reference(&owner, id, reference, ctx, outcome)?;
                Install::Value(NativeValue::Reference(Some(surrogate)))
            }
            (FieldKind::Reference { .. }, None) => Install::Value(NativeValue::Reference(None)),
            (FieldKind::Collection { .. }, stored) => {
                let loadable = target
                    .native()
                    .collection(id)
                    .is_some_and(|h| h.state().can_transition(MaterializationState::Resolving));
                if !loadable {
                    continue;
                }
                let targets: &[Identity] = match stored {
                    Some(FieldValue::References(targets)) => targets.as_slice(),
                    None => &[],
                    Some(other) => return Err(mismatch(id, other)),
                };
                Install::Elements(resolve_elements(&owner, id, targets, ctx, outcome)?)
            }
            (FieldKind::Embedded { type_tag }, Some(FieldValue::Embedded(embedded))) => {
                let child_identity = owner.child(type_tag.as_str(), id);
                let child = ctx.embedded(&child_identity, root)?;
                let child_spec = ctx.type_spec(&embedded.type_tag)?;
                populate(&child, root, &child_spec, &embedded.fields, ctx, outcome)?;
                Install::Value(NativeValue::Embedded(Some(child)))
            }
            (FieldKind::Embedded { .. }, None) => Install::Value(NativeValue::Embedded(None)),
            (_, Some(other)) => return Err(mismatch(id, other)),
        };
        installs.push((id, install));
    }

    let mut native = target.native_mut();
    for (id, install) in installs {
        match install {
            Install::Value(value) => native.set(id, value),
            Install::Elements(elements) => {
                if let Some(handle) = native.collection_mut(id) {
                    handle.install(elements)?;
                }
            }
        }
    }
    Ok(())
}

impl fmt::Debug for SurrogateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(inner) => f
                .debug_struct("SurrogateRef")
                .field("identity", &inner.identity)
                .field("type_tag", &inner.native.type_tag())
                .field("state", &inner.state)
                .finish(),
            Err(_) => f.write_str("SurrogateRef(<borrowed>)"),
        }
    }
}
