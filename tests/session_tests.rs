use chrono::NaiveDate;
use rustobjstore::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn invoice_types() -> Arc<TypeRegistry> {
    let types = TypeRegistry::new()
        .with(
            TypeSpec::new("Invoice")
                .scalar("number", ScalarType::Text)
                .scalar("amount", ScalarType::Float)
                .scalar("issued", ScalarType::Date)
                .scalar("paid", ScalarType::Boolean)
                .derived("display", ScalarType::Text)
                .reference("customer", "Customer"),
        )
        .unwrap()
        .with(TypeSpec::new("Customer").scalar("name", ScalarType::Text))
        .unwrap()
        .with(TypeSpec::new("Draft").transient().scalar("text", ScalarType::Text))
        .unwrap();
    Arc::new(types)
}

fn open(root: &Path, actor: &str) -> Session {
    Session::open(&SessionConfig::new(root).actor(actor), invoice_types()).unwrap()
}

fn create_invoice(session: &mut Session, number: &str, amount: f64) -> SurrogateRef {
    let invoice = session.create_instance("Invoice").unwrap();
    session.set_field(&invoice, "number", number).unwrap();
    session.set_field(&invoice, "amount", amount).unwrap();
    session.with_transaction(|s| s.create(&invoice)).unwrap();
    invoice
}

#[test]
fn created_object_reloads_as_ghost_then_resolves() {
    let dir = tempdir().unwrap();
    let issued = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

    {
        let mut session = open(dir.path(), "alice");
        let invoice = session.create_instance("Invoice").unwrap();
        assert!(invoice.identity().unwrap().is_transient());
        assert_eq!(invoice.state(), MaterializationState::Resolved);

        session.set_field(&invoice, "number", "INV-1").unwrap();
        session.set_field(&invoice, "amount", 120.5).unwrap();
        session.set_field(&invoice, "issued", issued).unwrap();
        session.set_field(&invoice, "paid", true).unwrap();

        session.begin_transaction().unwrap();
        session.create(&invoice).unwrap();
        session.commit().unwrap();

        assert_eq!(
            invoice.identity().unwrap(),
            Identity::root("Invoice", "1").unwrap()
        );
        assert_eq!(invoice.version().unwrap().sequence, 0);
    }

    let mut session = open(dir.path(), "bob");
    let identity = Identity::parse("Invoice#1").unwrap();
    let invoice = session.fetch(&identity).unwrap();
    assert_eq!(invoice.state(), MaterializationState::Ghost);
    assert!(invoice.version().is_none());

    let outcome = session.resolve(&invoice).unwrap();
    assert!(!outcome.skipped);
    assert!(outcome.dangling.is_empty());
    assert_eq!(invoice.state(), MaterializationState::Resolved);
    assert_eq!(invoice.version().unwrap().changed_by, UserId::from("alice"));

    assert_eq!(session.field(&invoice, "number").unwrap(), Value::from("INV-1"));
    assert_eq!(session.field(&invoice, "amount").unwrap(), Value::Float(120.5));
    assert_eq!(session.field(&invoice, "issued").unwrap(), Value::Date(issued));
    assert_eq!(session.field(&invoice, "paid").unwrap(), Value::Boolean(true));
    assert!(session.reference(&invoice, "customer").unwrap().is_none());

    // A second resolve leaves the loaded object alone.
    assert!(session.resolve(&invoice).unwrap().skipped);
}

#[test]
fn field_access_resolves_ghosts_on_demand() {
    let dir = tempdir().unwrap();
    {
        let mut session = open(dir.path(), "alice");
        create_invoice(&mut session, "INV-7", 7.0);
    }

    let mut session = open(dir.path(), "alice");
    let invoice = session.fetch(&Identity::root("Invoice", "1").unwrap()).unwrap();
    assert!(invoice.state().is_ghost());
    assert_eq!(session.field(&invoice, "number").unwrap(), Value::from("INV-7"));
    assert_eq!(invoice.state(), MaterializationState::Resolved);
}

#[test]
fn identity_map_hands_out_one_surrogate_per_identity() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path(), "alice");
    let created = create_invoice(&mut session, "INV-1", 1.0);
    let identity = created.identity().unwrap();

    let fetched = session.fetch(&identity).unwrap();
    assert!(fetched.ptr_eq(&created));

    // Version stamps are not part of identity equality.
    let stamped = identity.with_version(Some(VersionStamp::at(9, &UserId::from("x"))));
    assert!(session.fetch(&stamped).unwrap().ptr_eq(&created));

    let mut other = open(dir.path(), "alice");
    let first = other.fetch(&identity).unwrap();
    let second = other.fetch(&identity).unwrap();
    assert!(first.ptr_eq(&second));
    assert!(!first.ptr_eq(&created));
    assert_eq!(other.identity_map().len(), 1);
}

#[test]
fn instances_materialize_every_record_once() {
    let dir = tempdir().unwrap();
    {
        let mut session = open(dir.path(), "alice");
        for n in 1..=3 {
            create_invoice(&mut session, &format!("INV-{}", n), n as f64);
        }
    }

    let mut session = open(dir.path(), "alice");
    let ghost = session.fetch(&Identity::root("Invoice", "2").unwrap()).unwrap();

    let query = Query::All;
    let found: Vec<SurrogateRef> = session
        .instances("Invoice", &query)
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();

    assert_eq!(found.len(), 3);
    assert!(found.iter().all(|s| s.state() == MaterializationState::Resolved));
    let ids: Vec<String> = found.iter().map(|s| s.identity().unwrap().to_string()).collect();
    assert_eq!(ids, vec!["Invoice#1", "Invoice#2", "Invoice#3"]);
    assert!(!found[0].ptr_eq(&found[2]));
    assert!(found[1].ptr_eq(&ghost));
    assert_eq!(session.instance_count("Invoice").unwrap(), 3);
}

#[test]
fn two_sessions_conflict_on_stale_version() {
    let dir = tempdir().unwrap();
    let identity = Identity::root("Invoice", "1").unwrap();

    {
        let mut session = open(dir.path(), "alice");
        let invoice = create_invoice(&mut session, "INV-1", 10.0);
        for amount in [11.0, 12.0] {
            session.set_field(&invoice, "amount", amount).unwrap();
            session.with_transaction(|s| s.save(&invoice)).unwrap();
        }
        assert_eq!(invoice.version().unwrap().sequence, 2);
    }

    let mut session_a = open(dir.path(), "alice");
    let mut session_b = open(dir.path(), "bob");
    let in_a = session_a.fetch(&identity).unwrap();
    let in_b = session_b.fetch(&identity).unwrap();
    session_a.resolve(&in_a).unwrap();
    session_b.resolve(&in_b).unwrap();
    assert_eq!(in_a.version().unwrap().sequence, 2);
    assert_eq!(in_b.version().unwrap().sequence, 2);

    session_a.set_field(&in_a, "amount", 13.0).unwrap();
    session_a.with_transaction(|s| s.save(&in_a)).unwrap();
    assert_eq!(in_a.version().unwrap().sequence, 3);

    session_b.set_field(&in_b, "amount", 99.0).unwrap();
    let err = session_b.with_transaction(|s| s.save(&in_b)).unwrap_err();
    match err {
        PersistError::ConcurrencyConflict {
            actor,
            identity: conflicted,
            expected,
            found,
        } => {
            assert_eq!((expected, found), (2, 3));
            assert_eq!(actor, UserId::from("alice"));
            assert_eq!(conflicted, identity);
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
    assert_eq!(in_b.version().unwrap().sequence, 2);
    assert_eq!(in_b.state(), MaterializationState::Resolved);
    assert!(session_b.active_transaction().is_none());

    let mut reader = open(dir.path(), "carol");
    let stored = reader.fetch(&identity).unwrap();
    assert_eq!(reader.field(&stored, "amount").unwrap(), Value::Float(13.0));
    assert_eq!(stored.version().unwrap().sequence, 3);
}

#[test]
fn failed_batch_applies_none_of_its_writes() {
    let dir = tempdir().unwrap();
    let identity = Identity::root("Invoice", "1").unwrap();
    {
        let mut session = open(dir.path(), "alice");
        create_invoice(&mut session, "INV-1", 10.0);
    }

    let mut stale = open(dir.path(), "bob");
    let old = stale.fetch(&identity).unwrap();
    stale.resolve(&old).unwrap();

    {
        let mut session = open(dir.path(), "alice");
        let invoice = session.fetch(&identity).unwrap();
        session.set_field(&invoice, "amount", 20.0).unwrap();
        session.with_transaction(|s| s.save(&invoice)).unwrap();
    }

    let fresh = stale.create_instance("Invoice").unwrap();
    stale.set_field(&fresh, "number", "INV-2").unwrap();
    stale.set_field(&old, "amount", 30.0).unwrap();
    let err = stale
        .with_transaction(|s| {
            s.create(&fresh)?;
            s.save(&old)
        })
        .unwrap_err();
    assert!(matches!(err, PersistError::ConcurrencyConflict { .. }));
    assert!(fresh.identity().unwrap().is_transient());
    assert_eq!(stale.instance_count("Invoice").unwrap(), 1);
}

#[test]
fn destroyed_objects_refuse_further_use() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path(), "alice");
    let invoice = create_invoice(&mut session, "INV-1", 1.0);
    let identity = invoice.identity().unwrap();

    session.with_transaction(|s| s.destroy(&invoice)).unwrap();
    assert_eq!(invoice.state(), MaterializationState::Destroyed);
    assert_eq!(session.instance_count("Invoice").unwrap(), 0);

    let err = session.set_field(&invoice, "amount", 2.0).unwrap_err();
    assert!(err.is_contract_breach());
    assert!(matches!(
        session.fetch(&identity),
        Err(PersistError::ObjectNotFound(_))
    ));
    assert!(matches!(
        session.with_transaction(|s| s.save(&invoice)),
        Err(PersistError::IllegalStateAccess { .. })
    ));
}

#[test]
fn resolving_a_vanished_record_marks_it_destroyed() {
    let dir = tempdir().unwrap();
    let identity = Identity::root("Invoice", "1").unwrap();
    {
        let mut session = open(dir.path(), "alice");
        create_invoice(&mut session, "INV-1", 1.0);
    }

    let mut reader = open(dir.path(), "bob");
    let ghost = reader.fetch(&identity).unwrap();
    {
        let mut session = open(dir.path(), "alice");
        let invoice = session.fetch(&identity).unwrap();
        session.with_transaction(|s| s.destroy(&invoice)).unwrap();
    }

    assert!(matches!(
        reader.resolve(&ghost),
        Err(PersistError::ObjectNotFound(_))
    ));
    assert_eq!(ghost.state(), MaterializationState::Destroyed);
}

#[test]
fn unknown_identities_are_not_found() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path(), "alice");
    let err = session
        .fetch(&Identity::root("Invoice", "42").unwrap())
        .unwrap_err();
    assert!(matches!(err, PersistError::ObjectNotFound(_)));
    assert!(session.identity_map().is_empty());
}

#[test]
fn saving_a_ghost_writes_nothing() {
    let dir = tempdir().unwrap();
    let identity = Identity::root("Invoice", "1").unwrap();
    {
        let mut session = open(dir.path(), "alice");
        create_invoice(&mut session, "INV-1", 1.0);
    }

    let mut session = open(dir.path(), "bob");
    let ghost = session.fetch(&identity).unwrap();
    session.begin_transaction().unwrap();
    session.save(&ghost).unwrap();
    assert_eq!(session.active_transaction().unwrap().command_count(), 0);
    assert!(session.commit().unwrap().is_empty());
    assert!(ghost.state().is_ghost());
}

#[test]
fn field_writes_are_type_checked() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path(), "alice");
    let invoice = session.create_instance("Invoice").unwrap();

    assert!(matches!(
        session.set_field(&invoice, "amount", "lots"),
        Err(PersistError::TypeMismatch(_))
    ));
    assert!(matches!(
        session.set_field(&invoice, "missing", 1i64),
        Err(PersistError::UnknownField { .. })
    ));
    assert!(matches!(
        session.field(&invoice, "customer"),
        Err(PersistError::TypeMismatch(_))
    ));
    session.set_field(&invoice, "amount", Value::Null).unwrap();
    assert_eq!(session.field(&invoice, "amount").unwrap(), Value::Null);
}

#[test]
fn transient_types_stay_out_of_the_store() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path(), "alice");

    assert!(matches!(
        session.create_instance("Draft"),
        Err(PersistError::NotPersistable(_))
    ));
    let draft = session.create_transient("Draft").unwrap();
    assert_eq!(draft.state(), MaterializationState::Transient);
    session.set_field(&draft, "text", "scratch").unwrap();
    assert_eq!(session.field(&draft, "text").unwrap(), Value::from("scratch"));
    assert!(session.identity_map().is_empty());

    session.begin_transaction().unwrap();
    assert!(matches!(
        session.create(&draft),
        Err(PersistError::NotPersistable(_))
    ));
    session.abort().unwrap();

    assert!(matches!(
        session.create_transient("Invoice"),
        Err(PersistError::TypeMismatch(_))
    ));
    assert!(matches!(
        session.create_instance("Nope"),
        Err(PersistError::UnknownType(_))
    ));
}

#[test]
fn creating_a_persisted_object_twice_is_rejected() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path(), "alice");
    let invoice = create_invoice(&mut session, "INV-1", 1.0);

    let err = session.with_transaction(|s| s.create(&invoice)).unwrap_err();
    assert!(matches!(err, PersistError::DuplicateIdentity(_)));
    assert_eq!(session.instance_count("Invoice").unwrap(), 1);
}

#[test]
fn failed_work_aborts_the_transaction() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path(), "alice");
    let invoice = session.create_instance("Invoice").unwrap();

    let err = session
        .with_transaction(|s| {
            s.create(&invoice)?;
            Err::<(), _>(PersistError::Transaction("caller gave up".to_string()))
        })
        .unwrap_err();
    assert!(matches!(err, PersistError::Transaction(_)));
    assert!(session.active_transaction().is_none());
    assert_eq!(session.instance_count("Invoice").unwrap(), 0);
    assert!(invoice.identity().unwrap().is_transient());
}

#[test]
fn commands_need_an_active_transaction() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path(), "alice");
    let invoice = session.create_instance("Invoice").unwrap();

    assert!(matches!(
        session.create(&invoice),
        Err(PersistError::Transaction(_))
    ));
    assert!(matches!(session.commit(), Err(PersistError::Transaction(_))));

    session.begin_transaction().unwrap();
    assert!(matches!(
        session.begin_transaction(),
        Err(PersistError::Transaction(_))
    ));
    session.abort().unwrap();
    assert!(matches!(session.abort(), Err(PersistError::Transaction(_))));
}

#[test]
fn closed_sessions_reject_work() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path(), "alice");
    let invoice = create_invoice(&mut session, "INV-1", 1.0);
    let identity = invoice.identity().unwrap();

    session.begin_transaction().unwrap();
    session.close().unwrap();
    assert!(!session.is_open());
    assert!(session.active_transaction().is_none());
    assert!(session.identity_map().is_empty());
    session.close().unwrap();

    assert!(matches!(session.fetch(&identity), Err(PersistError::SessionClosed)));
    assert!(matches!(
        session.create_instance("Invoice"),
        Err(PersistError::SessionClosed)
    ));
    assert!(matches!(
        session.begin_transaction(),
        Err(PersistError::SessionClosed)
    ));
    assert!(matches!(
        session.instance_count("Invoice"),
        Err(PersistError::SessionClosed)
    ));
}

#[test]
fn derived_fields_are_not_persisted() {
    let dir = tempdir().unwrap();
    let identity = Identity::root("Invoice", "1").unwrap();
    {
        let mut session = open(dir.path(), "alice");
        let invoice = session.create_instance("Invoice").unwrap();
        session.set_field(&invoice, "number", "INV-1").unwrap();
        session.set_field(&invoice, "display", "Invoice INV-1").unwrap();
        session.with_transaction(|s| s.create(&invoice)).unwrap();
    }

    let mut session = open(dir.path(), "alice");
    let invoice = session.fetch(&identity).unwrap();
    assert_eq!(session.field(&invoice, "display").unwrap(), Value::Null);
    assert_eq!(session.field(&invoice, "number").unwrap(), Value::from("INV-1"));
}

#[test]
fn connect_opens_an_in_memory_session() {
    let mut session = rustobjstore::connect("objstore://alice@memory", invoice_types()).unwrap();
    assert_eq!(session.actor(), &UserId::from("alice"));

    let invoice = create_invoice(&mut session, "INV-1", 5.0);
    assert_eq!(invoice.identity().unwrap().to_string(), "Invoice#1");
    assert_eq!(session.instance_count("Invoice").unwrap(), 1);

    assert!(matches!(
        rustobjstore::connect("postgres://localhost/db", invoice_types()),
        Err(PersistError::StoreError(_))
    ));
}

#[test]
fn execute_applies_commands_without_a_transaction() {
    use rustobjstore::prelude::advanced::{AppliedWrite, RecordCommand};

    let dir = tempdir().unwrap();
    let mut session = open(dir.path(), "alice");
    let first = session.create_instance("Invoice").unwrap();
    let second = session.create_instance("Invoice").unwrap();
    session.set_field(&first, "number", "INV-1").unwrap();
    session.set_field(&second, "number", "INV-2").unwrap();

    let applied = session
        .execute(vec![
            RecordCommand::create(first.clone()),
            RecordCommand::create(second.clone()),
            RecordCommand::update(first.clone()),
        ])
        .unwrap();
    assert_eq!(applied.len(), 2);
    assert!(matches!(&applied[1], AppliedWrite::Created { identity, .. } if identity.local_id() == "2"));
    assert!(session.active_transaction().is_none());

    let applied = session
        .execute(vec![RecordCommand::destroy(first.clone())])
        .unwrap();
    assert!(matches!(&applied[0], AppliedWrite::Destroyed { .. }));
    assert_eq!(first.state(), MaterializationState::Destroyed);
    assert_eq!(session.instance_count("Invoice").unwrap(), 1);
}
