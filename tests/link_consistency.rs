#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use sombra_session::session::CounterMetrics;
use sombra_session::{
    ClusterId, Entity, LinkList, LinkMap, MemStorage, Record, RecordId, Result, Session,
    SessionError, SessionOptions, Value,
};

struct Fixture {
    session: Session,
    cluster: ClusterId,
    metrics: Arc<CounterMetrics>,
}

fn fixture(link_consistency: bool) -> Result<Fixture> {
    let storage = Arc::new(MemStorage::new());
    let cluster = storage.add_cluster("people");
    let metrics = Arc::new(CounterMetrics::default());
    let session = Session::open(
        SessionOptions::new(storage)
            .metrics(metrics.clone())
            .link_consistency(link_consistency),
    )?;
    Ok(Fixture {
        session,
        cluster,
        metrics,
    })
}

fn person(cluster: ClusterId, props: Vec<(&str, Value)>) -> Result<Record> {
    let mut entity = Entity::new();
    for (name, value) in props {
        entity.set(name, value)?;
    }
    Ok(Record::document(entity).in_cluster(cluster))
}

fn referrers(session: &mut Session, id: RecordId, forward: &str) -> Result<Vec<(RecordId, u32)>> {
    let record = session.load(id)?;
    Ok(record
        .entity()
        .and_then(|e| e.reverse_links(forward))
        .map(|bag| bag.entries())
        .unwrap_or_default())
}

#[test]
fn new_links_register_on_their_targets() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        metrics,
    } = fixture(true)?;
    session.begin()?;
    let bob = session.create(person(cluster, vec![])?)?;
    let carol = session.create(person(cluster, vec![])?)?;
    let alice = session.create(person(
        cluster,
        vec![
            ("friend", Value::Link(bob)),
            ("refs", LinkList::from_iter([bob, carol, bob]).into()),
        ],
    )?)?;

    assert_eq!(referrers(&mut session, bob, "friend")?, vec![(alice, 1)]);
    assert_eq!(referrers(&mut session, bob, "refs")?, vec![(alice, 2)]);
    assert_eq!(referrers(&mut session, carol, "refs")?, vec![(alice, 1)]);
    assert_eq!(metrics.reverse_links_added.load(Ordering::Relaxed), 4);
    Ok(())
}

#[test]
fn in_place_edits_adjust_counts() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        ..
    } = fixture(true)?;
    session.begin()?;
    let bob = session.create(person(cluster, vec![])?)?;
    let carol = session.create(person(cluster, vec![])?)?;
    let alice = session.create(person(
        cluster,
        vec![("refs", LinkList::from_iter([bob, bob]).into())],
    )?)?;

    session.update(alice, |r| {
        let refs = r.expect_entity_mut()?.link_list_mut("refs")?;
        refs.remove(bob);
        refs.push(carol);
        refs.push(carol);
        Ok(())
    })?;
    assert_eq!(referrers(&mut session, bob, "refs")?, vec![(alice, 1)]);
    assert_eq!(referrers(&mut session, carol, "refs")?, vec![(alice, 2)]);
    Ok(())
}

#[test]
fn replacing_and_removing_properties_move_links() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        ..
    } = fixture(true)?;
    session.begin()?;
    let bob = session.create(person(cluster, vec![])?)?;
    let carol = session.create(person(cluster, vec![])?)?;
    let alice = session.create(person(cluster, vec![("friend", Value::Link(bob))])?)?;

    session.update(alice, |r| {
        r.expect_entity_mut()?.set("friend", carol)?;
        Ok(())
    })?;
    assert!(referrers(&mut session, bob, "friend")?.is_empty());
    assert_eq!(referrers(&mut session, carol, "friend")?, vec![(alice, 1)]);

    session.update(alice, |r| {
        r.expect_entity_mut()?.remove("friend")?;
        Ok(())
    })?;
    assert!(referrers(&mut session, carol, "friend")?.is_empty());
    Ok(())
}

#[test]
fn link_maps_are_tracked_by_value() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        ..
    } = fixture(true)?;
    session.begin()?;
    let bob = session.create(person(cluster, vec![])?)?;
    let alice = session.create(person(
        cluster,
        vec![("roles", LinkMap::from_iter([("mentor", bob)]).into())],
    )?)?;
    assert_eq!(referrers(&mut session, bob, "roles")?, vec![(alice, 1)]);

    session.update(alice, |r| {
        r.expect_entity_mut()?.link_map_mut("roles")?.remove("mentor");
        Ok(())
    })?;
    assert!(referrers(&mut session, bob, "roles")?.is_empty());
    Ok(())
}

#[test]
fn deleting_a_target_detaches_every_referrer() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        ..
    } = fixture(true)?;
    session.begin()?;
    let bob = session.create(person(cluster, vec![])?)?;
    let carol = session.create(person(cluster, vec![])?)?;
    let alice = session.create(person(
        cluster,
        vec![
            ("friend", Value::Link(bob)),
            ("refs", LinkList::from_iter([bob, carol, bob]).into()),
        ],
    )?)?;
    session.commit()?;
    let (alice, bob, carol) = (
        session.refresh_id(alice),
        session.refresh_id(bob),
        session.refresh_id(carol),
    );

    session.begin()?;
    session.delete(bob)?;
    let record = session.load(alice)?;
    let entity = record.entity().expect("document");
    assert_eq!(entity.get("friend"), Some(&Value::Null));
    assert_eq!(
        entity.get("refs"),
        Some(&Value::LinkList(LinkList::from_iter([carol])))
    );
    session.commit()?;

    session.unload(alice);
    let reloaded = session.load(alice)?;
    assert_eq!(reloaded.entity().and_then(|e| e.get("friend")), Some(&Value::Null));
    assert_eq!(referrers(&mut session, carol, "refs")?, vec![(alice, 1)]);
    Ok(())
}

#[test]
fn deleting_a_source_cleans_its_targets() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        metrics,
    } = fixture(true)?;
    session.begin()?;
    let bob = session.create(person(cluster, vec![])?)?;
    let alice = session.create(person(cluster, vec![("friend", Value::Link(bob))])?)?;
    session.delete(alice)?;
    assert!(referrers(&mut session, bob, "friend")?.is_empty());
    assert_eq!(metrics.reverse_links_removed.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn links_survive_commit_with_permanent_ids() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        ..
    } = fixture(true)?;
    session.begin()?;
    let bob = session.create(person(cluster, vec![])?)?;
    let alice = session.create(person(cluster, vec![("friend", Value::Link(bob))])?)?;
    session.commit()?;
    let (alice, bob) = (session.refresh_id(alice), session.refresh_id(bob));

    session.unload(bob);
    assert_eq!(referrers(&mut session, bob, "friend")?, vec![(alice, 1)]);

    session.execute_in_tx(|s| {
        s.update(alice, |r| {
            r.expect_entity_mut()?.set("friend", Value::Null)?;
            Ok(())
        })
    })?;
    session.unload(bob);
    assert!(referrers(&mut session, bob, "friend")?.is_empty());
    Ok(())
}

#[test]
fn linking_to_a_deleted_record_is_an_integrity_violation() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        ..
    } = fixture(true)?;
    let bob = session.compute_in_tx(|s| s.create(person(cluster, vec![])?))?;
    let bob = session.refresh_id(bob);

    session.begin()?;
    session.delete(bob)?;
    let err = session
        .create(person(cluster, vec![("friend", Value::Link(bob))])?)
        .unwrap_err();
    assert!(matches!(err, SessionError::IntegrityViolation(_)));
    assert!(!session.is_tx_active());
    assert!(session.exists(bob)?);
    Ok(())
}

#[test]
fn missing_reverse_bag_is_an_integrity_violation() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        ..
    } = fixture(false)?;
    session.begin()?;
    let bob = session.create(person(cluster, vec![])?)?;
    let alice = session.create(person(cluster, vec![("friend", Value::Link(bob))])?)?;
    session.commit()?;
    let alice = session.refresh_id(alice);

    session.set_link_consistency(true);
    session.begin()?;
    let err = session
        .update(alice, |r| {
            r.expect_entity_mut()?.remove("friend")?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, SessionError::IntegrityViolation(_)));
    assert!(!session.is_tx_active());
    Ok(())
}

#[test]
fn disabled_maintenance_leaves_targets_alone() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        metrics,
    } = fixture(false)?;
    assert!(!session.is_link_consistency_enabled());
    session.begin()?;
    let bob = session.create(person(cluster, vec![])?)?;
    session.create(person(cluster, vec![("friend", Value::Link(bob))])?)?;
    assert!(referrers(&mut session, bob, "friend")?.is_empty());
    assert_eq!(metrics.reverse_links_added.load(Ordering::Relaxed), 0);
    Ok(())
}

#[test]
fn self_links_get_no_reverse_entry() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        ..
    } = fixture(true)?;
    session.begin()?;
    let alice = session.create(person(cluster, vec![])?)?;
    session.update(alice, |r| {
        r.expect_entity_mut()?.set("friend", alice)?;
        Ok(())
    })?;
    assert!(referrers(&mut session, alice, "friend")?.is_empty());
    session.delete(alice)?;
    session.commit()?;
    Ok(())
}

#[test]
fn edge_protocol_properties_are_not_maintained() -> Result<()> {
    let Fixture {
        mut session,
        cluster,
        ..
    } = fixture(true)?;
    session.begin()?;
    let bob = session.create(Record::vertex(Entity::new()).in_cluster(cluster))?;
    let mut entity = Entity::new();
    entity.set("out_knows", bob)?;
    entity.set("likes", bob)?;
    let alice = session.create(Record::vertex(entity).in_cluster(cluster))?;

    assert!(referrers(&mut session, bob, "out_knows")?.is_empty());
    assert_eq!(referrers(&mut session, bob, "likes")?, vec![(alice, 1)]);
    Ok(())
}
