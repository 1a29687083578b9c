#![allow(missing_docs)]

use std::sync::Arc;

use sombra_session::{
    ClassKind, ClusterId, Entity, MemStorage, Record, RecordId, Result, SchemaClass, Session,
    SessionConfig, SessionOptions, StaticSchema, Value,
};

fn item(cluster: ClusterId, n: i64) -> Result<Record> {
    let mut entity = Entity::new();
    entity.set("n", n)?;
    Ok(Record::document(entity).in_cluster(cluster))
}

fn n_of(record: &Record) -> Option<i64> {
    match record.entity().and_then(|e| e.get("n")) {
        Some(Value::Int(n)) => Some(*n),
        _ => None,
    }
}

/// Session over one cluster holding committed records `0..count` at
/// positions `0..count`.
fn seeded(count: i64, config: SessionConfig) -> Result<(Session, ClusterId)> {
    let storage = Arc::new(MemStorage::new());
    let cluster = storage.add_cluster("items");
    let mut session = Session::open(SessionOptions::new(storage).config(config))?;
    session.for_each_in_tx(0..count, 64, |s, n| s.create(item(cluster, n)?).map(|_| ()))?;
    Ok((session, cluster))
}

fn scan(session: &mut Session, cluster: ClusterId, forward: bool) -> Result<Vec<i64>> {
    let iter = if forward {
        session.browse_cluster(cluster)?
    } else {
        session.browse_cluster_reverse(cluster)?
    };
    let mut seen = Vec::new();
    for record in iter {
        seen.extend(n_of(&record?));
    }
    Ok(seen)
}

#[test]
fn committed_records_scan_in_physical_order() -> Result<()> {
    let (mut session, cluster) = seeded(5, SessionConfig::default())?;
    assert_eq!(scan(&mut session, cluster, true)?, vec![0, 1, 2, 3, 4]);
    assert_eq!(scan(&mut session, cluster, false)?, vec![4, 3, 2, 1, 0]);
    Ok(())
}

#[test]
fn scans_merge_the_open_transaction() -> Result<()> {
    let (mut session, cluster) = seeded(5, SessionConfig::default())?;
    session.begin()?;
    session.delete(RecordId::new(cluster, 1))?;
    session.delete(RecordId::new(cluster, 3))?;
    session.create(item(cluster, 10)?)?;
    session.create(item(cluster, 11)?)?;

    // New records sort before persistent ones, newest first.
    assert_eq!(scan(&mut session, cluster, true)?, vec![11, 10, 0, 2, 4]);
    assert_eq!(scan(&mut session, cluster, false)?, vec![4, 2, 0, 10, 11]);
    assert_eq!(session.count_cluster(cluster)?, 5);
    Ok(())
}

#[test]
fn long_tombstone_runs_are_skipped_with_small_batches() -> Result<()> {
    let config = SessionConfig {
        navigation_batch: 2,
        ..SessionConfig::default()
    };
    let (mut session, cluster) = seeded(10, config)?;
    session.begin()?;
    for position in 1..9 {
        session.delete(RecordId::new(cluster, position))?;
    }
    let first = RecordId::new(cluster, 0);
    let last = RecordId::new(cluster, 9);
    assert_eq!(session.fetch_next(first)?, Some(last));
    assert_eq!(session.fetch_previous(last)?, Some(first));
    assert_eq!(scan(&mut session, cluster, true)?, vec![0, 9]);
    Ok(())
}

#[test]
fn deleting_the_edges_moves_first_and_last() -> Result<()> {
    let (mut session, cluster) = seeded(4, SessionConfig::default())?;
    session.begin()?;
    session.delete(RecordId::new(cluster, 0))?;
    session.delete(RecordId::new(cluster, 3))?;

    let (first, next) = session.first_in_cluster(cluster)?.expect("cluster is not empty");
    assert_eq!(n_of(&first), Some(1));
    assert_eq!(next, Some(RecordId::new(cluster, 2)));

    let (last, previous) = session.last_in_cluster(cluster)?.expect("cluster is not empty");
    assert_eq!(n_of(&last), Some(2));
    assert_eq!(previous, Some(RecordId::new(cluster, 1)));
    Ok(())
}

#[test]
fn read_record_resolves_neighbours_of_a_gap() -> Result<()> {
    let (mut session, cluster) = seeded(3, SessionConfig::default())?;
    session.begin()?;
    let middle = RecordId::new(cluster, 1);
    session.delete(middle)?;

    let result = session.read_record(middle, true, true, false)?;
    assert!(result.record.is_none());
    assert_eq!(result.previous, Some(RecordId::new(cluster, 0)));
    assert_eq!(result.next, Some(RecordId::new(cluster, 2)));
    assert!(session.read_record(middle, false, false, true).is_err());
    Ok(())
}

#[test]
fn load_and_step_continues_past_missing_ids() -> Result<()> {
    let (mut session, cluster) = seeded(3, SessionConfig::default())?;
    session.begin()?;
    session.delete(RecordId::new(cluster, 1))?;

    let (record, next) = session
        .load_record_and_next(RecordId::new(cluster, 1))?
        .expect("a live record follows");
    assert_eq!(n_of(&record), Some(2));
    assert_eq!(next, None);

    let (record, previous) = session
        .load_record_and_previous(RecordId::new(cluster, 1))?
        .expect("a live record precedes");
    assert_eq!(n_of(&record), Some(0));
    assert_eq!(previous, None);
    Ok(())
}

#[test]
fn empty_cluster_has_no_edges() -> Result<()> {
    let (mut session, cluster) = seeded(0, SessionConfig::default())?;
    assert!(session.first_in_cluster(cluster)?.is_none());
    assert!(session.last_in_cluster(cluster)?.is_none());
    assert!(scan(&mut session, cluster, true)?.is_empty());

    session.begin()?;
    let id = session.create(item(cluster, 7)?)?;
    let (record, next) = session.first_in_cluster(cluster)?.expect("staged record");
    assert_eq!(record.id(), id);
    assert_eq!(next, None);
    Ok(())
}

#[test]
fn class_scans_walk_every_cluster_of_the_hierarchy() -> Result<()> {
    let storage = Arc::new(MemStorage::new());
    let animals = storage.add_cluster("animal");
    let dogs = storage.add_cluster("dog");
    let schema = Arc::new(StaticSchema::new());
    schema.add_class(SchemaClass::new("Animal", ClassKind::Document).with_clusters([animals]))?;
    schema.add_class(
        SchemaClass::new("Dog", ClassKind::Document)
            .with_clusters([dogs])
            .with_superclass("Animal"),
    )?;
    let mut session = Session::open(SessionOptions::new(storage).schema(schema))?;

    session.execute_in_tx(|s| {
        for (class, n) in [("Animal", 1i64), ("Dog", 2), ("Animal", 3), ("Dog", 4)] {
            let mut entity = Entity::with_class(class);
            entity.set("n", n)?;
            s.create(Record::document(entity))?;
        }
        Ok(())
    })?;

    let collect = |session: &mut Session, polymorphic: bool, forward: bool| -> Result<Vec<i64>> {
        let mut seen = Vec::new();
        for record in session.browse_class("Animal", polymorphic, forward)? {
            seen.extend(n_of(&record?));
        }
        Ok(seen)
    };
    assert_eq!(collect(&mut session, false, true)?, vec![1, 3]);
    assert_eq!(collect(&mut session, true, true)?, vec![1, 3, 2, 4]);
    assert_eq!(collect(&mut session, true, false)?, vec![4, 2, 3, 1]);
    assert!(session.browse_class("Cat", true, true).is_err());
    Ok(())
}
