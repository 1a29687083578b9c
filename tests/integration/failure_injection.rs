#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use sombra_session::storage::memory::Fault;
use sombra_session::{
    ClusterId, Entity, MemStorage, Record, RecordId, Result, Session, SessionError,
    SessionOptions, Storage, StorageError, Transaction, TxListener,
};

fn item(cluster: ClusterId, n: i64) -> Result<Record> {
    let mut entity = Entity::new();
    entity.set("n", n)?;
    Ok(Record::document(entity).in_cluster(cluster))
}

/// Storage with `count` committed records and a session over it.
fn seeded(count: i64) -> Result<(Arc<MemStorage>, Session, ClusterId)> {
    let storage = Arc::new(MemStorage::new());
    let cluster = storage.add_cluster("items");
    let mut session = Session::open(SessionOptions::new(storage.clone()))?;
    session.for_each_in_tx(0..count, 32, |s, n| s.create(item(cluster, n)?).map(|_| ()))?;
    Ok((storage, session, cluster))
}

#[derive(Default)]
struct RollbackSizes(Mutex<Vec<usize>>);

impl TxListener for RollbackSizes {
    fn on_before_rollback(&self, tx: &Transaction) -> Result<()> {
        self.0.lock().push(tx.len());
        Ok(())
    }
}

#[test]
fn failed_commit_rolls_back_and_keeps_the_cache_clean() -> Result<()> {
    let (storage, mut session, cluster) = seeded(0)?;
    let sizes = Arc::new(RollbackSizes::default());
    session.register_listener(sizes.clone());

    session.begin()?;
    let temp = session.create(item(cluster, 1)?)?;
    storage.inject(Fault::Commit);
    let err = session.commit().unwrap_err();
    assert!(matches!(err, SessionError::Storage(StorageError::Other(_))));
    assert!(!session.is_tx_active());
    assert_eq!(storage.count_records(cluster)?, 0);
    assert!(session.local_cache().is_empty());
    assert_eq!(session.refresh_id(temp), temp);
    assert_eq!(*sizes.0.lock(), vec![1]);

    // The fault is one-shot.
    session.execute_in_tx(|s| s.create(item(cluster, 2)?).map(|_| ()))?;
    assert_eq!(storage.count_records(cluster)?, 1);
    Ok(())
}

#[test]
fn read_failure_inside_a_transaction_rolls_it_back() -> Result<()> {
    let (storage, mut session, cluster) = seeded(2)?;
    let id = RecordId::new(cluster, 1);
    session.unload(id);

    session.begin()?;
    session.create(item(cluster, 9)?)?;
    storage.inject(Fault::Read { after: 0 });
    let err = session.load(id).unwrap_err();
    assert!(matches!(err, SessionError::Storage(StorageError::Timeout(_))));
    assert!(!session.is_tx_active());
    assert_eq!(storage.count_records(cluster)?, 2);
    Ok(())
}

#[test]
fn missing_records_do_not_abort_the_transaction() -> Result<()> {
    let (_, mut session, cluster) = seeded(1)?;
    session.begin()?;
    let ghost = RecordId::new(cluster, 42);
    assert!(session.load_or_null(ghost)?.is_none());
    assert!(matches!(session.load(ghost), Err(SessionError::NotFound(_))));
    assert!(matches!(
        session.update(ghost, |_| Ok(())),
        Err(SessionError::NotFound(_))
    ));
    assert!(session.is_tx_active());
    Ok(())
}

#[test]
fn scan_stops_at_the_first_storage_error() -> Result<()> {
    let (storage, mut session, cluster) = seeded(6)?;
    session.invalidate_cluster(cluster);
    storage.inject(Fault::Read { after: 3 });

    let results: Vec<Result<Record>> = session.browse_cluster(cluster)?.collect();
    assert!(results.len() < 6);
    let (last, rest) = results.split_last().expect("scan yielded something");
    assert!(matches!(
        last,
        Err(SessionError::Storage(StorageError::Timeout(_)))
    ));
    assert!(rest.iter().all(Result::is_ok));
    Ok(())
}

#[test]
fn corrupted_records_are_reported() -> Result<()> {
    let (storage, mut session, cluster) = seeded(1)?;
    let id = RecordId::new(cluster, 0);
    assert!(storage.corrupt(id));

    // The committed copy is still cached.
    assert!(session.load(id).is_ok());
    session.unload(id);
    assert!(matches!(
        session.load(id),
        Err(SessionError::Storage(StorageError::ChecksumMismatch(_)))
    ));
    Ok(())
}

#[test]
fn concurrent_modification_is_detected_at_commit() -> Result<()> {
    let (storage, mut first, cluster) = seeded(1)?;
    let mut second = Session::open(SessionOptions::new(storage.clone()))?;
    let id = RecordId::new(cluster, 0);
    second.load(id)?;

    first.execute_in_tx(|s| {
        s.update(id, |r| {
            r.expect_entity_mut()?.set("n", 10i64)?;
            Ok(())
        })
    })?;

    second.begin()?;
    second.update(id, |r| {
        r.expect_entity_mut()?.set("n", 20i64)?;
        Ok(())
    })?;
    let err = second.commit().unwrap_err();
    assert!(matches!(
        err,
        SessionError::Storage(StorageError::ConcurrentModification {
            expected: 1,
            actual: 2,
            ..
        })
    ));
    assert!(!second.is_tx_active());

    // A fresh read picks up the winner and the retry goes through.
    second.unload(id);
    second.execute_in_tx(|s| {
        s.update(id, |r| {
            r.expect_entity_mut()?.set("n", 20i64)?;
            Ok(())
        })
    })?;
    assert_eq!(second.load(id)?.version(), 3);
    Ok(())
}

#[test]
fn sessions_on_separate_threads_share_storage() -> Result<()> {
    let storage = Arc::new(MemStorage::new());
    let clusters: Vec<ClusterId> = (0..4)
        .map(|i| storage.add_cluster(&format!("writer{i}")))
        .collect();

    thread::scope(|scope| {
        let writers: Vec<_> = clusters
            .iter()
            .map(|&cluster| {
                let storage = storage.clone();
                scope.spawn(move || -> Result<()> {
                    let mut session = Session::open(SessionOptions::new(storage))?;
                    session.for_each_in_tx(0..50i64, 8, |s, n| {
                        s.create(item(cluster, n)?).map(|_| ())
                    })
                })
            })
            .collect();
        writers
            .into_iter()
            .try_for_each(|writer| writer.join().expect("writer panicked"))
    })?;

    for cluster in clusters {
        assert_eq!(storage.count_records(cluster)?, 50);
    }
    Ok(())
}
