use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::record::RecordKind;
use crate::storage::{CommitBatch, CommitOutcome, IdMap, RawRecord, Storage};
use crate::tx::OperationKind;
use crate::types::checksum::{record_crc32, verify_record};
use crate::types::{ClusterId, RecordId, Result, StorageError};

/// Failure to inject into the next matching storage call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The next commit fails before applying anything.
    Commit,
    /// The read or neighbour query after `after` successful ones fails.
    Read {
        /// Successful calls to let through first.
        after: usize,
    },
}

#[derive(Default)]
struct Faults {
    commit: bool,
    reads_left: Option<usize>,
}

struct StoredRecord {
    kind: RecordKind,
    version: i32,
    buffer: Vec<u8>,
    crc: u32,
}

struct Cluster {
    name: String,
    records: BTreeMap<i64, StoredRecord>,
    next_position: i64,
}

#[derive(Default)]
struct State {
    clusters: BTreeMap<ClusterId, Cluster>,
}

impl State {
    fn cluster(&self, id: ClusterId) -> Result<&Cluster> {
        Ok(self
            .clusters
            .get(&id)
            .ok_or(StorageError::UnknownCluster(id))?)
    }
}

/// Thread-safe, in-process storage engine.
///
/// Positions inside a cluster are handed out in increasing order and never
/// reused. Updates and deletes carry the version the transaction read and
/// fail with [`StorageError::ConcurrentModification`] if it moved on.
#[derive(Default)]
pub struct MemStorage {
    state: RwLock<State>,
    faults: Mutex<Faults>,
}

impl MemStorage {
    /// Empty storage without clusters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cluster and returns its id; an existing name returns the existing id.
    pub fn add_cluster(&self, name: &str) -> ClusterId {
        let mut state = self.state.write();
        if let Some((id, _)) = state.clusters.iter().find(|(_, c)| c.name == name) {
            return *id;
        }
        let id = state
            .clusters
            .keys()
            .next_back()
            .map_or(0, |last| last + 1);
        state.clusters.insert(
            id,
            Cluster {
                name: name.to_owned(),
                records: BTreeMap::new(),
                next_position: 0,
            },
        );
        debug!(cluster = id, name, "storage.cluster_added");
        id
    }

    /// Cluster id registered under `name`.
    pub fn cluster_id(&self, name: &str) -> Option<ClusterId> {
        self.state
            .read()
            .clusters
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, _)| *id)
    }

    /// Arms a one-shot failure.
    pub fn inject(&self, fault: Fault) {
        let mut faults = self.faults.lock();
        match fault {
            Fault::Commit => faults.commit = true,
            Fault::Read { after } => faults.reads_left = Some(after),
        }
    }

    /// Disarms every pending failure.
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Flips one byte of a stored buffer; used to exercise checksum validation.
    pub fn corrupt(&self, id: RecordId) -> bool {
        let mut state = self.state.write();
        let stored = state
            .clusters
            .get_mut(&id.cluster())
            .and_then(|c| c.records.get_mut(&id.position()));
        match stored {
            Some(stored) => {
                match stored.buffer.first_mut() {
                    Some(byte) => *byte ^= 0xFF,
                    None => stored.crc ^= 1,
                }
                true
            }
            None => false,
        }
    }

    fn check_read_fault(&self) -> Result<()> {
        let mut faults = self.faults.lock();
        match faults.reads_left {
            Some(0) => {
                faults.reads_left = None;
                Err(StorageError::Timeout("injected read fault".into()).into())
            }
            Some(ref mut left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn positions(
        &self,
        cluster: ClusterId,
        range: (Bound<i64>, Bound<i64>),
        ascending: bool,
        limit: usize,
    ) -> Result<Vec<i64>> {
        self.check_read_fault()?;
        let state = self.state.read();
        let keys = state.cluster(cluster)?.records.range(range).map(|(p, _)| *p);
        Ok(if ascending {
            keys.take(limit).collect()
        } else {
            keys.rev().take(limit).collect()
        })
    }
}

impl Storage for MemStorage {
    fn read_record(&self, id: RecordId, fetch_previous: bool, fetch_next: bool) -> Result<RawRecord> {
        self.check_read_fault()?;
        let state = self.state.read();
        let cluster = state.cluster(id.cluster())?;
        let stored = cluster
            .records
            .get(&id.position())
            .ok_or(StorageError::RecordNotFound(id))?;
        if !verify_record(id, stored.version, &stored.buffer, stored.crc) {
            return Err(StorageError::ChecksumMismatch(id).into());
        }
        let previous = fetch_previous
            .then(|| cluster.records.range(..id.position()).next_back())
            .flatten()
            .map(|(p, _)| id.with_position(*p));
        let next = fetch_next
            .then(|| {
                cluster
                    .records
                    .range((Bound::Excluded(id.position()), Bound::Unbounded))
                    .next()
            })
            .flatten()
            .map(|(p, _)| id.with_position(*p));
        Ok(RawRecord {
            buffer: stored.buffer.clone(),
            version: stored.version,
            kind: stored.kind,
            previous,
            next,
        })
    }

    fn record_exists(&self, id: RecordId) -> Result<bool> {
        let state = self.state.read();
        Ok(state
            .clusters
            .get(&id.cluster())
            .is_some_and(|c| c.records.contains_key(&id.position())))
    }

    fn ceiling_positions(&self, cluster: ClusterId, position: i64, limit: usize) -> Result<Vec<i64>> {
        self.positions(cluster, (Bound::Included(position), Bound::Unbounded), true, limit)
    }

    fn floor_positions(&self, cluster: ClusterId, position: i64, limit: usize) -> Result<Vec<i64>> {
        self.positions(cluster, (Bound::Unbounded, Bound::Included(position)), false, limit)
    }

    fn higher_positions(&self, cluster: ClusterId, position: i64, limit: usize) -> Result<Vec<i64>> {
        self.positions(cluster, (Bound::Excluded(position), Bound::Unbounded), true, limit)
    }

    fn lower_positions(&self, cluster: ClusterId, position: i64, limit: usize) -> Result<Vec<i64>> {
        self.positions(cluster, (Bound::Unbounded, Bound::Excluded(position)), false, limit)
    }

    fn count_records(&self, cluster: ClusterId) -> Result<u64> {
        let state = self.state.read();
        Ok(state.cluster(cluster)?.records.len() as u64)
    }

    fn commit(&self, batch: &CommitBatch) -> Result<CommitOutcome> {
        let mut state = self.state.write();
        {
            let mut faults = self.faults.lock();
            if std::mem::take(&mut faults.commit) {
                return Err(StorageError::Other("injected commit fault".into()).into());
            }
        }

        // Validate everything before touching anything.
        let mut next_positions: FxHashMap<ClusterId, i64> = FxHashMap::default();
        let mut ids = IdMap::default();
        for op in batch.operations() {
            let id = op.record().id();
            let cluster = state.cluster(id.cluster())?;
            match op.kind() {
                OperationKind::Created => {
                    let next = next_positions
                        .entry(id.cluster())
                        .or_insert(cluster.next_position);
                    ids.insert(id, id.with_position(*next));
                    *next += 1;
                }
                OperationKind::Updated | OperationKind::Deleted => {
                    let stored = cluster
                        .records
                        .get(&id.position())
                        .ok_or(StorageError::RecordNotFound(id))?;
                    if stored.version != op.record().version() {
                        return Err(StorageError::ConcurrentModification {
                            id,
                            expected: op.record().version(),
                            actual: stored.version,
                        }
                        .into());
                    }
                }
            }
        }
        let encoded = batch.encode(&ids)?;

        let mut versions = Vec::with_capacity(encoded.len());
        for op in encoded {
            let Some(cluster) = state.clusters.get_mut(&op.id.cluster()) else {
                return Err(StorageError::UnknownCluster(op.id.cluster()).into());
            };
            match op.kind {
                OperationKind::Created | OperationKind::Updated => {
                    let version = op.expected_version + 1;
                    let crc = record_crc32(op.id, version, &op.buffer);
                    cluster.records.insert(
                        op.id.position(),
                        StoredRecord {
                            kind: op.record_kind,
                            version,
                            buffer: op.buffer,
                            crc,
                        },
                    );
                    cluster.next_position = cluster.next_position.max(op.id.position() + 1);
                    versions.push((op.id, version));
                }
                OperationKind::Deleted => {
                    cluster.records.remove(&op.id.position());
                }
            }
            trace!(id = %op.id, kind = ?op.kind, "storage.applied");
        }
        debug!(
            tx_id = batch.tx_id(),
            operations = batch.len(),
            created = ids.len(),
            "storage.commit"
        );
        Ok(CommitOutcome { ids, versions })
    }
}
