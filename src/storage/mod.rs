//! Contract between the session core and the physical storage engine.
//!
//! The session never sees pages or clusters directly. It reads record buffers
//! by id, asks for physical-order neighbours, and hands a [`CommitBatch`] to
//! [`Storage::commit`] for an atomic flush. [`memory::MemStorage`] is the
//! in-process implementation used by tests and embedders without a disk.

pub mod memory;

use rustc_hash::FxHashMap;

use crate::record::ser::encode_record;
use crate::record::RecordKind;
use crate::tx::{OperationKind, RecordOperation};
use crate::types::{ClusterId, RecordId, Result};

pub use memory::MemStorage;

/// A stored record as returned by [`Storage::read_record`].
#[derive(Clone, Debug)]
pub struct RawRecord {
    /// Encoded body.
    pub buffer: Vec<u8>,
    /// Stored version.
    pub version: i32,
    /// Stored type tag.
    pub kind: RecordKind,
    /// Physical predecessor in the cluster, when requested.
    pub previous: Option<RecordId>,
    /// Physical successor in the cluster, when requested.
    pub next: Option<RecordId>,
}

/// Storage engine consumed by sessions.
///
/// Implementations are shared between sessions and must do their own
/// synchronisation. Missing records are reported as
/// [`crate::types::StorageError::RecordNotFound`].
pub trait Storage: Send + Sync {
    /// Reads a record and optionally its physical neighbours.
    fn read_record(&self, id: RecordId, fetch_previous: bool, fetch_next: bool) -> Result<RawRecord>;

    /// True when a record is stored under `id`.
    fn record_exists(&self, id: RecordId) -> Result<bool>;

    /// Up to `limit` stored positions `>= position`, ascending.
    fn ceiling_positions(&self, cluster: ClusterId, position: i64, limit: usize) -> Result<Vec<i64>>;

    /// Up to `limit` stored positions `<= position`, descending.
    fn floor_positions(&self, cluster: ClusterId, position: i64, limit: usize) -> Result<Vec<i64>>;

    /// Up to `limit` stored positions `> position`, ascending.
    fn higher_positions(&self, cluster: ClusterId, position: i64, limit: usize) -> Result<Vec<i64>>;

    /// Up to `limit` stored positions `< position`, descending.
    fn lower_positions(&self, cluster: ClusterId, position: i64, limit: usize) -> Result<Vec<i64>>;

    /// Number of records stored in `cluster`.
    fn count_records(&self, cluster: ClusterId) -> Result<u64>;

    /// Atomically applies a batch: either every operation lands or none does.
    ///
    /// The implementation assigns permanent positions to the batch's
    /// temporary ids in staging order, then calls [`CommitBatch::encode`] so
    /// references between records in the batch use the permanent ids.
    fn commit(&self, batch: &CommitBatch) -> Result<CommitOutcome>;
}

/// Mapping from temporary ids to the permanent ids storage assigned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdMap {
    ids: FxHashMap<RecordId, RecordId>,
}

impl IdMap {
    /// Records that `temporary` became `permanent`.
    pub fn insert(&mut self, temporary: RecordId, permanent: RecordId) {
        self.ids.insert(temporary, permanent);
    }

    /// Permanent id for `temporary`, if it was assigned.
    pub fn get(&self, temporary: RecordId) -> Option<RecordId> {
        self.ids.get(&temporary).copied()
    }

    /// Permanent id for a temporary one, or the id itself.
    pub fn resolve(&self, id: RecordId) -> RecordId {
        self.get(id).unwrap_or(id)
    }

    /// Number of mappings.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when no temporary id was resolved.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// `(temporary, permanent)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (RecordId, RecordId)> + '_ {
        self.ids.iter().map(|(t, p)| (*t, *p))
    }
}

/// Operation ready to be written: permanent id, encoded body, expected version.
#[derive(Clone, Debug)]
pub struct EncodedOperation {
    /// Permanent id.
    pub id: RecordId,
    /// What to do.
    pub kind: OperationKind,
    /// Type tag to store.
    pub record_kind: RecordKind,
    /// Version the transaction read; zero for creates.
    pub expected_version: i32,
    /// Encoded body; empty for deletes.
    pub buffer: Vec<u8>,
}

/// Staged operations of one outer transaction, in staging order.
#[derive(Debug)]
pub struct CommitBatch {
    tx_id: u64,
    operations: Vec<RecordOperation>,
}

impl CommitBatch {
    pub(crate) fn new(tx_id: u64, operations: Vec<RecordOperation>) -> Self {
        Self { tx_id, operations }
    }

    /// Id of the transaction being committed.
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    /// Operations in staging order.
    pub fn operations(&self) -> &[RecordOperation] {
        &self.operations
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True when there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Temporary ids that need a permanent position, in staging order.
    pub fn created_ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.operations
            .iter()
            .filter(|op| op.kind() == OperationKind::Created)
            .map(|op| op.record().id())
    }

    /// Encodes every operation with temporary ids rewritten through `ids`.
    pub fn encode(&self, ids: &IdMap) -> Result<Vec<EncodedOperation>> {
        let resolve = |id: RecordId| ids.resolve(id);
        self.operations
            .iter()
            .map(|op| {
                let mut record = op.record().clone();
                record.remap_links(&resolve);
                let buffer = match op.kind() {
                    OperationKind::Deleted => Vec::new(),
                    _ => encode_record(&record)?,
                };
                Ok(EncodedOperation {
                    id: record.id(),
                    kind: op.kind(),
                    record_kind: record.kind(),
                    expected_version: op.record().version(),
                    buffer,
                })
            })
            .collect()
    }

    pub(crate) fn into_operations(self) -> Vec<RecordOperation> {
        self.operations
    }
}

/// What storage reports after a successful commit.
#[derive(Clone, Debug, Default)]
pub struct CommitOutcome {
    /// Temporary to permanent id assignments.
    pub ids: IdMap,
    /// New stored version of every created or updated record, by permanent id.
    pub versions: Vec<(RecordId, i32)>,
}
