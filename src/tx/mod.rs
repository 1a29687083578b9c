//! Transaction overlay: staged record operations plus the nesting counter.
//!
//! The overlay is keyed by [`RecordId`] in a `BTreeMap`, so the ids a
//! transaction touched in one cluster form a contiguous key range. The
//! navigation helpers only walk that range, never the whole overlay.

pub mod listener;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::record::Record;
use crate::types::{ClusterId, RecordId, Result, SessionError, FIRST_TEMPORARY_POSITION};

pub use listener::TxListener;

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of a staged operation.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum OperationKind {
    /// The record did not exist before this transaction.
    Created,
    /// The record exists in storage and was changed.
    Updated,
    /// The record exists in storage and was deleted (a tombstone).
    Deleted,
}

/// A staged operation and the record it applies to.
#[derive(Clone, Debug)]
pub struct RecordOperation {
    kind: OperationKind,
    record: Record,
    seq: u64,
}

impl RecordOperation {
    /// Kind of change.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Record as staged; for deletes, the last version the transaction saw.
    pub fn record(&self) -> &Record {
        &self.record
    }

    pub(crate) fn record_mut(&mut self) -> &mut Record {
        &mut self.record
    }

    /// Staging order inside the transaction.
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

/// Lifecycle state of a transaction.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TxStatus {
    /// Open and accepting operations.
    Active,
    /// A nested scope rolled back; the outer commit will roll back instead.
    RollbackOnly,
    /// Outer commit in progress.
    Committing,
    /// Outer rollback in progress.
    RollingBack,
    /// Durably committed.
    Committed,
    /// Discarded.
    RolledBack,
}

/// Staged operations of one outer transaction.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    depth: usize,
    status: TxStatus,
    read_only: bool,
    entries: BTreeMap<RecordId, RecordOperation>,
    next_temp_position: i64,
    next_seq: u64,
    started: Instant,
}

impl Transaction {
    pub(crate) fn new(read_only: bool) -> Self {
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            depth: 1,
            status: TxStatus::Active,
            read_only,
            entries: BTreeMap::new(),
            next_temp_position: FIRST_TEMPORARY_POSITION,
            next_seq: 0,
            started: Instant::now(),
        }
    }

    /// Process-unique transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current nesting depth; at least 1 while the transaction is open.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Lifecycle state.
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// True when the transaction rejects mutations.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Time since the outer `begin`.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Staged operations in staging order.
    pub fn operations(&self) -> Vec<&RecordOperation> {
        let mut ops: Vec<_> = self.entries.values().collect();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of staged operations of the given kind in `cluster`.
    pub fn count_in_cluster(&self, cluster: ClusterId, kind: OperationKind) -> usize {
        self.entries
            .range(cluster_range(cluster))
            .filter(|(_, op)| op.kind == kind)
            .count()
    }

    pub(crate) fn enter(&mut self) -> usize {
        self.depth += 1;
        self.depth
    }

    pub(crate) fn leave(&mut self) -> usize {
        self.depth = self.depth.saturating_sub(1);
        self.depth
    }

    pub(crate) fn set_status(&mut self, status: TxStatus) {
        self.status = status;
    }

    pub(crate) fn into_operations(self) -> Vec<RecordOperation> {
        let mut ops: Vec<_> = self.entries.into_values().collect();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    fn sequence(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub(crate) fn take_operations(&mut self) -> Vec<RecordOperation> {
        let mut ops: Vec<_> = std::mem::take(&mut self.entries).into_values().collect();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    pub(crate) fn restore_operations(&mut self, ops: Vec<RecordOperation>) {
        self.entries = ops.into_iter().map(|op| (op.record.id(), op)).collect();
    }

    /// Gives a record with a cluster but no position the next temporary position.
    pub(crate) fn assign_temporary_id(&mut self, record: &mut Record) -> Result<RecordId> {
        let id = record.id();
        if !id.has_cluster() {
            return Err(SessionError::invalid("record has no cluster assigned"));
        }
        if !id.is_temporary() && !id.is_persistent() {
            record.set_id(id.with_position(self.next_temp_position));
            self.next_temp_position -= 1;
        }
        Ok(record.id())
    }

    /// Stages a new record, assigning a temporary position if it has none.
    pub(crate) fn stage_create(&mut self, mut record: Record) -> Result<RecordId> {
        let id = self.assign_temporary_id(&mut record)?;
        if self.entries.contains_key(&id) {
            return Err(SessionError::invalid(format!(
                "record {id} is already part of the transaction"
            )));
        }
        let seq = self.sequence();
        self.entries.insert(
            id,
            RecordOperation {
                kind: OperationKind::Created,
                record,
                seq,
            },
        );
        Ok(id)
    }

    /// Stages a changed record. A record created in this transaction stays created.
    pub(crate) fn stage_update(&mut self, record: Record) -> Result<()> {
        let id = record.id();
        if !id.has_cluster() || !(id.is_persistent() || id.is_temporary()) {
            return Err(SessionError::invalid(format!(
                "cannot update record {id} without an identity"
            )));
        }
        match self.entries.get_mut(&id) {
            Some(op) if op.kind == OperationKind::Deleted => Err(SessionError::invalid(format!(
                "record {id} was deleted in this transaction"
            ))),
            Some(op) => {
                op.record = record;
                Ok(())
            }
            None if id.is_temporary() => Err(SessionError::NotFound(id)),
            None => {
                let seq = self.sequence();
                self.entries.insert(
                    id,
                    RecordOperation {
                        kind: OperationKind::Updated,
                        record,
                        seq,
                    },
                );
                Ok(())
            }
        }
    }

    /// Stages a delete. Deleting a record created in this transaction drops
    /// both operations.
    pub(crate) fn stage_delete(&mut self, record: Record) -> Result<()> {
        let id = record.id();
        match self.entries.get_mut(&id) {
            Some(op) => match op.kind {
                OperationKind::Created => {
                    self.entries.remove(&id);
                    Ok(())
                }
                OperationKind::Updated => {
                    op.kind = OperationKind::Deleted;
                    op.record = record;
                    Ok(())
                }
                OperationKind::Deleted => Err(SessionError::invalid(format!(
                    "record {id} is already deleted in this transaction"
                ))),
            },
            None if id.is_temporary() => Err(SessionError::NotFound(id)),
            None => {
                let seq = self.sequence();
                self.entries.insert(
                    id,
                    RecordOperation {
                        kind: OperationKind::Deleted,
                        record,
                        seq,
                    },
                );
                Ok(())
            }
        }
    }

    /// True when the record is tombstoned by this transaction.
    pub fn is_deleted(&self, id: RecordId) -> bool {
        matches!(self.entries.get(&id), Some(op) if op.kind == OperationKind::Deleted)
    }

    /// Staged operation for `id`.
    pub fn entry(&self, id: RecordId) -> Option<&RecordOperation> {
        self.entries.get(&id)
    }

    pub(crate) fn entry_mut(&mut self, id: RecordId) -> Option<&mut RecordOperation> {
        self.entries.get_mut(&id)
    }

    /// Staged record visible under `id` (created or updated, not deleted).
    pub fn visible_record(&self, id: RecordId) -> Option<&Record> {
        self.entries
            .get(&id)
            .filter(|op| op.kind != OperationKind::Deleted)
            .map(|op| &op.record)
    }

    /// Smallest live id this transaction touched in `cluster`.
    pub fn first_rid(&self, cluster: ClusterId) -> Option<RecordId> {
        self.entries
            .range(cluster_range(cluster))
            .find(|(_, op)| op.kind != OperationKind::Deleted)
            .map(|(id, _)| *id)
    }

    /// Largest live id this transaction touched in `cluster`.
    pub fn last_rid(&self, cluster: ClusterId) -> Option<RecordId> {
        self.entries
            .range(cluster_range(cluster))
            .rev()
            .find(|(_, op)| op.kind != OperationKind::Deleted)
            .map(|(id, _)| *id)
    }

    /// Next live id after `id` in the same cluster.
    pub fn next_rid(&self, id: RecordId) -> Option<RecordId> {
        let end = RecordId::new(id.cluster(), i64::MAX);
        self.entries
            .range((Bound::Excluded(id), Bound::Included(end)))
            .find(|(_, op)| op.kind != OperationKind::Deleted)
            .map(|(id, _)| *id)
    }

    /// Previous live id before `id` in the same cluster.
    pub fn previous_rid(&self, id: RecordId) -> Option<RecordId> {
        let start = RecordId::new(id.cluster(), i64::MIN);
        self.entries
            .range((Bound::Included(start), Bound::Excluded(id)))
            .rev()
            .find(|(_, op)| op.kind != OperationKind::Deleted)
            .map(|(id, _)| *id)
    }
}

fn cluster_range(cluster: ClusterId) -> (Bound<RecordId>, Bound<RecordId>) {
    (
        Bound::Included(RecordId::new(cluster, i64::MIN)),
        Bound::Included(RecordId::new(cluster, i64::MAX)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Entity;

    fn stored(cluster: ClusterId, position: i64) -> Record {
        let mut record = Record::document(Entity::new());
        record.set_id(RecordId::new(cluster, position));
        record.set_version(1);
        record
    }

    fn fresh(cluster: ClusterId) -> Record {
        Record::document(Entity::new()).in_cluster(cluster)
    }

    #[test]
    fn temporary_ids_count_down() -> Result<()> {
        let mut tx = Transaction::new(false);
        let a = tx.stage_create(fresh(3))?;
        let b = tx.stage_create(fresh(3))?;
        assert_eq!(a, RecordId::new(3, -2));
        assert_eq!(b, RecordId::new(3, -3));
        assert!(a.is_temporary() && b.is_temporary());
        Ok(())
    }

    #[test]
    fn create_then_update_stays_created() -> Result<()> {
        let mut tx = Transaction::new(false);
        let id = tx.stage_create(fresh(1))?;
        let mut changed = tx.visible_record(id).cloned().unwrap_or_else(|| fresh(1));
        changed.set_version(7);
        tx.stage_update(changed)?;
        let op = tx.entry(id).map(|op| (op.kind(), op.record().version()));
        assert_eq!(op, Some((OperationKind::Created, 7)));
        Ok(())
    }

    #[test]
    fn create_then_delete_cancels() -> Result<()> {
        let mut tx = Transaction::new(false);
        let id = tx.stage_create(fresh(1))?;
        let record = tx.visible_record(id).cloned();
        tx.stage_delete(record.unwrap_or_else(|| fresh(1)))?;
        assert!(tx.entry(id).is_none());
        assert!(tx.is_empty());
        Ok(())
    }

    #[test]
    fn operations_after_delete_are_rejected() -> Result<()> {
        let mut tx = Transaction::new(false);
        tx.stage_delete(stored(1, 4))?;
        assert!(tx.is_deleted(RecordId::new(1, 4)));
        assert!(tx.stage_update(stored(1, 4)).is_err());
        assert!(tx.stage_delete(stored(1, 4)).is_err());
        assert!(tx.stage_create(stored(1, 4)).is_err());
        Ok(())
    }

    #[test]
    fn navigation_skips_tombstones_and_other_clusters() -> Result<()> {
        let mut tx = Transaction::new(false);
        tx.stage_update(stored(2, 10))?;
        tx.stage_delete(stored(2, 20))?;
        tx.stage_update(stored(2, 30))?;
        tx.stage_update(stored(3, 0))?;
        tx.stage_update(stored(1, 99))?;

        assert_eq!(tx.first_rid(2), Some(RecordId::new(2, 10)));
        assert_eq!(tx.last_rid(2), Some(RecordId::new(2, 30)));
        assert_eq!(tx.next_rid(RecordId::new(2, 10)), Some(RecordId::new(2, 30)));
        assert_eq!(tx.previous_rid(RecordId::new(2, 30)), Some(RecordId::new(2, 10)));
        assert_eq!(tx.next_rid(RecordId::new(2, 30)), None);
        assert_eq!(tx.previous_rid(RecordId::new(2, 10)), None);
        assert_eq!(tx.first_rid(4), None);
        assert_eq!(tx.count_in_cluster(2, OperationKind::Updated), 2);
        Ok(())
    }

    #[test]
    fn operations_keep_staging_order() -> Result<()> {
        let mut tx = Transaction::new(false);
        tx.stage_update(stored(5, 9))?;
        tx.stage_update(stored(1, 1))?;
        let order: Vec<_> = tx.operations().iter().map(|op| op.record().id()).collect();
        assert_eq!(order, vec![RecordId::new(5, 9), RecordId::new(1, 1)]);
        Ok(())
    }

    #[test]
    fn transaction_ids_are_unique() {
        let a = Transaction::new(false);
        let b = Transaction::new(true);
        assert_ne!(a.id(), b.id());
        assert!(b.is_read_only());
        assert_eq!(a.depth(), 1);
    }
}
