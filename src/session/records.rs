//! Record operations: create, update, delete, load and counting.
//!
//! Every write runs in the same order. The link deltas are computed and the
//! change window reset, then the `Before*` hooks run and the write is staged.
//! After that the reverse-adjacency maintenance is staged and the `After*`
//! hooks run. When a `BeforeUpdate` hook writes the record being updated,
//! the caller's changes are reapplied on top of the hook's copy and their
//! link deltas recomputed. A failure after validation rolls the whole
//! transaction back, because part of the write may already be staged.

use tracing::trace;

use crate::record::ser::decode_record;
use crate::record::Record;
use crate::session::hooks::HookEvent;
use crate::session::links::PendingLinks;
use crate::session::Session;
use crate::tx::{OperationKind, Transaction, TxStatus};
use crate::types::{
    ClusterId, Permission, RecordId, Resource, Result, SessionError, CLUSTER_POS_INVALID,
};

impl Session {
    /// Stages a new record and returns its temporary id.
    ///
    /// The record goes to its explicit cluster (see [`Record::in_cluster`]) or
    /// to the cluster the schema picks for its class. The id becomes
    /// permanent at commit; see [`Session::refresh_id`].
    pub fn create(&mut self, mut record: Record) -> Result<RecordId> {
        self.ensure_writable()?;
        let id = record.id();
        if id.is_persistent() || id.is_temporary() {
            return Err(SessionError::invalid(format!(
                "record {id} already has an identity"
            )));
        }
        let cluster = self.cluster_for_new(&record)?;
        record.set_id(RecordId::new(cluster, CLUSTER_POS_INVALID));
        self.check_write(&record, Permission::Create)?;
        let pending = self.pending_links(&record, true)?;
        record.mark_clean();
        record.set_version(0);
        let result = self.stage_new_record(record, pending);
        self.abort_on_error(result)
    }

    fn stage_new_record(&mut self, mut record: Record, pending: PendingLinks) -> Result<RecordId> {
        let id = self.writable_tx()?.assign_temporary_id(&mut record)?;
        self.dispatch_hooks(HookEvent::BeforeCreate, &record)?;
        self.writable_tx()?.stage_create(record.clone())?;
        self.apply_pending_links(id, pending)?;
        self.dispatch_hooks(HookEvent::AfterCreate, &record)?;
        trace!(id = %id, "record.created");
        Ok(id)
    }

    /// Changes a record through `f` and stages the result.
    ///
    /// `f` works on the session's current copy, so earlier staged changes and
    /// reverse links maintained by other writes are never lost. An error from
    /// `f` leaves the transaction untouched.
    pub fn update<F>(&mut self, id: RecordId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Record) -> Result<()>,
    {
        self.ensure_writable()?;
        let loaded = self.load_for_write(id);
        let base = self.abort_on_storage_failure(loaded)?;
        self.check_write(&base, Permission::Update)?;
        let mut record = base.clone();
        f(&mut record)?;
        if !record.is_dirty() {
            return Ok(());
        }
        let pending = self.pending_links(&record, false)?;
        let changed = changed_properties(&record);
        record.mark_clean();
        let result = self.stage_changed_record(base, record, &changed, pending);
        self.abort_on_error(result)
    }

    fn stage_changed_record(
        &mut self,
        base: Record,
        mut record: Record,
        changed: &[String],
        mut pending: PendingLinks,
    ) -> Result<()> {
        let id = record.id();
        self.dispatch_hooks(HookEvent::BeforeUpdate, &record)?;
        // A hook may have written this record, directly or through link
        // maintenance. Its copy wins except for the properties `f` changed.
        let current = self.load_for_write(id)?;
        if current != base {
            let mut rebased = current;
            reapply_changes(&record, changed, &mut rebased)?;
            pending = self.pending_links(&rebased, false)?;
            rebased.mark_clean();
            record = rebased;
        }
        self.writable_tx()?.stage_update(record.clone())?;
        self.apply_pending_links(id, pending)?;
        self.dispatch_hooks(HookEvent::AfterUpdate, &record)?;
        trace!(id = %id, "record.updated");
        Ok(())
    }

    /// Deletes a record, detaching it from every record that links to it.
    pub fn delete(&mut self, id: RecordId) -> Result<()> {
        self.ensure_writable()?;
        let loaded = self.load_for_write(id);
        let record = self.abort_on_storage_failure(loaded)?;
        self.check_write(&record, Permission::Delete)?;
        let result = self.stage_deleted_record(record);
        self.abort_on_error(result)
    }

    fn stage_deleted_record(&mut self, record: Record) -> Result<()> {
        let id = record.id();
        self.dispatch_hooks(HookEvent::BeforeDelete, &record)?;
        // Re-read: the hooks may have changed the record.
        let current = self.load_for_write(id)?;
        self.unlink_deleted(&current)?;
        self.writable_tx()?.stage_delete(current)?;
        self.dispatch_hooks(HookEvent::AfterDelete, &record)?;
        trace!(id = %id, "record.deleted");
        Ok(())
    }

    /// Loads a record, failing with [`SessionError::NotFound`] when it is absent.
    pub fn load(&mut self, id: RecordId) -> Result<Record> {
        self.read_record(id, false, false, true)?
            .record
            .ok_or(SessionError::NotFound(id))
    }

    /// Loads a record, or `None` when it is absent or hidden.
    pub fn load_or_null(&mut self, id: RecordId) -> Result<Option<Record>> {
        Ok(self.read_record(id, false, false, false)?.record)
    }

    /// True when the record exists in this session's view.
    ///
    /// A record hidden from reads by security or a `before_read` hook does
    /// not exist as far as the caller can tell. No `Read` hooks run.
    pub fn exists(&mut self, id: RecordId) -> Result<bool> {
        self.ensure_usable()?;
        self.security
            .check(&Resource::Cluster(id.cluster()), Permission::Read)?;
        let record = match self.load_for_write(id) {
            Ok(record) => record,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return self.abort_on_storage_failure(Err(err)),
        };
        Ok(!self.read_vetoed(&record))
    }

    /// Drops the cached copy of a record; the next read goes to storage.
    pub fn unload(&mut self, id: RecordId) -> bool {
        self.cache.invalidate(id)
    }

    /// Drops every cached record of a cluster.
    pub fn invalidate_cluster(&mut self, cluster: ClusterId) -> usize {
        self.cache.invalidate_cluster(cluster)
    }

    /// Records in `cluster` as this session sees them.
    pub fn count_cluster(&mut self, cluster: ClusterId) -> Result<u64> {
        self.ensure_usable()?;
        self.security
            .check(&Resource::Cluster(cluster), Permission::Read)?;
        let stored = self.storage.count_records(cluster);
        let stored = self.abort_on_storage_failure(stored)?;
        let (created, deleted) = self.tx.as_ref().map_or((0, 0), |tx| {
            (
                tx.count_in_cluster(cluster, OperationKind::Created) as u64,
                tx.count_in_cluster(cluster, OperationKind::Deleted) as u64,
            )
        });
        Ok((stored + created).saturating_sub(deleted))
    }

    /// Records of a class, including subclasses when `polymorphic`.
    pub fn count_class(&mut self, class: &str, polymorphic: bool) -> Result<u64> {
        let Some(clusters) = self.schema.clusters_of(class, polymorphic) else {
            return Err(SessionError::invalid(format!("class {class} is not defined")));
        };
        let mut total = 0;
        for cluster in clusters {
            total += self.count_cluster(cluster)?;
        }
        Ok(total)
    }

    /// The session's current copy of `id` for modification: the overlay,
    /// then the cache, then storage. Hooks and read security do not apply.
    pub(crate) fn load_for_write(&mut self, id: RecordId) -> Result<Record> {
        if let Some(tx) = self.tx.as_ref() {
            if tx.is_deleted(id) {
                return Err(SessionError::NotFound(id));
            }
            if let Some(record) = tx.visible_record(id) {
                return Ok(record.clone());
            }
        }
        if let Some(record) = self.cache.get(id) {
            return Ok(record.clone());
        }
        if !id.is_valid_position() {
            return Err(SessionError::NotFound(id));
        }
        let raw = self.storage.read_record(id, false, false).map_err(|err| {
            if err.is_not_found() {
                SessionError::NotFound(id)
            } else {
                err
            }
        })?;
        let record = decode_record(id, raw.version, raw.kind, &raw.buffer)?;
        self.cache.put(record.clone());
        Ok(record)
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_usable()?;
        match self.tx.as_ref() {
            None => Err(SessionError::TransactionState(
                "writes need an active transaction",
            )),
            Some(tx) if tx.is_read_only() => Err(SessionError::TransactionState(
                "transaction is read-only",
            )),
            Some(tx) if tx.status() != TxStatus::Active => Err(
                SessionError::TransactionState("transaction no longer accepts writes"),
            ),
            Some(_) => Ok(()),
        }
    }

    fn writable_tx(&mut self) -> Result<&mut Transaction> {
        self.tx
            .as_mut()
            .ok_or(SessionError::TransactionState("no active transaction"))
    }

    fn cluster_for_new(&self, record: &Record) -> Result<ClusterId> {
        if record.id().has_cluster() {
            return Ok(record.id().cluster());
        }
        let Some(class_name) = record.entity().and_then(|e| e.class()) else {
            return Err(SessionError::invalid(
                "record has neither a cluster nor a class",
            ));
        };
        let Some(class) = self.schema.class(class_name) else {
            return Err(SessionError::invalid(format!(
                "class {class_name} is not defined"
            )));
        };
        self.schema.cluster_for_new_record(&class).ok_or_else(|| {
            SessionError::invalid(format!("class {class_name} has no cluster"))
        })
    }

    fn check_write(&self, record: &Record, permission: Permission) -> Result<()> {
        self.security
            .check(&Resource::Cluster(record.id().cluster()), permission)?;
        if let Some(class) = record.entity().and_then(|e| e.class()) {
            self.security
                .check(&Resource::Class(class.to_owned()), permission)?;
        }
        Ok(())
    }
}

/// Names of the properties `record` changed since it was last reconciled.
fn changed_properties(record: &Record) -> Vec<String> {
    record
        .entity()
        .map(|entity| entity.changes().keys().cloned().collect())
        .unwrap_or_default()
}

/// Copies the `changed` properties of `from` onto `onto`, removing the ones
/// `from` no longer has. Blob bodies are copied whole.
fn reapply_changes(from: &Record, changed: &[String], onto: &mut Record) -> Result<()> {
    if let Some(bytes) = from.blob_bytes() {
        return onto.set_blob_bytes(bytes.to_vec());
    }
    let (Some(source), Some(target)) = (from.entity(), onto.entity_mut()) else {
        return Ok(());
    };
    for name in changed {
        match source.get(name) {
            Some(value) => {
                target.set(name.as_str(), value.clone())?;
            }
            None => {
                target.remove(name)?;
            }
        }
    }
    Ok(())
}
