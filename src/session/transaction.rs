//! Transaction lifecycle of a session.
//!
//! Transactions nest by counting: only the outermost `begin` creates a
//! [`Transaction`] and only the matching outermost `commit` reaches storage.
//! A nested rollback marks the transaction rollback-only so the outer commit
//! cannot silently publish work an inner scope abandoned.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use crate::session::Session;
use crate::storage::{CommitBatch, CommitOutcome};
use crate::tx::{OperationKind, Transaction, TxStatus};
use crate::types::{RecordId, Result, SessionError};

impl Session {
    /// Starts a transaction, or enters one more nesting level.
    ///
    /// Returns the depth after the call.
    pub fn begin(&mut self) -> Result<usize> {
        self.begin_with(false)
    }

    /// Starts a transaction that rejects every mutation.
    ///
    /// Inside an open transaction this only nests; the outer mode stays.
    pub fn begin_read_only(&mut self) -> Result<usize> {
        self.begin_with(true)
    }

    fn begin_with(&mut self, read_only: bool) -> Result<usize> {
        self.ensure_usable()?;
        if let Some(tx) = self.tx.as_mut() {
            if tx.status() == TxStatus::RollbackOnly {
                return Err(SessionError::TransactionState(
                    "transaction is marked rollback-only",
                ));
            }
            let depth = tx.enter();
            debug!(tx_id = tx.id(), depth, "tx.nested_begin");
            return Ok(depth);
        }
        if self.dispatch.is_dispatching() {
            return Err(SessionError::TransactionState(
                "cannot begin a transaction while a hook is running",
            ));
        }
        for listener in self.listener_snapshot() {
            if let Err(err) = listener.on_before_begin() {
                error!(error = %err, "tx.before_begin_listener_failed");
                return Err(err);
            }
        }
        let tx = Transaction::new(read_only);
        debug!(tx_id = tx.id(), read_only, "tx.begin");
        self.tx = Some(tx);
        Ok(1)
    }

    /// The open transaction, if any.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.tx.as_ref()
    }

    /// True while a transaction is open.
    pub fn is_tx_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Current nesting depth; zero without a transaction.
    pub fn tx_depth(&self) -> usize {
        self.tx.as_ref().map_or(0, Transaction::depth)
    }

    /// Commits one nesting level.
    ///
    /// Returns `true` when this call was the outermost and the batch reached
    /// storage, `false` when it only left a nested level.
    pub fn commit(&mut self) -> Result<bool> {
        self.ensure_usable()?;
        let Some(tx) = self.tx.as_mut() else {
            return Err(SessionError::TransactionState(
                "no active transaction to commit",
            ));
        };
        if tx.depth() > 1 {
            let depth = tx.leave();
            debug!(tx_id = tx.id(), depth, "tx.nested_commit");
            return Ok(false);
        }
        if tx.status() == TxStatus::RollbackOnly {
            self.finish_rollback("nested scope rolled back");
            return Err(SessionError::RolledBack(
                "a nested scope rolled back the transaction".into(),
            ));
        }
        tx.set_status(TxStatus::Committing);
        let tx_id = tx.id();

        let listeners = self.listener_snapshot();
        for listener in &listeners {
            let Some(tx) = self.tx.as_ref() else { break };
            if let Err(err) = listener.on_before_commit(tx) {
                warn!(tx_id, error = %err, "tx.before_commit_listener_failed");
                self.finish_rollback("before-commit listener failed");
                return Err(err);
            }
        }

        let Some(tx) = self.tx.as_mut() else {
            return Err(SessionError::TransactionState(
                "transaction vanished during commit",
            ));
        };
        let batch = CommitBatch::new(tx_id, tx.take_operations());
        let outcome = if batch.is_empty() {
            CommitOutcome::default()
        } else {
            match self.storage.commit(&batch) {
                Ok(outcome) => outcome,
                Err(err) => {
                    if let Some(tx) = self.tx.as_mut() {
                        tx.restore_operations(batch.into_operations());
                    }
                    warn!(tx_id, error = %err, "tx.commit_failed");
                    self.finish_rollback("storage commit failed");
                    return Err(err);
                }
            }
        };

        let elapsed = self.tx.take().map(|mut tx| {
            tx.set_status(TxStatus::Committed);
            tx.elapsed()
        });
        let operations = batch.len();
        self.apply_commit(batch, &outcome);
        self.metrics.tx_committed(operations);
        info!(
            tx_id,
            operations,
            created = outcome.ids.len(),
            duration_ms = elapsed.map_or(0, |d| d.as_millis() as u64),
            "tx.commit"
        );
        for listener in &listeners {
            if let Err(err) = listener.on_after_commit(tx_id, &outcome.ids) {
                error!(tx_id, error = %err, "tx.after_commit_listener_failed");
            }
        }
        self.last_commit = outcome.ids;
        Ok(true)
    }

    /// Refreshes the cache with what storage now holds.
    fn apply_commit(&mut self, batch: CommitBatch, outcome: &CommitOutcome) {
        let versions: BTreeMap<RecordId, i32> = outcome.versions.iter().copied().collect();
        let resolve = |id: RecordId| outcome.ids.resolve(id);
        for mut op in batch.into_operations() {
            let kind = op.kind();
            let record = op.record_mut();
            match kind {
                OperationKind::Deleted => {
                    self.cache.invalidate(record.id());
                }
                OperationKind::Created | OperationKind::Updated => {
                    record.remap_links(&resolve);
                    match versions.get(&record.id()) {
                        Some(version) => {
                            record.set_version(*version);
                            record.mark_clean();
                            self.cache.put(record.clone());
                        }
                        None => {
                            self.cache.invalidate(record.id());
                        }
                    }
                }
            }
        }
    }

    /// Rolls back one nesting level, or the whole transaction when `force`
    /// is set or this is the outermost level.
    pub fn rollback(&mut self, force: bool) -> Result<()> {
        self.ensure_usable()?;
        let Some(tx) = self.tx.as_mut() else {
            return Err(SessionError::TransactionState(
                "no active transaction to roll back",
            ));
        };
        if !force && tx.depth() > 1 {
            let depth = tx.leave();
            tx.set_status(TxStatus::RollbackOnly);
            debug!(tx_id = tx.id(), depth, "tx.nested_rollback");
            return Ok(());
        }
        self.finish_rollback(if force { "forced" } else { "requested" });
        Ok(())
    }

    /// Discards the open transaction and notifies listeners.
    ///
    /// The cache only ever holds committed state, so nothing there changes.
    pub(crate) fn finish_rollback(&mut self, reason: &str) {
        let listeners = self.listener_snapshot();
        if let Some(tx) = self.tx.as_mut() {
            tx.set_status(TxStatus::RollingBack);
        }
        for listener in &listeners {
            let Some(tx) = self.tx.as_ref() else { break };
            if let Err(err) = listener.on_before_rollback(tx) {
                error!(tx_id = tx.id(), error = %err, "tx.before_rollback_listener_failed");
            }
        }
        let Some(mut tx) = self.tx.take() else {
            return;
        };
        tx.set_status(TxStatus::RolledBack);
        let tx_id = tx.id();
        self.metrics.tx_rolled_back();
        warn!(tx_id, operations = tx.len(), reason, "tx.rollback");
        for listener in &listeners {
            if let Err(err) = listener.on_after_rollback(tx_id) {
                error!(tx_id, error = %err, "tx.after_rollback_listener_failed");
            }
        }
    }

    /// Runs `f` inside a transaction level: commits on success, rolls the
    /// whole transaction back on failure.
    pub fn compute_in_tx<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> Result<T>,
    {
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if self.tx.is_some() {
                    self.rollback(true)?;
                }
                Err(err)
            }
        }
    }

    /// [`Session::compute_in_tx`] for closures without a result.
    pub fn execute_in_tx<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        self.compute_in_tx(f)
    }

    /// Feeds `items` to `f`, committing every `batch_size` items and once at the end.
    ///
    /// On failure the current batch is rolled back; earlier batches stay committed.
    pub fn for_each_in_tx<I, F>(&mut self, items: I, batch_size: usize, mut f: F) -> Result<()>
    where
        I: IntoIterator,
        F: FnMut(&mut Session, I::Item) -> Result<()>,
    {
        let batch_size = batch_size.max(1);
        self.begin()?;
        let mut pending = 0usize;
        for item in items {
            if let Err(err) = f(self, item) {
                if self.tx.is_some() {
                    self.rollback(true)?;
                }
                return Err(err);
            }
            pending += 1;
            if pending == batch_size {
                self.commit()?;
                self.begin()?;
                pending = 0;
            }
        }
        self.commit()?;
        Ok(())
    }
}
