use crate::storage::IdMap;
use crate::tx::Transaction;
use crate::types::Result;

/// Observer of outer transaction boundaries.
///
/// Nested `begin`/`commit`/`rollback` calls never reach listeners. Only
/// `on_before_begin` and `on_before_commit` can change the outcome: a failed
/// `on_before_begin` aborts the `begin`, a failed `on_before_commit` rolls the
/// transaction back. Errors from the other callbacks are logged and dropped.
pub trait TxListener: Send + Sync {
    /// Called before an outer transaction is opened.
    fn on_before_begin(&self) -> Result<()> {
        Ok(())
    }

    /// Called before staged operations are handed to storage.
    fn on_before_commit(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }

    /// Called once storage has durably applied the transaction.
    fn on_after_commit(&self, _tx_id: u64, _ids: &IdMap) -> Result<()> {
        Ok(())
    }

    /// Called before staged operations are discarded.
    fn on_before_rollback(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }

    /// Called once the transaction has been discarded.
    fn on_after_rollback(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }
}
