use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Where a read was served from.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReadSource {
    /// The transaction overlay.
    Transaction,
    /// The session-local cache.
    Cache,
    /// The storage collaborator.
    Storage,
}

/// Trait for tracking session activity.
///
/// Implementations collect statistics about record reads, transaction
/// outcomes and reverse-adjacency maintenance for monitoring and profiling.
pub trait SessionMetrics: Send + Sync {
    /// Records a record read and where it was served from.
    fn record_loaded(&self, source: ReadSource);

    /// Records an outer commit that reached storage.
    ///
    /// # Parameters
    /// * `operations` - Number of staged operations flushed.
    fn tx_committed(&self, operations: usize);

    /// Records an outer rollback.
    fn tx_rolled_back(&self);

    /// Records reverse-adjacency entries added and removed for one property.
    fn reverse_links_adjusted(&self, added: u64, removed: u64);

    /// Records a hook dispatch skipped by the reentrancy guard.
    fn hook_suppressed(&self);
}

/// A no-op implementation of [`SessionMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl SessionMetrics for NoopMetrics {
    fn record_loaded(&self, _source: ReadSource) {}
    fn tx_committed(&self, _operations: usize) {}
    fn tx_rolled_back(&self) {}
    fn reverse_links_adjusted(&self, _added: u64, _removed: u64) {}
    fn hook_suppressed(&self) {}
}

/// A thread-safe counter-based implementation of [`SessionMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Reads served from the transaction overlay.
    pub tx_reads: AtomicU64,

    /// Reads served from the local cache.
    pub cache_reads: AtomicU64,

    /// Reads that went to storage.
    pub storage_reads: AtomicU64,

    /// Outer commits.
    pub commits: AtomicU64,

    /// Operations flushed by outer commits.
    pub committed_operations: AtomicU64,

    /// Outer rollbacks.
    pub rollbacks: AtomicU64,

    /// Reverse-adjacency entries added.
    pub reverse_links_added: AtomicU64,

    /// Reverse-adjacency entries removed.
    pub reverse_links_removed: AtomicU64,

    /// Hook dispatches suppressed by the reentrancy guard.
    pub hooks_suppressed: AtomicU64,
}

impl SessionMetrics for CounterMetrics {
    fn record_loaded(&self, source: ReadSource) {
        let counter = match source {
            ReadSource::Transaction => &self.tx_reads,
            ReadSource::Cache => &self.cache_reads,
            ReadSource::Storage => &self.storage_reads,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn tx_committed(&self, operations: usize) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.committed_operations
            .fetch_add(operations as u64, Ordering::Relaxed);
    }

    fn tx_rolled_back(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn reverse_links_adjusted(&self, added: u64, removed: u64) {
        self.reverse_links_added.fetch_add(added, Ordering::Relaxed);
        self.reverse_links_removed
            .fetch_add(removed, Ordering::Relaxed);
    }

    fn hook_suppressed(&self) {
        self.hooks_suppressed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn SessionMetrics> {
    Arc::new(NoopMetrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = CounterMetrics::default();
        metrics.record_loaded(ReadSource::Cache);
        metrics.record_loaded(ReadSource::Cache);
        metrics.record_loaded(ReadSource::Storage);
        metrics.tx_committed(3);
        metrics.reverse_links_adjusted(2, 1);
        assert_eq!(metrics.cache_reads.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.storage_reads.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.committed_operations.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.reverse_links_removed.load(Ordering::Relaxed), 1);
    }
}
