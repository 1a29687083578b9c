use std::num::NonZeroUsize;

use lru::LruCache;

use crate::record::Record;
use crate::types::{ClusterId, RecordId};

/// Session-local cache of committed records.
///
/// Only committed state lives here; staged records stay in the transaction
/// overlay, which takes precedence on reads.
pub struct LocalCache {
    records: LruCache<RecordId, Record>,
}

impl LocalCache {
    /// Cache holding at most `capacity` records (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: LruCache::new(capacity),
        }
    }

    /// Cached copy of `id`.
    pub fn get(&mut self, id: RecordId) -> Option<&Record> {
        self.records.get(&id)
    }

    /// True when `id` is cached, without touching recency.
    pub fn contains(&self, id: RecordId) -> bool {
        self.records.contains(&id)
    }

    /// Cached copy of `id`, without touching recency.
    pub fn peek(&self, id: RecordId) -> Option<&Record> {
        self.records.peek(&id)
    }

    /// Cached records, most recently used first.
    pub fn iter(&self) -> impl Iterator<Item = &Record> + '_ {
        self.records.iter().map(|(_, record)| record)
    }

    /// Stores the committed state of a record.
    pub fn put(&mut self, record: Record) {
        self.records.put(record.id(), record);
    }

    /// Drops one record.
    pub fn invalidate(&mut self, id: RecordId) -> bool {
        self.records.pop(&id).is_some()
    }

    /// Drops every record of a cluster.
    pub fn invalidate_cluster(&mut self, cluster: ClusterId) -> usize {
        let victims: Vec<RecordId> = self
            .records
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| id.cluster() == cluster)
            .collect();
        for id in &victims {
            self.records.pop(id);
        }
        victims.len()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Entity;

    fn record(cluster: ClusterId, position: i64) -> Record {
        let mut record = Record::document(Entity::new());
        record.set_id(RecordId::new(cluster, position));
        record
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LocalCache::new(2);
        cache.put(record(1, 0));
        cache.put(record(1, 1));
        assert!(cache.get(RecordId::new(1, 0)).is_some());
        cache.put(record(1, 2));
        assert!(cache.contains(RecordId::new(1, 0)));
        assert!(!cache.contains(RecordId::new(1, 1)));
        let order: Vec<RecordId> = cache.iter().map(Record::id).collect();
        assert_eq!(order, vec![RecordId::new(1, 2), RecordId::new(1, 0)]);
        assert!(cache.peek(RecordId::new(1, 2)).is_some());
    }

    #[test]
    fn cluster_invalidation_is_selective() {
        let mut cache = LocalCache::new(8);
        cache.put(record(1, 0));
        cache.put(record(2, 0));
        cache.put(record(1, 5));
        assert_eq!(cache.invalidate_cluster(1), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(RecordId::new(2, 0)));
    }
}
