//! Merged reads over the transaction overlay, the local cache and storage.
//!
//! A read resolves an id in that order and stops at the first layer that
//! knows it. A tombstone in the overlay ends the lookup with "not found"
//! even when storage still holds the record. Physical navigation merges two
//! sorted sources: storage positions and the ids staged in the overlay
//! (including temporary ids of new records). It takes whichever candidate
//! is closer and skips tombstones until it reaches a live id or the end of
//! the cluster.

use crate::record::ser::decode_record;
use crate::record::Record;
use crate::session::hooks::HookEvent;
use crate::session::metrics::ReadSource;
use crate::session::Session;
use crate::types::{ClusterId, Permission, RecordId, Resource, Result, SessionError};

/// Outcome of [`Session::read_record`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadResult {
    /// The record, or `None` when it is absent, deleted or hidden.
    pub record: Option<Record>,
    /// Closest live id before the requested one, when asked for.
    pub previous: Option<RecordId>,
    /// Closest live id after the requested one, when asked for.
    pub next: Option<RecordId>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// The candidate closer to the starting point.
    fn closer(self, a: RecordId, b: RecordId) -> RecordId {
        match self {
            Direction::Forward => a.min(b),
            Direction::Backward => a.max(b),
        }
    }
}

impl Session {
    /// Reads a record through the overlay, the cache and storage.
    ///
    /// With `throw_if_missing` an absent record is an error. Otherwise the
    /// result holds no record, but the requested neighbours are still
    /// resolved so a scan can continue past a gap.
    pub fn read_record(
        &mut self,
        id: RecordId,
        want_previous: bool,
        want_next: bool,
        throw_if_missing: bool,
    ) -> Result<ReadResult> {
        self.ensure_usable()?;
        let result = self.read_merged(id, want_previous, want_next, throw_if_missing);
        self.abort_on_storage_failure(result)
    }

    fn read_merged(
        &mut self,
        id: RecordId,
        want_previous: bool,
        want_next: bool,
        throw_if_missing: bool,
    ) -> Result<ReadResult> {
        self.security
            .check(&Resource::Cluster(id.cluster()), Permission::Read)?;
        if self.is_deleted_in_tx(id) {
            return self.missing(id, want_previous, want_next, throw_if_missing);
        }

        let staged = self.tx.as_ref().and_then(|tx| tx.visible_record(id)).cloned();
        let known = match staged {
            Some(record) => Some((record, ReadSource::Transaction)),
            None => self.cache.get(id).cloned().map(|r| (r, ReadSource::Cache)),
        };
        if let Some((record, source)) = known {
            self.metrics.record_loaded(source);
            if self.read_vetoed(&record) {
                return self.missing(id, want_previous, want_next, throw_if_missing);
            }
            self.dispatch_hooks(HookEvent::Read, &record)?;
            let previous = self.neighbour_if(want_previous, id, Direction::Backward)?;
            let next = self.neighbour_if(want_next, id, Direction::Forward)?;
            return Ok(ReadResult {
                record: Some(record),
                previous,
                next,
            });
        }

        if !id.is_valid_position() {
            return self.missing(id, want_previous, want_next, throw_if_missing);
        }
        let raw = match self.storage.read_record(id, want_previous, want_next) {
            Ok(raw) => raw,
            Err(err) if err.is_not_found() => {
                return self.missing(id, want_previous, want_next, throw_if_missing)
            }
            Err(err) => return Err(err),
        };
        let record = decode_record(id, raw.version, raw.kind, &raw.buffer)?;
        self.metrics.record_loaded(ReadSource::Storage);
        self.cache.put(record.clone());
        if self.read_vetoed(&record) {
            return self.missing(id, want_previous, want_next, throw_if_missing);
        }
        self.dispatch_hooks(HookEvent::Read, &record)?;

        let previous = if want_previous {
            let staged = self.tx.as_ref().and_then(|tx| tx.previous_rid(id));
            self.merge_neighbour(raw.previous, staged, Direction::Backward)?
        } else {
            None
        };
        let next = if want_next {
            let staged = self.tx.as_ref().and_then(|tx| tx.next_rid(id));
            self.merge_neighbour(raw.next, staged, Direction::Forward)?
        } else {
            None
        };
        Ok(ReadResult {
            record: Some(record),
            previous,
            next,
        })
    }

    /// Picks the closer of a storage and an overlay neighbour, moving past a
    /// storage neighbour the overlay tombstoned.
    fn merge_neighbour(
        &mut self,
        stored: Option<RecordId>,
        staged: Option<RecordId>,
        direction: Direction,
    ) -> Result<Option<RecordId>> {
        let candidate = match (stored, staged) {
            (Some(a), Some(b)) => Some(direction.closer(a, b)),
            (a, b) => a.or(b),
        };
        match candidate {
            Some(id) if self.is_deleted_in_tx(id) => self.fetch_neighbour(id, direction),
            other => Ok(other),
        }
    }

    fn missing(
        &mut self,
        id: RecordId,
        want_previous: bool,
        want_next: bool,
        throw_if_missing: bool,
    ) -> Result<ReadResult> {
        if throw_if_missing {
            return Err(SessionError::NotFound(id));
        }
        let previous = self.neighbour_if(want_previous, id, Direction::Backward)?;
        let next = self.neighbour_if(want_next, id, Direction::Forward)?;
        Ok(ReadResult {
            record: None,
            previous,
            next,
        })
    }

    /// Closest live id after `id` in its cluster, overlay included.
    pub fn fetch_next(&mut self, id: RecordId) -> Result<Option<RecordId>> {
        self.ensure_usable()?;
        let result = self.fetch_neighbour(id, Direction::Forward);
        self.abort_on_storage_failure(result)
    }

    /// Closest live id before `id` in its cluster, overlay included.
    pub fn fetch_previous(&mut self, id: RecordId) -> Result<Option<RecordId>> {
        self.ensure_usable()?;
        let result = self.fetch_neighbour(id, Direction::Backward);
        self.abort_on_storage_failure(result)
    }

    fn neighbour_if(&mut self, wanted: bool, id: RecordId, direction: Direction) -> Result<Option<RecordId>> {
        if wanted {
            self.fetch_neighbour(id, direction)
        } else {
            Ok(None)
        }
    }

    fn fetch_neighbour(&mut self, mut from: RecordId, direction: Direction) -> Result<Option<RecordId>> {
        let limit = self.config.navigation_batch;
        loop {
            let positions = match direction {
                Direction::Forward => {
                    self.storage
                        .higher_positions(from.cluster(), from.position(), limit)?
                }
                Direction::Backward => {
                    self.storage
                        .lower_positions(from.cluster(), from.position(), limit)?
                }
            };
            let staged = self.tx.as_ref().and_then(|tx| match direction {
                Direction::Forward => tx.next_rid(from),
                Direction::Backward => tx.previous_rid(from),
            });
            let stored = positions
                .iter()
                .map(|p| from.with_position(*p))
                .find(|id| !self.is_deleted_in_tx(*id));
            let last = positions.last().map(|p| from.with_position(*p));

            match (stored, staged, last) {
                (Some(a), Some(b), _) => return Ok(Some(direction.closer(a, b))),
                (Some(a), None, _) => return Ok(Some(a)),
                // Every stored position in this batch is a tombstone.
                (None, staged, Some(last)) => match staged {
                    Some(b) if direction.closer(b, last) == b => return Ok(Some(b)),
                    _ => from = last,
                },
                (None, staged, None) => return Ok(staged),
            }
        }
    }

    /// First live record of a cluster and the id after it.
    pub fn first_in_cluster(&mut self, cluster: ClusterId) -> Result<Option<(Record, Option<RecordId>)>> {
        self.ensure_usable()?;
        let result = self.edge_of_cluster(cluster, Direction::Forward);
        self.abort_on_storage_failure(result)
    }

    /// Last live record of a cluster and the id before it.
    pub fn last_in_cluster(&mut self, cluster: ClusterId) -> Result<Option<(Record, Option<RecordId>)>> {
        self.ensure_usable()?;
        let result = self.edge_of_cluster(cluster, Direction::Backward);
        self.abort_on_storage_failure(result)
    }

    fn edge_of_cluster(
        &mut self,
        cluster: ClusterId,
        direction: Direction,
    ) -> Result<Option<(Record, Option<RecordId>)>> {
        self.security
            .check(&Resource::Cluster(cluster), Permission::Read)?;
        let (stored, staged) = match direction {
            Direction::Forward => (
                self.storage.ceiling_positions(cluster, 0, 1)?.first().copied(),
                self.tx.as_ref().and_then(|tx| tx.first_rid(cluster)),
            ),
            Direction::Backward => (
                self.storage
                    .floor_positions(cluster, i64::MAX, 1)?
                    .first()
                    .copied(),
                self.tx.as_ref().and_then(|tx| tx.last_rid(cluster)),
            ),
        };
        let stored = stored.map(|p| RecordId::new(cluster, p));
        let start = match (stored, staged) {
            (Some(a), Some(b)) => direction.closer(a, b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return Ok(None),
        };
        let start = if self.is_deleted_in_tx(start) {
            match self.fetch_neighbour(start, direction)? {
                Some(id) => id,
                None => return Ok(None),
            }
        } else {
            start
        };
        self.walk_from(start, direction)
    }

    /// Record at `id` (or the first live one after it, in `direction`) and
    /// its neighbour.
    fn walk_from(
        &mut self,
        mut id: RecordId,
        direction: Direction,
    ) -> Result<Option<(Record, Option<RecordId>)>> {
        loop {
            let forward = direction == Direction::Forward;
            let result = self.read_merged(id, !forward, forward, false)?;
            let neighbour = if forward { result.next } else { result.previous };
            match (result.record, neighbour) {
                (Some(record), neighbour) => return Ok(Some((record, neighbour))),
                (None, Some(next)) => id = next,
                (None, None) => return Ok(None),
            }
        }
    }

    /// Loads `id`, or the first live record after it, and the id after that.
    pub fn load_record_and_next(&mut self, id: RecordId) -> Result<Option<(Record, Option<RecordId>)>> {
        self.ensure_usable()?;
        let result = self.walk_from(id, Direction::Forward);
        self.abort_on_storage_failure(result)
    }

    /// Loads `id`, or the first live record before it, and the id before that.
    pub fn load_record_and_previous(&mut self, id: RecordId) -> Result<Option<(Record, Option<RecordId>)>> {
        self.ensure_usable()?;
        let result = self.walk_from(id, Direction::Backward);
        self.abort_on_storage_failure(result)
    }
}
