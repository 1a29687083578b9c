//! Cluster and class scans.
//!
//! Both iterators walk physical order through the merged view, so records
//! created in the open transaction appear and records it deleted do not.
//! They hold the session mutably for their lifetime and stop after the first
//! error they yield.

use crate::record::Record;
use crate::session::Session;
use crate::types::{ClusterId, RecordId, Result, SessionError};

#[derive(Copy, Clone, Debug)]
enum Position {
    Start,
    At(RecordId),
    Done,
}

#[derive(Debug)]
struct ClusterCursor {
    cluster: ClusterId,
    forward: bool,
    position: Position,
}

impl ClusterCursor {
    fn new(cluster: ClusterId, forward: bool) -> Self {
        Self {
            cluster,
            forward,
            position: Position::Start,
        }
    }

    fn advance(&mut self, session: &mut Session) -> Option<Result<Record>> {
        let step = match (self.position, self.forward) {
            (Position::Done, _) => return None,
            (Position::Start, true) => session.first_in_cluster(self.cluster),
            (Position::Start, false) => session.last_in_cluster(self.cluster),
            (Position::At(id), true) => session.load_record_and_next(id),
            (Position::At(id), false) => session.load_record_and_previous(id),
        };
        match step {
            Ok(Some((record, neighbour))) => {
                self.position = neighbour.map_or(Position::Done, Position::At);
                Some(Ok(record))
            }
            Ok(None) => {
                self.position = Position::Done;
                None
            }
            Err(err) => {
                self.position = Position::Done;
                Some(Err(err))
            }
        }
    }
}

/// Records of one cluster in physical order.
pub struct ClusterIter<'s> {
    session: &'s mut Session,
    cursor: ClusterCursor,
}

impl Iterator for ClusterIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.advance(self.session)
    }
}

/// Records of every cluster of a class, cluster by cluster.
pub struct ClassIter<'s> {
    session: &'s mut Session,
    pending: std::vec::IntoIter<ClusterId>,
    current: Option<ClusterCursor>,
    forward: bool,
    failed: bool,
}

impl Iterator for ClassIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(cursor) = self.current.as_mut() {
                match cursor.advance(self.session) {
                    Some(Ok(record)) => return Some(Ok(record)),
                    Some(Err(err)) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                    None => self.current = None,
                }
            }
            let cluster = self.pending.next()?;
            self.current = Some(ClusterCursor::new(cluster, self.forward));
        }
    }
}

impl Session {
    /// Scans a cluster from the first record to the last.
    pub fn browse_cluster(&mut self, cluster: ClusterId) -> Result<ClusterIter<'_>> {
        self.ensure_usable()?;
        Ok(ClusterIter {
            session: self,
            cursor: ClusterCursor::new(cluster, true),
        })
    }

    /// Scans a cluster from the last record to the first.
    pub fn browse_cluster_reverse(&mut self, cluster: ClusterId) -> Result<ClusterIter<'_>> {
        self.ensure_usable()?;
        Ok(ClusterIter {
            session: self,
            cursor: ClusterCursor::new(cluster, false),
        })
    }

    /// Scans the clusters of a class in ascending cluster order, or
    /// descending when `forward` is false. `polymorphic` adds the clusters
    /// of every subclass.
    pub fn browse_class(
        &mut self,
        class: &str,
        polymorphic: bool,
        forward: bool,
    ) -> Result<ClassIter<'_>> {
        self.ensure_usable()?;
        let Some(mut clusters) = self.schema.clusters_of(class, polymorphic) else {
            return Err(SessionError::invalid(format!("class {class} is not defined")));
        };
        if !forward {
            clusters.reverse();
        }
        Ok(ClassIter {
            session: self,
            pending: clusters.into_iter(),
            current: None,
            forward,
            failed: false,
        })
    }
}
