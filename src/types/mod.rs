//! Identity, error, and permission types shared by every layer of the session core.

pub mod checksum;

use std::fmt;

use thiserror::Error;

use crate::session::options::ConfigError;

/// Identifier of a physical cluster (an append-ordered partition of records).
pub type ClusterId = i32;

/// Cluster id used by records that have not been placed yet.
pub const CLUSTER_ID_INVALID: ClusterId = -1;
/// Position used by records that have not been placed yet.
pub const CLUSTER_POS_INVALID: i64 = -1;
/// First position handed out to records created inside a transaction.
///
/// Temporary positions count down from here, so they never collide with
/// [`CLUSTER_POS_INVALID`] or with persistent positions.
pub const FIRST_TEMPORARY_POSITION: i64 = -2;

/// Record identifier: a cluster id plus a position inside that cluster.
///
/// Ordering is lexicographic on `(cluster, position)`, which is the order
/// navigation walks records in.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RecordId {
    cluster: ClusterId,
    position: i64,
}

impl RecordId {
    /// Identity of a record that belongs to no cluster yet.
    pub const NEW: RecordId = RecordId {
        cluster: CLUSTER_ID_INVALID,
        position: CLUSTER_POS_INVALID,
    };

    /// Builds an identifier from its parts.
    pub const fn new(cluster: ClusterId, position: i64) -> Self {
        Self { cluster, position }
    }

    /// Cluster part of the identifier.
    pub const fn cluster(&self) -> ClusterId {
        self.cluster
    }

    /// Position part of the identifier.
    pub const fn position(&self) -> i64 {
        self.position
    }

    /// True when the record has a real cluster assigned.
    pub const fn has_cluster(&self) -> bool {
        self.cluster >= 0
    }

    /// True for positions that the storage layer can address.
    pub const fn is_valid_position(&self) -> bool {
        self.position >= 0
    }

    /// True for placeholder ids assigned to records created in an open transaction.
    pub const fn is_temporary(&self) -> bool {
        self.position <= FIRST_TEMPORARY_POSITION
    }

    /// True when both parts address a stored record.
    pub const fn is_persistent(&self) -> bool {
        self.has_cluster() && self.is_valid_position()
    }

    /// Identifier in the same cluster at another position.
    pub const fn with_position(&self, position: i64) -> Self {
        Self {
            cluster: self.cluster,
            position,
        }
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::NEW
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

impl From<(ClusterId, i64)> for RecordId {
    fn from((cluster, position): (ClusterId, i64)) -> Self {
        Self::new(cluster, position)
    }
}

/// Operation checked against the security collaborator.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Permission {
    /// Reading records.
    Read,
    /// Creating records.
    Create,
    /// Updating records.
    Update,
    /// Deleting records.
    Delete,
}

/// Resource a [`Permission`] is checked against.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Resource {
    /// A physical cluster.
    Cluster(ClusterId),
    /// A schema class, by name.
    Class(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cluster(id) => write!(f, "cluster {id}"),
            Resource::Class(name) => write!(f, "class {name}"),
        }
    }
}

/// Failures signalled by the storage collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The record is not stored.
    #[error("record {0} not found in storage")]
    RecordNotFound(RecordId),
    /// The stored version differs from the version the transaction read.
    #[error("concurrent modification of {id}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        /// Record that changed underneath the transaction.
        id: RecordId,
        /// Version the transaction based its change on.
        expected: i32,
        /// Version currently stored.
        actual: i32,
    },
    /// The cluster does not exist.
    #[error("cluster {0} does not exist")]
    UnknownCluster(ClusterId),
    /// An external deadline expired while the storage call was in flight.
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    /// The stored checksum does not match the record payload.
    #[error("checksum mismatch for record {0}")]
    ChecksumMismatch(RecordId),
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Any other storage failure.
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by the session core.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The record does not exist in the session's view.
    #[error("record {0} not found")]
    NotFound(RecordId),
    /// Forward and reverse links disagree; the transaction cannot continue.
    #[error("link integrity violation: {0}")]
    IntegrityViolation(String),
    /// The security collaborator refused the operation.
    #[error("permission {permission:?} denied on {resource}")]
    SecurityDenied {
        /// What was accessed.
        resource: Resource,
        /// What was attempted.
        permission: Permission,
    },
    /// The transaction lifecycle was driven incorrectly.
    #[error("transaction state: {0}")]
    TransactionState(&'static str),
    /// The transaction was rolled back instead of committed.
    #[error("transaction rolled back: {0}")]
    RolledBack(String),
    /// The storage collaborator failed.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// The requested combination is not supported.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// A stored buffer could not be decoded.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The session is owned by another thread.
    #[error("session is not active on the current thread")]
    NotActiveOnThread,
    /// The session has been closed.
    #[error("session is closed")]
    Closed,
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// True for "record absent" failures, from either the session or storage.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SessionError::NotFound(_) | SessionError::Storage(StorageError::RecordNotFound(_))
        )
    }

    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        SessionError::IntegrityViolation(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SessionError::Invalid(msg.into())
    }
}

/// Result alias used across the crate.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ids_order_by_cluster_then_position() {
        let mut ids = vec![
            RecordId::new(3, 1),
            RecordId::new(1, 20),
            RecordId::new(1, -2),
            RecordId::new(1, 5),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                RecordId::new(1, -2),
                RecordId::new(1, 5),
                RecordId::new(1, 20),
                RecordId::new(3, 1),
            ]
        );
    }

    #[test]
    fn temporary_and_persistent_are_disjoint() {
        let temp = RecordId::new(4, FIRST_TEMPORARY_POSITION - 3);
        assert!(temp.is_temporary());
        assert!(!temp.is_persistent());
        assert!(!temp.is_valid_position());

        let stored = RecordId::new(4, 0);
        assert!(stored.is_persistent());
        assert!(!stored.is_temporary());

        assert!(!RecordId::NEW.is_temporary());
        assert!(!RecordId::NEW.has_cluster());
    }

    #[test]
    fn display_uses_hash_notation() {
        assert_eq!(RecordId::new(12, 7).to_string(), "#12:7");
        assert_eq!(RecordId::NEW.to_string(), "#-1:-1");
    }

    #[test]
    fn not_found_is_recognised_from_both_layers() {
        let id = RecordId::new(1, 1);
        assert!(SessionError::NotFound(id).is_not_found());
        assert!(SessionError::from(StorageError::RecordNotFound(id)).is_not_found());
        assert!(!SessionError::Closed.is_not_found());
    }
}
