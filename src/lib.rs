//! Session and transaction core for an embedded document and graph store.
//!
//! A [`Session`] gives one caller a consistent view of the records in a
//! [`Storage`] engine. Uncommitted writes live in the session's transaction
//! overlay and shadow committed state on every read and scan. Bidirectional
//! links are kept symmetric automatically, and record hooks and
//! transaction listeners can observe the whole lifecycle.
//!
//! The crate is organised bottom-up:
//!
//! * [`types`]: identities, errors and checksums.
//! * [`record`]: entities, property values, link containers with change
//!   tracking, and the record codec.
//! * [`tx`]: the transaction overlay and listener trait.
//! * [`storage`]: the storage contract and the in-memory engine.
//! * [`session`]: the session itself, with merged reads, browsing, hooks
//!   and reverse-link maintenance.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod record;
pub mod session;
pub mod storage;
pub mod tx;
pub mod types;

pub use record::{
    Entity, LinkBag, LinkEvent, LinkList, LinkMap, LinkSet, PropertyChange, Record, RecordKind,
    Value,
};
pub use session::{
    ClassKind, HookEvent, HookId, HookOperation, ListenerId, ReadResult, RecordHook, Schema,
    SchemaClass, Security, Session, SessionConfig, SessionOptions, StaticSchema,
};
pub use storage::{CommitBatch, CommitOutcome, IdMap, MemStorage, Storage};
pub use tx::{OperationKind, Transaction, TxListener, TxStatus};
pub use types::{ClusterId, Permission, RecordId, Resource, Result, SessionError, StorageError};
