//! The database session: one caller's view of the store.
//!
//! A session owns a transaction overlay, a local cache of committed records
//! and the hook registry. Every read merges the overlay over the cache over
//! storage (see [`access`]). Every write is staged in the overlay together
//! with the reverse-adjacency maintenance it implies (see [`links`]).
//!
//! Sessions are not shared: all methods take `&mut self`, and unless the
//! owning-thread check is disabled, each call verifies that it runs on the
//! thread that last activated the session.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sombra_session::{Entity, MemStorage, Record, Session, SessionOptions};
//!
//! let storage = Arc::new(MemStorage::new());
//! let cluster = storage.add_cluster("people");
//! let mut session = Session::open(SessionOptions::new(storage))?;
//!
//! session.begin()?;
//! let mut alice = Entity::new();
//! alice.set("name", "alice")?;
//! let id = session.create(Record::document(alice).in_cluster(cluster))?;
//! session.commit()?;
//!
//! let id = session.refresh_id(id);
//! assert!(id.is_persistent());
//! assert!(session.exists(id)?);
//! # Ok::<(), sombra_session::SessionError>(())
//! ```

pub mod access;
pub mod browse;
pub mod cache;
pub mod hooks;
pub mod links;
pub mod metrics;
pub mod options;
pub mod schema;
mod records;
mod transaction;


use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::storage::{IdMap, Storage};
use crate::tx::{Transaction, TxListener};
use crate::types::{RecordId, Result, SessionError, StorageError};

pub use access::ReadResult;
pub use browse::{ClassIter, ClusterIter};
pub use cache::LocalCache;
pub use hooks::{HookEvent, HookId, HookOperation, RecordHook};
pub use metrics::{CounterMetrics, NoopMetrics, ReadSource, SessionMetrics};
pub use options::{ConfigError, SessionConfig, SessionOptions};
pub use schema::{AllowAll, ClassKind, Schema, SchemaClass, Security, StaticSchema};

use hooks::{DispatchStack, HookRegistry};
use metrics::default_metrics;

/// Handle returned by [`Session::register_listener`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ListenerId(u64);

/// A database session.
pub struct Session {
    storage: Arc<dyn Storage>,
    schema: Arc<dyn Schema>,
    security: Arc<dyn Security>,
    metrics: Arc<dyn SessionMetrics>,
    config: SessionConfig,
    cache: LocalCache,
    tx: Option<Transaction>,
    hooks: HookRegistry,
    dispatch: DispatchStack,
    listeners: Vec<(ListenerId, Arc<dyn TxListener>)>,
    next_listener: u64,
    link_consistency: bool,
    last_commit: IdMap,
    owner: ThreadId,
    closed: bool,
}

impl Session {
    /// Opens a session bound to the calling thread.
    pub fn open(options: SessionOptions) -> Result<Self> {
        let SessionOptions {
            storage,
            schema,
            security,
            metrics,
            config,
        } = options;
        if config.local_cache_capacity == 0 {
            return Err(ConfigError::Invalid("local_cache_capacity must be positive").into());
        }
        if config.navigation_batch == 0 {
            return Err(ConfigError::Invalid("navigation_batch must be positive").into());
        }
        debug!(
            cache_capacity = config.local_cache_capacity,
            link_consistency = config.link_consistency,
            "session.open"
        );
        Ok(Self {
            storage,
            schema,
            security,
            metrics: metrics.unwrap_or_else(default_metrics),
            cache: LocalCache::new(config.local_cache_capacity),
            link_consistency: config.link_consistency,
            config,
            tx: None,
            hooks: HookRegistry::default(),
            dispatch: DispatchStack::default(),
            listeners: Vec::new(),
            next_listener: 0,
            last_commit: IdMap::default(),
            owner: thread::current().id(),
            closed: false,
        })
    }

    /// Tunables the session was opened with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Storage collaborator.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Schema collaborator.
    pub fn schema(&self) -> &Arc<dyn Schema> {
        &self.schema
    }

    /// Binds the session to the calling thread.
    pub fn activate_on_current_thread(&mut self) {
        self.owner = thread::current().id();
    }

    /// True when the calling thread owns the session.
    pub fn is_active_on_current_thread(&self) -> bool {
        self.owner == thread::current().id()
    }

    /// True once [`Session::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Rolls back any open transaction, drops the cache and refuses further work.
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.ensure_usable()?;
        if self.tx.is_some() {
            self.finish_rollback("session closed");
        }
        self.cache.clear();
        self.closed = true;
        debug!("session.close");
        Ok(())
    }

    /// Whether reverse-adjacency maintenance runs on writes.
    pub fn is_link_consistency_enabled(&self) -> bool {
        self.link_consistency
    }

    /// Turns reverse-adjacency maintenance on or off for later writes.
    pub fn set_link_consistency(&mut self, enabled: bool) {
        self.link_consistency = enabled;
    }

    /// Session-local cache.
    pub fn local_cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Registers a transaction listener.
    pub fn register_listener(&mut self, listener: Arc<dyn TxListener>) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Unregisters a listener; returns `false` if the id is unknown.
    pub fn unregister_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Permanent id of a record created by the last committed transaction.
    ///
    /// Persistent ids and unknown temporary ids come back unchanged.
    pub fn refresh_id(&self, id: RecordId) -> RecordId {
        if id.is_temporary() {
            self.last_commit.resolve(id)
        } else {
            id
        }
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if self.config.validate_thread && !self.is_active_on_current_thread() {
            return Err(SessionError::NotActiveOnThread);
        }
        Ok(())
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn TxListener>> {
        self.listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub(crate) fn is_deleted_in_tx(&self, id: RecordId) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_deleted(id))
    }

    /// Rolls the open transaction back if `result` failed.
    pub(crate) fn abort_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if self.tx.is_some() {
                self.finish_rollback(&err.to_string());
            }
        }
        result
    }

    /// Rolls the open transaction back if `result` is a storage failure other
    /// than a missing record.
    pub(crate) fn abort_on_storage_failure<T>(&mut self, result: Result<T>) -> Result<T> {
        let storage_failure = matches!(
            &result,
            Err(SessionError::Storage(err)) if !matches!(err, StorageError::RecordNotFound(_))
        );
        if storage_failure {
            self.abort_on_error(result)
        } else {
            result
        }
    }
}
