//! Record hooks and their dispatch.
//!
//! Hooks run in registration order. While hooks for a record are running,
//! that record's id sits on the session's dispatch stack and any nested
//! dispatch for the same id is skipped. This is how a hook can update the
//! record it was triggered for without recursing forever.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::record::Record;
use crate::session::Session;
use crate::types::{Permission, RecordId, Resource, Result};

/// Operations a hook can subscribe to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum HookOperation {
    /// Record creation.
    Create,
    /// Record reads.
    Read,
    /// Record updates.
    Update,
    /// Record deletion.
    Delete,
}

/// Point in a record's lifecycle at which hooks run.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum HookEvent {
    /// Before a new record is staged.
    BeforeCreate,
    /// After a new record and its link maintenance are staged.
    AfterCreate,
    /// After a record became visible to a read.
    Read,
    /// Before a changed record is staged.
    BeforeUpdate,
    /// After a changed record and its link maintenance are staged.
    AfterUpdate,
    /// Before a record is deleted.
    BeforeDelete,
    /// After the delete and its link maintenance are staged.
    AfterDelete,
}

impl HookEvent {
    /// Operation this event belongs to.
    pub const fn operation(self) -> HookOperation {
        match self {
            HookEvent::BeforeCreate | HookEvent::AfterCreate => HookOperation::Create,
            HookEvent::Read => HookOperation::Read,
            HookEvent::BeforeUpdate | HookEvent::AfterUpdate => HookOperation::Update,
            HookEvent::BeforeDelete | HookEvent::AfterDelete => HookOperation::Delete,
        }
    }
}

/// Callback invoked around record operations.
pub trait RecordHook: Send + Sync {
    /// Whether the hook wants events of `operation`.
    fn handles(&self, _operation: HookOperation) -> bool {
        true
    }

    /// Reacts to an event. The hook may use the session, including to
    /// modify the same record. An error aborts the operation and rolls the
    /// transaction back.
    fn on_event(&self, session: &mut Session, event: HookEvent, record: &Record) -> Result<()>;

    /// Returns `true` to hide `record` from the read that is loading it.
    fn before_read(&self, _record: &Record) -> bool {
        false
    }

    /// Called once the hook is unregistered.
    fn on_unregister(&self) {}
}

/// Handle returned by [`Session::register_hook`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct HookId(u64);

#[derive(Default)]
pub(crate) struct HookRegistry {
    hooks: Vec<(HookId, Arc<dyn RecordHook>)>,
    next_id: u64,
}

impl HookRegistry {
    fn register(&mut self, hook: Arc<dyn RecordHook>) -> HookId {
        let ptr = Arc::as_ptr(&hook) as *const ();
        if let Some((id, _)) = self
            .hooks
            .iter()
            .find(|(_, existing)| Arc::as_ptr(existing) as *const () == ptr)
        {
            return *id;
        }
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.hooks.push((id, hook));
        id
    }

    fn unregister(&mut self, id: HookId) -> Option<Arc<dyn RecordHook>> {
        let index = self.hooks.iter().position(|(hid, _)| *hid == id)?;
        Some(self.hooks.remove(index).1)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn len(&self) -> usize {
        self.hooks.len()
    }

    fn handling(&self, operation: HookOperation) -> Vec<Arc<dyn RecordHook>> {
        self.hooks
            .iter()
            .filter(|(_, hook)| hook.handles(operation))
            .map(|(_, hook)| Arc::clone(hook))
            .collect()
    }

    fn all(&self) -> Vec<Arc<dyn RecordHook>> {
        self.hooks.iter().map(|(_, hook)| Arc::clone(hook)).collect()
    }
}

/// Ids whose hooks are currently running in this session.
#[derive(Default)]
pub(crate) struct DispatchStack {
    active: FxHashSet<RecordId>,
}

impl DispatchStack {
    fn enter(&mut self, id: RecordId) -> bool {
        self.active.insert(id)
    }

    fn leave(&mut self, id: RecordId) {
        self.active.remove(&id);
    }

    pub(crate) fn is_dispatching(&self) -> bool {
        !self.active.is_empty()
    }
}

impl Session {
    /// Registers a hook; registering the same instance again returns its existing id.
    pub fn register_hook(&mut self, hook: Arc<dyn RecordHook>) -> Result<HookId> {
        self.ensure_usable()?;
        Ok(self.hooks.register(hook))
    }

    /// Unregisters a hook; returns `false` if the id is unknown.
    pub fn unregister_hook(&mut self, id: HookId) -> Result<bool> {
        self.ensure_usable()?;
        Ok(match self.hooks.unregister(id) {
            Some(hook) => {
                hook.on_unregister();
                true
            }
            None => false,
        })
    }

    /// Number of registered hooks.
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// True while any hook of this session is running.
    pub fn is_dispatching_hooks(&self) -> bool {
        self.dispatch.is_dispatching()
    }

    /// Runs every hook handling `event` for `record`.
    ///
    /// Records without a cluster never dispatch, and neither does a record
    /// whose hooks are already running further up the stack.
    pub(crate) fn dispatch_hooks(&mut self, event: HookEvent, record: &Record) -> Result<()> {
        if self.hooks.is_empty() || !record.id().has_cluster() {
            return Ok(());
        }
        let id = record.id();
        if !self.dispatch.enter(id) {
            trace!(id = %id, ?event, "hooks.suppressed");
            self.metrics.hook_suppressed();
            return Ok(());
        }
        let hooks = self.hooks.handling(event.operation());
        let mut outcome = Ok(());
        let mut panicked = None;
        for hook in hooks {
            match panic::catch_unwind(AssertUnwindSafe(|| hook.on_event(self, event, record))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    outcome = Err(err);
                    break;
                }
                Err(payload) => {
                    panicked = Some(payload);
                    break;
                }
            }
        }
        self.dispatch.leave(id);
        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }
        outcome
    }

    /// Decides whether a freshly resolved record stays hidden from the reader.
    pub(crate) fn read_vetoed(&self, record: &Record) -> bool {
        if let Some(class) = record.entity().and_then(|e| e.class()) {
            let resource = Resource::Class(class.to_owned());
            if self.security.check(&resource, Permission::Read).is_err() {
                return true;
            }
        }
        if !self.security.can_read(record) {
            return true;
        }
        self.hooks.all().iter().any(|hook| hook.before_read(record))
    }
}
