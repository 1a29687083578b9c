//! Reverse-adjacency maintenance.
//!
//! For every forward link property `p` on record `A` pointing at `B`, `B`
//! carries a reserved bag `#p` containing `A` once per occurrence. Writes go
//! through two steps. First the per-target delta of every changed link
//! property is computed from the record's change tracking, before the
//! change window is reset. Then, once the write is staged, the deltas are
//! applied to the targets' bags. Targets are visited in id order so the
//! staged result does not depend on hash order.
//!
//! Properties that belong to the graph edge protocol (`out_*`/`in_*` on
//! vertices, `out`/`in` on edges) are maintained by that protocol and are
//! skipped here.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::trace;

use crate::record::{
    is_reserved_property, ChangeTracking, LinkEvent, PropertyChange, Record, RecordKind, Value,
};
use crate::session::schema::ClassKind;
use crate::session::Session;
use crate::types::{RecordId, Result, SessionError};

/// Signed per-target occurrence delta of one forward property.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LinkDiff {
    deltas: BTreeMap<RecordId, i64>,
}

impl LinkDiff {
    fn adjust(&mut self, id: RecordId, delta: i64) {
        let entry = self.deltas.entry(id).or_insert(0);
        *entry += delta;
        if *entry == 0 {
            self.deltas.remove(&id);
        }
    }

    fn add_value(&mut self, value: &Value) {
        value.for_each_link(|id| self.adjust(id, 1));
    }

    fn subtract_value(&mut self, value: &Value) {
        value.for_each_link(|id| self.adjust(id, -1));
    }

    fn apply_events(&mut self, events: &[LinkEvent]) {
        for event in events {
            match *event {
                LinkEvent::Add(id) => self.adjust(id, 1),
                LinkEvent::Remove(id) => self.adjust(id, -1),
                LinkEvent::Update { old, new } => {
                    self.adjust(old, -1);
                    self.adjust(new, 1);
                }
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    fn entries(&self) -> impl Iterator<Item = (RecordId, i64)> + '_ {
        self.deltas.iter().map(|(id, delta)| (*id, *delta))
    }
}

/// Pending reverse-adjacency work of one write, by forward property.
pub(crate) type PendingLinks = SmallVec<[(String, LinkDiff); 2]>;

fn is_protocol_property(kind: Option<ClassKind>, name: &str) -> bool {
    match kind {
        Some(ClassKind::Vertex) => name.starts_with("out_") || name.starts_with("in_"),
        Some(ClassKind::Edge) => name == "out" || name == "in",
        _ => false,
    }
}

impl Session {
    fn structural_kind(&self, record: &Record) -> Option<ClassKind> {
        let from_schema = record
            .entity()
            .and_then(|entity| self.schema.class_of(entity))
            .map(|class| class.kind());
        from_schema.or(match record.kind() {
            RecordKind::Vertex => Some(ClassKind::Vertex),
            RecordKind::Edge => Some(ClassKind::Edge),
            RecordKind::Document | RecordKind::Blob => None,
        })
    }

    /// Deltas implied by the pending changes of `record`.
    ///
    /// For a new record every link property counts as added. Must run before
    /// the record's change window is reset.
    pub(crate) fn pending_links(&self, record: &Record, created: bool) -> Result<PendingLinks> {
        let mut pending = PendingLinks::new();
        if !self.link_consistency {
            return Ok(pending);
        }
        let Some(entity) = record.entity() else {
            return Ok(pending);
        };
        let kind = self.structural_kind(record);

        if created {
            for (name, value) in entity.properties() {
                if !value.is_link() || is_protocol_property(kind, name) {
                    continue;
                }
                let mut diff = LinkDiff::default();
                diff.add_value(value);
                if !diff.is_empty() {
                    pending.push((name.to_owned(), diff));
                }
            }
            return Ok(pending);
        }

        for (name, change) in entity.changes() {
            if is_reserved_property(name) || is_protocol_property(kind, name) {
                continue;
            }
            let current = entity.get(name);
            let mut diff = LinkDiff::default();
            match change {
                PropertyChange::Replaced(original) => {
                    if let Some(original) = original {
                        diff.subtract_value(original);
                    }
                    if let Some(current) = current {
                        diff.add_value(current);
                    }
                }
                PropertyChange::InPlace => {
                    match current.and_then(Value::tracking).and_then(ChangeTracking::events) {
                        Some(events) => diff.apply_events(events),
                        None => {
                            return Err(SessionError::Unsupported(
                                "link container replaced in place without change tracking",
                            ))
                        }
                    }
                }
            }
            if !diff.is_empty() {
                pending.push((name.clone(), diff));
            }
        }
        Ok(pending)
    }

    /// Applies pending deltas of a write by `source` to the targets' bags.
    pub(crate) fn apply_pending_links(&mut self, source: RecordId, pending: PendingLinks) -> Result<()> {
        for (property, diff) in pending {
            self.update_reverse_links(source, &property, &diff)?;
        }
        Ok(())
    }

    fn update_reverse_links(&mut self, source: RecordId, property: &str, diff: &LinkDiff) -> Result<()> {
        let mut added = 0u64;
        let mut removed = 0u64;
        for (target, delta) in diff.entries() {
            if self.is_deleted_in_tx(target) {
                if delta > 0 {
                    return Err(SessionError::integrity(format!(
                        "{source}.{property} links to {target}, which this transaction deleted"
                    )));
                }
                continue;
            }
            if target == source {
                continue;
            }
            let mut record = self.load_for_write(target)?;
            let Some(entity) = record.entity_mut() else {
                continue;
            };
            let Some(bag) = entity.reverse_bag_mut(property, delta > 0) else {
                return Err(SessionError::integrity(format!(
                    "{target} has no reverse links for {property} to remove {source} from"
                )));
            };
            if delta > 0 {
                for _ in 0..delta {
                    bag.add(source);
                }
                added += delta.unsigned_abs();
            } else {
                for _ in 0..delta.unsigned_abs() {
                    if !bag.remove(source) {
                        return Err(SessionError::integrity(format!(
                            "{target}.#{property} does not hold {source}"
                        )));
                    }
                }
                removed += delta.unsigned_abs();
            }
            if bag.is_empty() {
                entity.remove_reverse_bag(property);
            }
            record.mark_clean();
            self.stage_maintenance(record)?;
            trace!(source = %source, target = %target, property, delta, "links.reverse_adjusted");
        }
        if added + removed > 0 {
            self.metrics.reverse_links_adjusted(added, removed);
        }
        Ok(())
    }

    /// Removes every link into `record` from its referrers, then drops the
    /// record's own links from its targets' bags.
    pub(crate) fn unlink_deleted(&mut self, record: &Record) -> Result<()> {
        if !self.link_consistency {
            return Ok(());
        }
        let Some(entity) = record.entity() else {
            return Ok(());
        };
        let id = record.id();

        for (forward, bag) in entity.reverse_link_properties() {
            for (referrer, count) in bag.entries() {
                if referrer == id || self.is_deleted_in_tx(referrer) {
                    continue;
                }
                let mut source = match self.load_for_write(referrer) {
                    Ok(source) => source,
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return Err(err),
                };
                let Some(source_entity) = source.entity_mut() else {
                    continue;
                };
                let Some(value) = source_entity.value_mut_untracked(forward) else {
                    return Err(SessionError::integrity(format!(
                        "{referrer} has no property {forward} pointing at {id}"
                    )));
                };
                if !detach(value, id, count) {
                    return Err(SessionError::integrity(format!(
                        "{referrer}.{forward} does not hold {count} link(s) to {id}"
                    )));
                }
                source.mark_clean();
                self.stage_maintenance(source)?;
                trace!(referrer = %referrer, target = %id, forward, "links.detached");
            }
        }

        let kind = self.structural_kind(record);
        for (name, value) in entity.properties() {
            if !value.is_link() || is_protocol_property(kind, name) {
                continue;
            }
            let mut diff = LinkDiff::default();
            diff.subtract_value(value);
            self.update_reverse_links(id, name, &diff)?;
        }
        Ok(())
    }

    fn stage_maintenance(&mut self, record: Record) -> Result<()> {
        match self.tx.as_mut() {
            Some(tx) => tx.stage_update(record),
            None => Err(SessionError::TransactionState("no active transaction")),
        }
    }
}

/// Removes `count` occurrences of `target` from a forward link value.
fn detach(value: &mut Value, target: RecordId, count: u32) -> bool {
    if matches!(value, Value::Link(id) if *id == target) {
        *value = Value::Null;
        return true;
    }
    match value {
        Value::LinkList(list) => (0..count).all(|_| list.remove(target)),
        Value::LinkSet(set) => set.remove(target),
        Value::LinkMap(map) => (0..count).all(|_| map.remove_value(target)),
        Value::LinkBag(bag) => (0..count).all(|_| bag.remove(target)),
        _ => false,
    }
}
