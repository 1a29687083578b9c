//! Link containers and their change tracking.
//!
//! Every container carries a [`ChangeTracking`] value. A container built by the
//! caller starts in [`ChangeTracking::Snapshot`] mode: it remembers nothing and
//! a change to it can only be reconciled by diffing a full snapshot. Once the
//! container is attached to an entity (or decoded from storage) it switches to
//! [`ChangeTracking::Timeline`] and logs every add/remove/update until the
//! session reconciles the entity and clears the log.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use crate::types::RecordId;

/// One logged mutation of a link container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// A reference was added.
    Add(RecordId),
    /// A reference was removed.
    Remove(RecordId),
    /// A reference was swapped for another one in place.
    Update {
        /// Reference that was replaced.
        old: RecordId,
        /// Reference that took its place.
        new: RecordId,
    },
}

/// What a container remembers about its own mutations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ChangeTracking {
    /// Nothing is logged; reconciliation needs a full snapshot diff.
    #[default]
    Snapshot,
    /// Ordered log of mutations since the last reconciliation.
    Timeline(Vec<LinkEvent>),
}

impl ChangeTracking {
    fn record(&mut self, event: LinkEvent) {
        if let ChangeTracking::Timeline(events) = self {
            events.push(event);
        }
    }

    /// Logged events, when a timeline is kept.
    pub fn events(&self) -> Option<&[LinkEvent]> {
        match self {
            ChangeTracking::Snapshot => None,
            ChangeTracking::Timeline(events) => Some(events),
        }
    }

    /// True when a timeline is kept.
    pub fn is_timeline(&self) -> bool {
        matches!(self, ChangeTracking::Timeline(_))
    }

    pub(crate) fn start(&mut self) {
        if let ChangeTracking::Snapshot = self {
            *self = ChangeTracking::Timeline(Vec::new());
        }
    }

    pub(crate) fn clear(&mut self) {
        if let ChangeTracking::Timeline(events) = self {
            events.clear();
        }
    }

    /// Rebuilds the multiset of ids the container held before the logged events.
    fn rewind(&self, current: impl Iterator<Item = RecordId>) -> Option<Vec<RecordId>> {
        let events = self.events()?;
        let mut counts: BTreeMap<RecordId, i64> = BTreeMap::new();
        for id in current {
            *counts.entry(id).or_default() += 1;
        }
        for event in events.iter().rev() {
            match *event {
                LinkEvent::Add(id) => *counts.entry(id).or_default() -= 1,
                LinkEvent::Remove(id) => *counts.entry(id).or_default() += 1,
                LinkEvent::Update { old, new } => {
                    *counts.entry(new).or_default() -= 1;
                    *counts.entry(old).or_default() += 1;
                }
            }
        }
        let mut ids = Vec::new();
        for (id, count) in counts {
            for _ in 0..count.max(0) {
                ids.push(id);
            }
        }
        Some(ids)
    }
}

/// Ordered sequence of links; duplicates allowed.
#[derive(Clone, Debug, Default)]
pub struct LinkList {
    items: Vec<RecordId>,
    tracking: ChangeTracking,
}

impl LinkList {
    /// Empty, untracked list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a link.
    pub fn push(&mut self, id: RecordId) {
        self.items.push(id);
        self.tracking.record(LinkEvent::Add(id));
    }

    /// Inserts a link at `index`; fails when the index is past the end.
    pub fn insert(&mut self, index: usize, id: RecordId) -> bool {
        if index > self.items.len() {
            return false;
        }
        self.items.insert(index, id);
        self.tracking.record(LinkEvent::Add(id));
        true
    }

    /// Replaces the link at `index`, returning the previous one.
    pub fn set(&mut self, index: usize, id: RecordId) -> Option<RecordId> {
        let slot = self.items.get_mut(index)?;
        let old = std::mem::replace(slot, id);
        if old != id {
            self.tracking.record(LinkEvent::Update { old, new: id });
        }
        Some(old)
    }

    /// Removes the link at `index`.
    pub fn remove_at(&mut self, index: usize) -> Option<RecordId> {
        if index >= self.items.len() {
            return None;
        }
        let id = self.items.remove(index);
        self.tracking.record(LinkEvent::Remove(id));
        Some(id)
    }

    /// Removes the first occurrence of `id`.
    pub fn remove(&mut self, id: RecordId) -> bool {
        match self.items.iter().position(|item| *item == id) {
            Some(index) => self.remove_at(index).is_some(),
            None => false,
        }
    }

    /// True when `id` occurs at least once.
    pub fn contains(&self, id: RecordId) -> bool {
        self.items.contains(&id)
    }

    /// Number of links, duplicates included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the list holds no links.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Links in order.
    pub fn iter(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.items.iter().copied()
    }

    /// Links as a slice.
    pub fn as_slice(&self) -> &[RecordId] {
        &self.items
    }

    /// Change tracking state.
    pub fn tracking(&self) -> &ChangeTracking {
        &self.tracking
    }

    pub(crate) fn tracking_mut(&mut self) -> &mut ChangeTracking {
        &mut self.tracking
    }

    pub(crate) fn rewind(&self) -> Option<Vec<RecordId>> {
        self.tracking.rewind(self.iter())
    }

    pub(crate) fn remap(&mut self, map: impl Fn(RecordId) -> RecordId) {
        for item in &mut self.items {
            *item = map(*item);
        }
    }
}

impl FromIterator<RecordId> for LinkList {
    fn from_iter<T: IntoIterator<Item = RecordId>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
            tracking: ChangeTracking::Snapshot,
        }
    }
}

impl PartialEq for LinkList {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

/// Set of unique links.
#[derive(Clone, Debug, Default)]
pub struct LinkSet {
    items: BTreeSet<RecordId>,
    tracking: ChangeTracking,
}

impl LinkSet {
    /// Empty, untracked set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a link; returns false if it was already present.
    pub fn insert(&mut self, id: RecordId) -> bool {
        let added = self.items.insert(id);
        if added {
            self.tracking.record(LinkEvent::Add(id));
        }
        added
    }

    /// Removes a link; returns false if it was absent.
    pub fn remove(&mut self, id: RecordId) -> bool {
        let removed = self.items.remove(&id);
        if removed {
            self.tracking.record(LinkEvent::Remove(id));
        }
        removed
    }

    /// True when `id` is a member.
    pub fn contains(&self, id: RecordId) -> bool {
        self.items.contains(&id)
    }

    /// Number of links.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the set holds no links.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Links in id order.
    pub fn iter(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.items.iter().copied()
    }

    /// Change tracking state.
    pub fn tracking(&self) -> &ChangeTracking {
        &self.tracking
    }

    pub(crate) fn tracking_mut(&mut self) -> &mut ChangeTracking {
        &mut self.tracking
    }

    pub(crate) fn rewind(&self) -> Option<Vec<RecordId>> {
        self.tracking.rewind(self.iter())
    }

    pub(crate) fn remap(&mut self, map: impl Fn(RecordId) -> RecordId) {
        self.items = std::mem::take(&mut self.items).into_iter().map(map).collect();
    }
}

impl FromIterator<RecordId> for LinkSet {
    fn from_iter<T: IntoIterator<Item = RecordId>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
            tracking: ChangeTracking::Snapshot,
        }
    }
}

impl PartialEq for LinkSet {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

/// String-keyed links.
#[derive(Clone, Debug, Default)]
pub struct LinkMap {
    entries: BTreeMap<String, RecordId>,
    tracking: ChangeTracking,
}

impl LinkMap {
    /// Empty, untracked map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key` to `id`, returning the previous binding.
    pub fn insert(&mut self, key: impl Into<String>, id: RecordId) -> Option<RecordId> {
        let old = self.entries.insert(key.into(), id);
        match old {
            Some(old) if old != id => self.tracking.record(LinkEvent::Update { old, new: id }),
            Some(_) => {}
            None => self.tracking.record(LinkEvent::Add(id)),
        }
        old
    }

    /// Removes the binding for `key`.
    pub fn remove(&mut self, key: &str) -> Option<RecordId> {
        let old = self.entries.remove(key)?;
        self.tracking.record(LinkEvent::Remove(old));
        Some(old)
    }

    /// Removes the first entry (in key order) whose value is `id`.
    pub fn remove_value(&mut self, id: RecordId) -> bool {
        let key = self
            .entries
            .iter()
            .find(|(_, value)| **value == id)
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => self.remove(&key).is_some(),
            None => false,
        }
    }

    /// Link bound to `key`.
    pub fn get(&self, key: &str) -> Option<RecordId> {
        self.entries.get(key).copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, RecordId)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Bound links in key order.
    pub fn values(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.entries.values().copied()
    }

    /// Change tracking state.
    pub fn tracking(&self) -> &ChangeTracking {
        &self.tracking
    }

    pub(crate) fn tracking_mut(&mut self) -> &mut ChangeTracking {
        &mut self.tracking
    }

    pub(crate) fn rewind(&self) -> Option<Vec<RecordId>> {
        self.tracking.rewind(self.values())
    }

    pub(crate) fn remap(&mut self, map: impl Fn(RecordId) -> RecordId) {
        for value in self.entries.values_mut() {
            *value = map(*value);
        }
    }
}

impl<K: Into<String>> FromIterator<(K, RecordId)> for LinkMap {
    fn from_iter<T: IntoIterator<Item = (K, RecordId)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            tracking: ChangeTracking::Snapshot,
        }
    }
}

impl PartialEq for LinkMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// Unordered multiset of links with constant-time add and remove.
///
/// Reverse-adjacency collections are always bags.
#[derive(Clone, Debug, Default)]
pub struct LinkBag {
    counts: FxHashMap<RecordId, u32>,
    size: usize,
    tracking: ChangeTracking,
}

impl LinkBag {
    /// Empty, untracked bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one occurrence of `id`.
    pub fn add(&mut self, id: RecordId) {
        *self.counts.entry(id).or_insert(0) += 1;
        self.size += 1;
        self.tracking.record(LinkEvent::Add(id));
    }

    /// Removes one occurrence of `id`; false if it was absent.
    pub fn remove(&mut self, id: RecordId) -> bool {
        let Some(count) = self.counts.get_mut(&id) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&id);
        }
        self.size -= 1;
        self.tracking.record(LinkEvent::Remove(id));
        true
    }

    /// True when at least one occurrence of `id` is present.
    pub fn contains(&self, id: RecordId) -> bool {
        self.counts.contains_key(&id)
    }

    /// Occurrences of `id`.
    pub fn count(&self, id: RecordId) -> u32 {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    /// Total occurrences.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Distinct members with their counts, in id order.
    pub fn entries(&self) -> Vec<(RecordId, u32)> {
        let mut entries: Vec<_> = self.counts.iter().map(|(id, n)| (*id, *n)).collect();
        entries.sort_unstable();
        entries
    }

    /// Every occurrence, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.counts
            .iter()
            .flat_map(|(id, n)| std::iter::repeat(*id).take(*n as usize))
    }

    /// Change tracking state.
    pub fn tracking(&self) -> &ChangeTracking {
        &self.tracking
    }

    pub(crate) fn tracking_mut(&mut self) -> &mut ChangeTracking {
        &mut self.tracking
    }

    pub(crate) fn rewind(&self) -> Option<Vec<RecordId>> {
        self.tracking.rewind(self.iter())
    }

    pub(crate) fn remap(&mut self, map: impl Fn(RecordId) -> RecordId) {
        let mut counts = FxHashMap::default();
        for (id, n) in self.counts.drain() {
            *counts.entry(map(id)).or_insert(0) += n;
        }
        self.counts = counts;
    }
}

impl FromIterator<RecordId> for LinkBag {
    fn from_iter<T: IntoIterator<Item = RecordId>>(iter: T) -> Self {
        let mut bag = LinkBag::new();
        for id in iter {
            *bag.counts.entry(id).or_insert(0) += 1;
            bag.size += 1;
        }
        bag
    }
}

impl PartialEq for LinkBag {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.counts == other.counts
    }
}
