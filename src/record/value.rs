use std::collections::BTreeMap;

use crate::record::links::{ChangeTracking, LinkBag, LinkList, LinkMap, LinkSet};
use crate::types::RecordId;

/// Property value stored on an entity.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Single link to another record.
    Link(RecordId),
    /// Ordered links.
    LinkList(LinkList),
    /// Unique links.
    LinkSet(LinkSet),
    /// String-keyed links.
    LinkMap(LinkMap),
    /// Multiset of links.
    LinkBag(LinkBag),
    /// Nested map stored inline; never a reference.
    Embedded(BTreeMap<String, Value>),
    /// Nested list stored inline; never a reference.
    EmbeddedList(Vec<Value>),
}

impl Value {
    /// True for the values that hold references to other records.
    pub fn is_link(&self) -> bool {
        matches!(
            self,
            Value::Link(_)
                | Value::LinkList(_)
                | Value::LinkSet(_)
                | Value::LinkMap(_)
                | Value::LinkBag(_)
        )
    }

    /// Calls `f` for every referenced id, once per occurrence.
    ///
    /// Embedded values never contribute: their content is not a reference.
    pub fn for_each_link(&self, mut f: impl FnMut(RecordId)) {
        match self {
            Value::Link(id) => f(*id),
            Value::LinkList(list) => list.iter().for_each(f),
            Value::LinkSet(set) => set.iter().for_each(f),
            Value::LinkMap(map) => map.values().for_each(f),
            Value::LinkBag(bag) => bag.iter().for_each(f),
            _ => {}
        }
    }

    /// Change tracking of a link container; `None` for every other value.
    pub fn tracking(&self) -> Option<&ChangeTracking> {
        match self {
            Value::LinkList(list) => Some(list.tracking()),
            Value::LinkSet(set) => Some(set.tracking()),
            Value::LinkMap(map) => Some(map.tracking()),
            Value::LinkBag(bag) => Some(bag.tracking()),
            _ => None,
        }
    }

    fn tracking_mut(&mut self) -> Option<&mut ChangeTracking> {
        match self {
            Value::LinkList(list) => Some(list.tracking_mut()),
            Value::LinkSet(set) => Some(set.tracking_mut()),
            Value::LinkMap(map) => Some(map.tracking_mut()),
            Value::LinkBag(bag) => Some(bag.tracking_mut()),
            _ => None,
        }
    }

    /// Switches a link container to timeline tracking.
    pub(crate) fn start_tracking(&mut self) {
        if let Some(tracking) = self.tracking_mut() {
            tracking.start();
        }
    }

    /// Drops logged events, keeping the tracking mode.
    pub(crate) fn clear_timeline(&mut self) {
        if let Some(tracking) = self.tracking_mut() {
            tracking.clear();
        }
    }

    /// Contents of a timeline-tracked container before its logged events,
    /// as a list of ids. `None` when nothing was logged to rewind from.
    pub(crate) fn rewound(&self) -> Option<Value> {
        let ids = match self {
            Value::LinkList(list) => list.rewind(),
            Value::LinkSet(set) => set.rewind(),
            Value::LinkMap(map) => map.rewind(),
            Value::LinkBag(bag) => bag.rewind(),
            _ => None,
        }?;
        Some(Value::LinkList(ids.into_iter().collect()))
    }

    /// Rewrites every reference through `map`.
    pub(crate) fn remap_links(&mut self, map: &impl Fn(RecordId) -> RecordId) {
        match self {
            Value::Link(id) => *id = map(*id),
            Value::LinkList(list) => list.remap(map),
            Value::LinkSet(set) => set.remap(map),
            Value::LinkMap(links) => links.remap(map),
            Value::LinkBag(bag) => bag.remap(map),
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<RecordId> for Value {
    fn from(value: RecordId) -> Self {
        Value::Link(value)
    }
}

impl From<LinkList> for Value {
    fn from(value: LinkList) -> Self {
        Value::LinkList(value)
    }
}

impl From<LinkSet> for Value {
    fn from(value: LinkSet) -> Self {
        Value::LinkSet(value)
    }
}

impl From<LinkMap> for Value {
    fn from(value: LinkMap) -> Self {
        Value::LinkMap(value)
    }
}

impl From<LinkBag> for Value {
    fn from(value: LinkBag) -> Self {
        Value::LinkBag(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_values_hold_no_links() {
        let inner = Value::Embedded(BTreeMap::from([(
            "ref".to_owned(),
            Value::Link(RecordId::new(1, 1)),
        )]));
        let mut seen = Vec::new();
        inner.for_each_link(|id| seen.push(id));
        assert!(seen.is_empty());
        assert!(!inner.is_link());
    }

    #[test]
    fn links_flatten_with_multiplicity() {
        let a = RecordId::new(1, 1);
        let b = RecordId::new(1, 2);
        let value = Value::LinkList([a, b, a].into_iter().collect());
        let mut seen = Vec::new();
        value.for_each_link(|id| seen.push(id));
        assert_eq!(seen, vec![a, b, a]);
    }

    #[test]
    fn remap_rewrites_every_variant() {
        let temp = RecordId::new(2, -2);
        let real = RecordId::new(2, 0);
        let swap = |id: RecordId| if id == temp { real } else { id };
        let mut values = vec![
            Value::Link(temp),
            Value::LinkList([temp].into_iter().collect()),
            Value::LinkSet([temp].into_iter().collect()),
            Value::LinkMap([("k", temp)].into_iter().collect()),
            Value::LinkBag([temp, temp].into_iter().collect()),
        ];
        for value in &mut values {
            value.remap_links(&swap);
            value.for_each_link(|id| assert_eq!(id, real));
        }
    }
}
