//! Entities: property maps with per-property change tracking.
//!
//! Reverse-adjacency bags live in the same property map under a reserved
//! namespace: the bag mirroring forward property `friends` is stored as
//! `#friends`. Names starting with [`REVERSE_LINK_PREFIX`] are a persisted
//! naming contract. Callers cannot set them and ordinary property
//! accessors do not return them.

use std::collections::BTreeMap;

use crate::record::links::{LinkBag, LinkList, LinkMap, LinkSet};
use crate::record::value::Value;
use crate::types::{RecordId, Result, SessionError};

/// Marker that starts every reverse-adjacency property name.
pub const REVERSE_LINK_PREFIX: char = '#';

/// Reserved property name holding the reverse bag for `forward`.
pub fn reverse_property_name(forward: &str) -> String {
    let mut name = String::with_capacity(forward.len() + 1);
    name.push(REVERSE_LINK_PREFIX);
    name.push_str(forward);
    name
}

/// Forward property name mirrored by a reserved name, if `name` is reserved.
pub fn forward_property_name(name: &str) -> Option<&str> {
    name.strip_prefix(REVERSE_LINK_PREFIX)
}

/// True for names in the reserved reverse-adjacency namespace.
pub fn is_reserved_property(name: &str) -> bool {
    name.starts_with(REVERSE_LINK_PREFIX)
}

/// How a property changed since the entity was last reconciled.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyChange {
    /// The value was replaced (or removed); holds the value before the first
    /// replacement, `None` if the property did not exist.
    Replaced(Option<Value>),
    /// The container was mutated through a mutable reference. Its own
    /// timeline, if it keeps one, says what changed.
    InPlace,
}

/// Schema-flexible record body: optional class name plus named properties.
#[derive(Clone, Debug, Default)]
pub struct Entity {
    class: Option<String>,
    properties: BTreeMap<String, Value>,
    changes: BTreeMap<String, PropertyChange>,
}

impl Entity {
    /// Entity without a class.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entity of the given schema class.
    pub fn with_class(class: impl Into<String>) -> Self {
        Self {
            class: Some(class.into()),
            ..Self::default()
        }
    }

    /// Schema class name.
    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    /// Value of a user-visible property.
    pub fn get(&self, name: &str) -> Option<&Value> {
        if is_reserved_property(name) {
            return None;
        }
        self.properties.get(name)
    }

    /// True when the user-visible property exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets a property, returning the previous value.
    ///
    /// Link containers passed in start logging their mutations from here on.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<Option<Value>> {
        let name = name.into();
        check_property_name(&name)?;
        let mut value = value.into();
        self.note_replaced(&name);
        value.start_tracking();
        Ok(self.properties.insert(name, value))
    }

    /// Removes a property, returning its value.
    pub fn remove(&mut self, name: &str) -> Result<Option<Value>> {
        check_property_name(name)?;
        if !self.properties.contains_key(name) {
            return Ok(None);
        }
        self.note_replaced(name);
        Ok(self.properties.remove(name))
    }

    /// Mutable access to a property value.
    ///
    /// Link containers record the access as an in-place change and rely on
    /// their timeline. Any other value is snapshotted first, as if replaced.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        if is_reserved_property(name) {
            return None;
        }
        if self.properties.get(name)?.tracking().is_some() {
            self.changes
                .entry(name.to_owned())
                .or_insert(PropertyChange::InPlace);
        } else {
            self.note_replaced(name);
        }
        self.properties.get_mut(name)
    }

    /// Mutable link list stored under `name`.
    pub fn link_list_mut(&mut self, name: &str) -> Result<&mut LinkList> {
        match self.get_mut(name) {
            Some(Value::LinkList(list)) => Ok(list),
            _ => Err(SessionError::invalid(format!("property {name} is not a link list"))),
        }
    }

    /// Mutable link set stored under `name`.
    pub fn link_set_mut(&mut self, name: &str) -> Result<&mut LinkSet> {
        match self.get_mut(name) {
            Some(Value::LinkSet(set)) => Ok(set),
            _ => Err(SessionError::invalid(format!("property {name} is not a link set"))),
        }
    }

    /// Mutable link map stored under `name`.
    pub fn link_map_mut(&mut self, name: &str) -> Result<&mut LinkMap> {
        match self.get_mut(name) {
            Some(Value::LinkMap(map)) => Ok(map),
            _ => Err(SessionError::invalid(format!("property {name} is not a link map"))),
        }
    }

    /// Mutable link bag stored under `name`.
    pub fn link_bag_mut(&mut self, name: &str) -> Result<&mut LinkBag> {
        match self.get_mut(name) {
            Some(Value::LinkBag(bag)) => Ok(bag),
            _ => Err(SessionError::invalid(format!("property {name} is not a link bag"))),
        }
    }

    /// User-visible properties in name order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.properties
            .iter()
            .filter(|(name, _)| !is_reserved_property(name))
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Names of user-visible properties.
    pub fn property_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.properties().map(|(name, _)| name)
    }

    /// Records that point at this entity through their property `forward`.
    pub fn reverse_links(&self, forward: &str) -> Option<&LinkBag> {
        match self.properties.get(&reverse_property_name(forward)) {
            Some(Value::LinkBag(bag)) => Some(bag),
            _ => None,
        }
    }

    /// Every reverse bag, keyed by the forward property it mirrors.
    pub fn reverse_link_properties(&self) -> impl Iterator<Item = (&str, &LinkBag)> + '_ {
        self.properties.iter().filter_map(|(name, value)| {
            let forward = forward_property_name(name)?;
            match value {
                Value::LinkBag(bag) => Some((forward, bag)),
                _ => None,
            }
        })
    }

    /// Changes recorded since the last reconciliation.
    pub fn changes(&self) -> &BTreeMap<String, PropertyChange> {
        &self.changes
    }

    /// True when some property changed since the last reconciliation.
    pub fn is_dirty(&self) -> bool {
        !self.changes.is_empty()
    }

    pub(crate) fn raw(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    pub(crate) fn from_raw(class: Option<String>, properties: BTreeMap<String, Value>) -> Self {
        let mut entity = Self {
            class,
            properties,
            changes: BTreeMap::new(),
        };
        for value in entity.properties.values_mut() {
            value.start_tracking();
        }
        entity
    }

    /// Reverse bag for `forward`, created on demand when `create` is set.
    pub(crate) fn reverse_bag_mut(&mut self, forward: &str, create: bool) -> Option<&mut LinkBag> {
        let name = reverse_property_name(forward);
        if create && !self.properties.contains_key(&name) {
            let mut bag = LinkBag::new();
            bag.tracking_mut().start();
            self.properties.insert(name.clone(), Value::LinkBag(bag));
        }
        match self.properties.get_mut(&name) {
            Some(Value::LinkBag(bag)) => Some(bag),
            _ => None,
        }
    }

    pub(crate) fn remove_reverse_bag(&mut self, forward: &str) {
        self.properties.remove(&reverse_property_name(forward));
    }

    /// Mutable access that bypasses change tracking; used for maintenance writes.
    pub(crate) fn value_mut_untracked(&mut self, name: &str) -> Option<&mut Value> {
        self.properties.get_mut(name)
    }

    /// Ends the current change window: returns what changed and resets
    /// every container timeline.
    pub(crate) fn take_changes(&mut self) -> BTreeMap<String, PropertyChange> {
        let changes = std::mem::take(&mut self.changes);
        for value in self.properties.values_mut() {
            value.clear_timeline();
        }
        changes
    }

    pub(crate) fn remap_links(&mut self, map: &impl Fn(RecordId) -> RecordId) {
        for value in self.properties.values_mut() {
            value.remap_links(map);
        }
        for change in self.changes.values_mut() {
            if let PropertyChange::Replaced(Some(original)) = change {
                original.remap_links(map);
            }
        }
    }

    fn note_replaced(&mut self, name: &str) {
        match self.changes.get(name) {
            None => {
                let original = self.properties.get(name).cloned();
                self.changes
                    .insert(name.to_owned(), PropertyChange::Replaced(original));
            }
            Some(PropertyChange::InPlace) => {
                // The container was edited in place before being replaced; rebuild
                // what it held from its timeline. Without one the change stays
                // in-place and reconciliation reports it as unsupported.
                if let Some(original) = self.properties.get(name).and_then(Value::rewound) {
                    self.changes
                        .insert(name.to_owned(), PropertyChange::Replaced(Some(original)));
                }
            }
            Some(PropertyChange::Replaced(_)) => {}
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.properties == other.properties
    }
}

fn check_property_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SessionError::invalid("property names must be non-empty"));
    }
    if is_reserved_property(name) {
        return Err(SessionError::invalid(format!(
            "property name {name} uses the reserved '{REVERSE_LINK_PREFIX}' prefix"
        )));
    }
    Ok(())
}
