//! In-memory records handled by a session.
//!
//! A [`Record`] pairs an identity and version with either an [`Entity`]
//! (documents, vertices and edges) or an opaque blob.

pub mod entity;
pub mod links;
pub mod ser;
/// Property values.
pub mod value;

pub use entity::{
    forward_property_name, is_reserved_property, reverse_property_name, Entity, PropertyChange,
    REVERSE_LINK_PREFIX,
};
pub use links::{ChangeTracking, LinkBag, LinkEvent, LinkList, LinkMap, LinkSet};
pub use value::Value;

use crate::types::{ClusterId, RecordId, Result, SessionError, CLUSTER_POS_INVALID};

/// Record type tag.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum RecordKind {
    /// Plain document.
    Document,
    /// Graph vertex.
    Vertex,
    /// Graph edge.
    Edge,
    /// Binary blob.
    Blob,
}

impl RecordKind {
    /// Byte stored next to the buffer in storage.
    pub const fn tag(self) -> u8 {
        match self {
            RecordKind::Document => b'd',
            RecordKind::Vertex => b'v',
            RecordKind::Edge => b'e',
            RecordKind::Blob => b'b',
        }
    }

    /// Inverse of [`RecordKind::tag`].
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            b'd' => Ok(RecordKind::Document),
            b'v' => Ok(RecordKind::Vertex),
            b'e' => Ok(RecordKind::Edge),
            b'b' => Ok(RecordKind::Blob),
            _ => Err(SessionError::Corruption("unknown record type tag")),
        }
    }

    /// True for kinds whose body is an [`Entity`].
    pub const fn is_entity(self) -> bool {
        !matches!(self, RecordKind::Blob)
    }
}

/// Record body.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordData {
    /// Property map.
    Entity(Entity),
    /// Opaque bytes.
    Blob(Vec<u8>),
}

/// A versioned record as seen by one session.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    id: RecordId,
    version: i32,
    kind: RecordKind,
    data: RecordData,
    blob_dirty: bool,
}

impl Record {
    fn with_data(kind: RecordKind, data: RecordData) -> Self {
        Self {
            id: RecordId::NEW,
            version: 0,
            kind,
            data,
            blob_dirty: false,
        }
    }

    /// New document record.
    pub fn document(entity: Entity) -> Self {
        Self::with_data(RecordKind::Document, RecordData::Entity(entity))
    }

    /// New vertex record.
    pub fn vertex(entity: Entity) -> Self {
        Self::with_data(RecordKind::Vertex, RecordData::Entity(entity))
    }

    /// New edge record.
    pub fn edge(entity: Entity) -> Self {
        Self::with_data(RecordKind::Edge, RecordData::Entity(entity))
    }

    /// New blob record.
    pub fn blob(bytes: impl Into<Vec<u8>>) -> Self {
        Self::with_data(RecordKind::Blob, RecordData::Blob(bytes.into()))
    }

    /// Places a new record in an explicit cluster instead of the class default.
    pub fn in_cluster(mut self, cluster: ClusterId) -> Self {
        self.id = RecordId::new(cluster, CLUSTER_POS_INVALID);
        self
    }

    pub(crate) fn from_parts(id: RecordId, version: i32, kind: RecordKind, data: RecordData) -> Self {
        Self {
            id,
            version,
            kind,
            data,
            blob_dirty: false,
        }
    }

    /// Identity; temporary while the creating transaction is open.
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Version last read from or written to storage.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Type tag.
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Body.
    pub fn data(&self) -> &RecordData {
        &self.data
    }

    /// Entity body, if this is not a blob.
    pub fn entity(&self) -> Option<&Entity> {
        match &self.data {
            RecordData::Entity(entity) => Some(entity),
            RecordData::Blob(_) => None,
        }
    }

    /// Mutable entity body, if this is not a blob.
    pub fn entity_mut(&mut self) -> Option<&mut Entity> {
        match &mut self.data {
            RecordData::Entity(entity) => Some(entity),
            RecordData::Blob(_) => None,
        }
    }

    /// Entity body or an error naming the record.
    pub fn expect_entity_mut(&mut self) -> Result<&mut Entity> {
        let id = self.id;
        self.entity_mut()
            .ok_or_else(|| SessionError::invalid(format!("record {id} is not an entity")))
    }

    /// Blob bytes, if this is a blob.
    pub fn blob_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            RecordData::Blob(bytes) => Some(bytes),
            RecordData::Entity(_) => None,
        }
    }

    /// Replaces the bytes of a blob record.
    pub fn set_blob_bytes(&mut self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        match &mut self.data {
            RecordData::Blob(current) => {
                *current = bytes.into();
                self.blob_dirty = true;
                Ok(())
            }
            RecordData::Entity(_) => Err(SessionError::invalid(format!(
                "record {} is not a blob",
                self.id
            ))),
        }
    }

    /// True when the body changed since the session last reconciled it.
    pub fn is_dirty(&self) -> bool {
        match &self.data {
            RecordData::Entity(entity) => entity.is_dirty(),
            RecordData::Blob(_) => self.blob_dirty,
        }
    }

    pub(crate) fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }

    pub(crate) fn set_version(&mut self, version: i32) {
        self.version = version;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.blob_dirty = false;
        if let RecordData::Entity(entity) = &mut self.data {
            entity.take_changes();
        }
    }

    /// Rewrites the identity and every link through `map`.
    pub(crate) fn remap_links(&mut self, map: &impl Fn(RecordId) -> RecordId) {
        self.id = map(self.id);
        if let RecordData::Entity(entity) = &mut self.data {
            entity.remap_links(map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip() -> Result<()> {
        for kind in [
            RecordKind::Document,
            RecordKind::Vertex,
            RecordKind::Edge,
            RecordKind::Blob,
        ] {
            assert_eq!(RecordKind::from_tag(kind.tag())?, kind);
        }
        assert!(RecordKind::from_tag(b'x').is_err());
        Ok(())
    }

    #[test]
    fn blob_dirtiness_follows_writes() -> Result<()> {
        let mut blob = Record::blob(vec![1, 2]);
        assert!(!blob.is_dirty());
        blob.set_blob_bytes(vec![3])?;
        assert!(blob.is_dirty());
        blob.mark_clean();
        assert!(!blob.is_dirty());
        assert!(Record::document(Entity::new()).set_blob_bytes(vec![]).is_err());
        Ok(())
    }

    #[test]
    fn explicit_cluster_is_kept_until_placement() {
        let record = Record::document(Entity::new()).in_cluster(7);
        assert_eq!(record.id().cluster(), 7);
        assert!(!record.id().is_valid_position());
    }
}
