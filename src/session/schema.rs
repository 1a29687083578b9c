//! Schema and security collaborators.
//!
//! The session only needs a narrow view of both: which clusters a class owns,
//! whether a class is a vertex or edge type, and yes/no permission answers.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::record::{Entity, Record};
use crate::types::{ClusterId, Permission, Resource, Result, SessionError};

/// Structural flavour of a schema class.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ClassKind {
    /// Plain documents.
    Document,
    /// Graph vertices; `out_*`/`in_*` properties belong to the edge protocol.
    Vertex,
    /// Graph edges; `out`/`in` properties belong to the edge protocol.
    Edge,
}

/// Immutable snapshot of one schema class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaClass {
    name: String,
    kind: ClassKind,
    clusters: Vec<ClusterId>,
    superclass: Option<String>,
}

impl SchemaClass {
    /// Class without clusters or superclass.
    pub fn new(name: impl Into<String>, kind: ClassKind) -> Self {
        Self {
            name: name.into(),
            kind,
            clusters: Vec::new(),
            superclass: None,
        }
    }

    /// Sets the clusters owned by this class; the first receives new records.
    pub fn with_clusters(mut self, clusters: impl IntoIterator<Item = ClusterId>) -> Self {
        self.clusters = clusters.into_iter().collect();
        self
    }

    /// Sets the direct superclass.
    pub fn with_superclass(mut self, name: impl Into<String>) -> Self {
        self.superclass = Some(name.into());
        self
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Structural flavour.
    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    /// Clusters owned directly by this class.
    pub fn clusters(&self) -> &[ClusterId] {
        &self.clusters
    }

    /// Direct superclass name.
    pub fn superclass(&self) -> Option<&str> {
        self.superclass.as_deref()
    }
}

/// Schema collaborator.
pub trait Schema: Send + Sync {
    /// Class by name.
    fn class(&self, name: &str) -> Option<SchemaClass>;

    /// Every direct and indirect subclass of `name`.
    fn subclasses(&self, name: &str) -> Vec<SchemaClass>;

    /// Class of an entity, if it has one the schema knows.
    fn class_of(&self, entity: &Entity) -> Option<SchemaClass> {
        entity.class().and_then(|name| self.class(name))
    }

    /// Cluster that receives new records of `class`.
    fn cluster_for_new_record(&self, class: &SchemaClass) -> Option<ClusterId> {
        class.clusters().first().copied()
    }

    /// Clusters of `name`, plus those of its subclasses when `polymorphic`.
    /// Ascending and free of duplicates.
    fn clusters_of(&self, name: &str, polymorphic: bool) -> Option<Vec<ClusterId>> {
        let class = self.class(name)?;
        let mut clusters = class.clusters().to_vec();
        if polymorphic {
            for sub in self.subclasses(name) {
                clusters.extend_from_slice(sub.clusters());
            }
        }
        clusters.sort_unstable();
        clusters.dedup();
        Some(clusters)
    }
}

/// Security collaborator.
pub trait Security: Send + Sync {
    /// Fails with [`SessionError::SecurityDenied`] when the operation is not allowed.
    fn check(&self, resource: &Resource, permission: Permission) -> Result<()>;

    /// Row-level visibility; `false` hides the record as if it did not exist.
    fn can_read(&self, _record: &Record) -> bool {
        true
    }
}

/// Security collaborator that allows everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Security for AllowAll {
    fn check(&self, _resource: &Resource, _permission: Permission) -> Result<()> {
        Ok(())
    }
}

/// Schema held in memory; classes can be added while sessions use it.
#[derive(Default)]
pub struct StaticSchema {
    classes: RwLock<BTreeMap<String, SchemaClass>>,
}

impl StaticSchema {
    /// Empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a class.
    pub fn add_class(&self, class: SchemaClass) -> Result<()> {
        if let Some(parent) = class.superclass() {
            if parent == class.name() {
                return Err(SessionError::invalid(format!(
                    "class {} cannot extend itself",
                    class.name()
                )));
            }
            if !self.classes.read().contains_key(parent) {
                return Err(SessionError::invalid(format!(
                    "superclass {parent} of {} is not defined",
                    class.name()
                )));
            }
        }
        self.classes.write().insert(class.name().to_owned(), class);
        Ok(())
    }
}

impl Schema for StaticSchema {
    fn class(&self, name: &str) -> Option<SchemaClass> {
        self.classes.read().get(name).cloned()
    }

    fn subclasses(&self, name: &str) -> Vec<SchemaClass> {
        let classes = self.classes.read();
        let mut found: Vec<SchemaClass> = Vec::new();
        let mut frontier = vec![name.to_owned()];
        while let Some(parent) = frontier.pop() {
            for class in classes.values() {
                if class.superclass() == Some(parent.as_str())
                    && !found.iter().any(|c| c.name() == class.name())
                {
                    frontier.push(class.name().to_owned());
                    found.push(class.clone());
                }
            }
        }
        found
    }
}
