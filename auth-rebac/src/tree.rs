//! Read-only view of the filesystem hierarchy and subject directory.
//!
//! The path/metadata layer owns nodes and subjects; the authorization core
//! only needs parent pointers and zones. `InMemoryResourceTree` is the
//! reference implementation used by tests and embedders without a
//! metadata store.

use crate::{error::RebacError, models::*};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[async_trait]
pub trait ResourceTree: Send + Sync {
    /// Look up a file or directory by path
    async fn node(&self, path: &str) -> Result<Option<ResourceNode>, RebacError>;

    /// Zone a subject was created in
    async fn subject_zone(&self, subject: &SubjectRef) -> Result<Option<ZoneId>, RebacError>;
}

/// Deletion performed by the caller inside a cascade transaction.
/// Returning an error rolls the cascade back.
#[async_trait]
pub trait DeletionHook: Send + Sync {
    async fn delete(&self) -> anyhow::Result<()>;
}

/// For cascades with nothing else to delete, e.g. orphan cleanup
pub struct NoopDeletion;

#[async_trait]
impl DeletionHook for NoopDeletion {
    async fn delete(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory hierarchy for testing and development
#[derive(Clone, Default)]
pub struct InMemoryResourceTree {
    nodes: Arc<DashMap<String, ResourceNode>>,
    subjects: Arc<DashMap<SubjectRef, ZoneId>>,
}

impl InMemoryResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a zone root directory
    pub fn add_zone_root(&self, zone: &ZoneId, path: &str) -> ResourceNode {
        let node = ResourceNode {
            path: path.to_string(),
            object_type: ObjectType::Directory,
            zone_id: zone.clone(),
            parent: None,
        };
        self.nodes.insert(node.path.clone(), node.clone());
        node
    }

    pub fn add_directory(&self, parent: &str, path: &str) -> Result<ResourceNode, RebacError> {
        self.add_child(parent, path, ObjectType::Directory)
    }

    pub fn add_file(&self, parent: &str, path: &str) -> Result<ResourceNode, RebacError> {
        self.add_child(parent, path, ObjectType::File)
    }

    fn add_child(&self, parent: &str, path: &str, object_type: ObjectType) -> Result<ResourceNode, RebacError> {
        let zone_id = {
            let parent_node = self
                .nodes
                .get(parent)
                .ok_or_else(|| RebacError::NotFound(format!("parent directory {}", parent)))?;
            if parent_node.object_type != ObjectType::Directory {
                return Err(RebacError::InvalidTuple(format!("{} is not a directory", parent)));
            }
            parent_node.zone_id.clone()
        };

        let node = ResourceNode {
            path: path.to_string(),
            object_type,
            zone_id,
            parent: Some(parent.to_string()),
        };
        self.nodes.insert(node.path.clone(), node.clone());
        Ok(node)
    }

    pub fn add_subject(&self, subject: SubjectRef, zone: &ZoneId) {
        self.subjects.insert(subject, zone.clone());
    }

    pub fn remove_node(&self, path: &str) -> Option<ResourceNode> {
        self.nodes.remove(path).map(|(_, node)| node)
    }

    pub fn remove_subject(&self, subject: &SubjectRef) -> Option<ZoneId> {
        self.subjects.remove(subject).map(|(_, zone)| zone)
    }

    /// Deletion hook that drops `path` from the tree when the cascade commits
    pub fn node_removal(&self, path: &str) -> NodeRemoval {
        NodeRemoval {
            tree: self.clone(),
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl ResourceTree for InMemoryResourceTree {
    async fn node(&self, path: &str) -> Result<Option<ResourceNode>, RebacError> {
        Ok(self.nodes.get(path).map(|entry| entry.value().clone()))
    }

    async fn subject_zone(&self, subject: &SubjectRef) -> Result<Option<ZoneId>, RebacError> {
        Ok(self.subjects.get(subject).map(|entry| entry.value().clone()))
    }
}

pub struct NodeRemoval {
    tree: InMemoryResourceTree,
    path: String,
}

#[async_trait]
impl DeletionHook for NodeRemoval {
    async fn delete(&self) -> anyhow::Result<()> {
        self.tree
            .remove_node(&self.path)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("node {} already removed", self.path))
    }
}
