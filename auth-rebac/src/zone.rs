use crate::{
    cache::{VersionScope, VersionStamp, VersionTable},
    error::RebacError,
    models::*,
    repository::TupleRepository,
    tree::ResourceTree,
};
use std::sync::Arc;
use tracing::debug;

/// Enforces zone isolation for checks and for tuple writes
pub struct ZoneGuard {
    repository: Arc<dyn TupleRepository>,
    tree: Arc<dyn ResourceTree>,
}

impl ZoneGuard {
    pub fn new(repository: Arc<dyn TupleRepository>, tree: Arc<dyn ResourceTree>) -> Self {
        Self { repository, tree }
    }

    pub async fn subject_zone(&self, subject: &SubjectRef) -> Result<ZoneId, RebacError> {
        self.tree
            .subject_zone(subject)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("unknown subject {}", subject)))
    }

    /// Zone an object lives in
    pub async fn object_zone(&self, object: &ObjectRef) -> Result<ZoneId, RebacError> {
        match object.object_type {
            ObjectType::Zone => Ok(ZoneId::new(&object.id)),
            ObjectType::Group => {
                let group = SubjectRef::group(&object.id);
                self.subject_zone(&group).await
            }
            ObjectType::File | ObjectType::Directory => self
                .tree
                .node(&object.id)
                .await?
                .map(|node| node.zone_id)
                .ok_or_else(|| RebacError::NotFound(format!("unknown resource {}", object.id))),
        }
    }

    /// Same zone, or an Active `shared_with` for exactly this pair.
    pub async fn validate(
        &self,
        subject: &SubjectRef,
        node: &ResourceNode,
        versions: &VersionTable,
        stamp: &mut VersionStamp,
    ) -> Result<(), RebacError> {
        let subject_zone = self.subject_zone(subject).await?;
        if subject_zone == node.zone_id {
            return Ok(());
        }

        let object = node.object();
        stamp.observe(versions, VersionScope::Object(object.clone()));
        let key = TupleKey::new(subject.clone(), Relation::SharedWith, object);
        if self.repository.find_active(&key).await?.is_some() {
            debug!("Cross-zone access for {} to {} via shared_with", subject, node.path);
            return Ok(());
        }

        Err(RebacError::CrossZoneDenied {
            subject: subject.to_string(),
            resource: node.path.clone(),
        })
    }

    /// Tuple zone must be the object's zone, and so must the subject's.
    /// `shared_with` is the one relation that crosses zones; it may carry
    /// either side's zone.
    pub async fn validate_tuple_zone(&self, tuple: &RelationTuple) -> Result<(), RebacError> {
        let object_zone = self.object_zone(&tuple.object).await?;
        let subject_zone = self.subject_zone(&tuple.subject).await?;

        let allowed = if tuple.relation == Relation::SharedWith {
            tuple.zone_id == object_zone || tuple.zone_id == subject_zone
        } else {
            tuple.zone_id == object_zone && subject_zone == object_zone
        };
        if allowed {
            return Ok(());
        }

        Err(RebacError::ZoneMismatch(format!(
            "tuple {} is in zone {}, subject lives in {}, object in {}",
            tuple.key(),
            tuple.zone_id,
            subject_zone,
            object_zone
        )))
    }
}
