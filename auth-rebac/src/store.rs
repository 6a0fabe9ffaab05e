use crate::{
    cache::VersionTable,
    error::RebacError,
    models::*,
    repository::TupleRepository,
    schema::Schema,
    tree::ResourceTree,
    zone::ZoneGuard,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Validated tuple writes. Every successful mutation bumps the version
/// counters it affects before returning.
pub struct TupleStore {
    repository: Arc<dyn TupleRepository>,
    tree: Arc<dyn ResourceTree>,
    schema: Arc<Schema>,
    zone_guard: Arc<ZoneGuard>,
    versions: Arc<VersionTable>,
    revoke_policy: RevokePolicy,
}

impl TupleStore {
    pub fn new(
        repository: Arc<dyn TupleRepository>,
        tree: Arc<dyn ResourceTree>,
        schema: Arc<Schema>,
        zone_guard: Arc<ZoneGuard>,
        versions: Arc<VersionTable>,
    ) -> Self {
        Self {
            repository,
            tree,
            schema,
            zone_guard,
            versions,
            revoke_policy: RevokePolicy::default(),
        }
    }

    pub fn with_revoke_policy(mut self, policy: RevokePolicy) -> Self {
        self.revoke_policy = policy;
        self
    }

    pub fn revoke_policy(&self) -> RevokePolicy {
        self.revoke_policy
    }

    pub async fn create_tuple(
        &self,
        subject: SubjectRef,
        relation: Relation,
        object: ObjectRef,
        zone_id: ZoneId,
    ) -> Result<TupleId, RebacError> {
        let tuple = RelationTuple::new(subject, relation, object, zone_id);
        self.schema.validate_tuple(&tuple)?;

        if tuple.object.is_resource() {
            let node = self
                .tree
                .node(&tuple.object.id)
                .await?
                .ok_or_else(|| RebacError::NotFound(format!("unknown resource {}", tuple.object.id)))?;
            if node.object_type != tuple.object.object_type {
                return Err(RebacError::InvalidTuple(format!(
                    "{} is a {}, not a {}",
                    node.path,
                    node.object_type.as_str(),
                    tuple.object.object_type.as_str()
                )));
            }
        }
        self.zone_guard.validate_tuple_zone(&tuple).await?;

        let id = self.repository.insert(tuple.clone()).await?;
        self.versions.bump_for_tuple(&tuple);

        info!(tuple_id = %id, zone = %tuple.zone_id, "Created tuple {}", tuple.key());
        Ok(id)
    }

    pub async fn revoke_tuple(&self, key: &TupleKey) -> Result<RelationTuple, RebacError> {
        let revoked = self.repository.revoke(key, Utc::now(), self.revoke_policy).await?;
        self.versions.bump_for_tuple(&revoked);

        info!(tuple_id = %revoked.id, "Revoked tuple {}", key);
        Ok(revoked)
    }

    pub async fn list_tuples_for_object(&self, object: &ObjectRef) -> Result<Vec<RelationTuple>, RebacError> {
        self.repository.read_tuples(None, None, Some(object)).await
    }

    pub async fn list_tuples_for_subject(&self, subject: &SubjectRef) -> Result<Vec<RelationTuple>, RebacError> {
        self.repository.read_tuples(Some(subject), None, None).await
    }

    /// Retained rows on `object`, including Revoked and Deleted ones
    pub async fn tuple_history(&self, object: &ObjectRef) -> Result<Vec<RelationTuple>, RebacError> {
        self.repository.read_history(object).await
    }
}
