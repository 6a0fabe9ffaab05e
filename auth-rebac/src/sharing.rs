use crate::{
    check::PermissionChecker,
    error::RebacError,
    models::*,
    store::TupleStore,
    tree::ResourceTree,
    zone::ZoneGuard,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Grants and revokes on behalf of an actor, gated by the actor's own
/// `share` permission.
pub struct SharingService {
    checker: Arc<PermissionChecker>,
    store: Arc<TupleStore>,
    zone_guard: Arc<ZoneGuard>,
    tree: Arc<dyn ResourceTree>,
}

impl SharingService {
    pub fn new(
        checker: Arc<PermissionChecker>,
        store: Arc<TupleStore>,
        zone_guard: Arc<ZoneGuard>,
        tree: Arc<dyn ResourceTree>,
    ) -> Self {
        Self {
            checker,
            store,
            zone_guard,
            tree,
        }
    }

    /// Give `target` `relation` on `resource`. Cross-zone targets may only
    /// receive `shared_with`.
    pub async fn share(
        &self,
        actor: &SubjectRef,
        target: &SubjectRef,
        relation: Relation,
        resource: &str,
        zone_id: &ZoneId,
    ) -> Result<TupleId, RebacError> {
        if relation == Relation::MemberOf {
            return Err(RebacError::InvalidTuple(
                "group membership is not granted through sharing".to_string(),
            ));
        }

        let node = self.authorize(actor, resource, zone_id).await?;
        let target_zone = self.zone_guard.subject_zone(target).await?;

        let tuple_zone = if target_zone == node.zone_id {
            node.zone_id.clone()
        } else if relation == Relation::SharedWith {
            info!("{} shares {} with {} across zones", actor, resource, target);
            target_zone
        } else {
            return Err(RebacError::ZoneMismatch(format!(
                "{} lives in zone {}; only shared_with may cross into zone {}",
                target, target_zone, node.zone_id
            )));
        };

        self.store
            .create_tuple(target.clone(), relation, node.object(), tuple_zone)
            .await
    }

    /// Take `relation` on `resource` away from `target`, under the same gate
    pub async fn unshare(
        &self,
        actor: &SubjectRef,
        target: &SubjectRef,
        relation: Relation,
        resource: &str,
        zone_id: &ZoneId,
    ) -> Result<RelationTuple, RebacError> {
        let node = self.authorize(actor, resource, zone_id).await?;
        self.store
            .revoke_tuple(&TupleKey::new(target.clone(), relation, node.object()))
            .await
    }

    /// The actor must be allowed `share`, which only an effective owner is.
    async fn authorize(
        &self,
        actor: &SubjectRef,
        resource: &str,
        zone_id: &ZoneId,
    ) -> Result<ResourceNode, RebacError> {
        let request = CheckRequest {
            subject: actor.clone(),
            action: Action::Share,
            resource: resource.to_string(),
            zone_id: zone_id.clone(),
        };
        let response = self.checker.check(&request, None).await;

        match response.error {
            Some(err) if err.is_retryable() || matches!(err, RebacError::Timeout | RebacError::Storage(_)) => {
                return Err(err)
            }
            _ => {}
        }
        if !response.decision.is_allowed() {
            warn!(actor = %actor, resource, "Share denied");
            return Err(RebacError::PermissionDenied(format!(
                "{} may not share {}",
                actor, resource
            )));
        }

        self.tree
            .node(resource)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("unknown resource {}", resource)))
    }
}
