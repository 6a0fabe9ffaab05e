use crate::{
    cache::{CheckCache, VersionTable},
    check::PermissionChecker,
    config::EngineConfig,
    error::RebacError,
    expand::{Expansion, RelationExpander},
    lifecycle::LifecycleManager,
    models::*,
    repository::TupleRepository,
    schema::Schema,
    sharing::SharingService,
    stats::{CheckMetrics, CheckStats},
    store::TupleStore,
    tree::{DeletionHook, ResourceTree},
    zone::ZoneGuard,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// ReBAC authorization engine for one filesystem deployment.
///
/// Owns its version counters and check cache; two engines in one process
/// never share invalidation state.
pub struct AuthorizationEngine {
    repository: Arc<dyn TupleRepository>,
    tree: Arc<dyn ResourceTree>,
    schema: Arc<Schema>,
    config: EngineConfig,

    versions: Arc<VersionTable>,
    cache: Option<Arc<CheckCache>>,
    metrics: Arc<CheckMetrics>,

    expander: Arc<RelationExpander>,
    checker: Arc<PermissionChecker>,
    store: Arc<TupleStore>,
    sharing: SharingService,
    lifecycle: LifecycleManager,
}

impl AuthorizationEngine {
    /// Create an engine with the filesystem schema and default config
    pub fn new(repository: Arc<dyn TupleRepository>, tree: Arc<dyn ResourceTree>) -> Self {
        Self::assemble(repository, tree, Schema::default(), EngineConfig::default())
    }

    /// Rebuild with `config`, rejecting invalid bounds
    pub fn with_config(self, config: EngineConfig) -> Result<Self, RebacError> {
        config.validate()?;
        let schema = (*self.schema).clone();
        Ok(Self::assemble(self.repository, self.tree, schema, config))
    }

    /// Rebuild with a custom schema
    pub fn with_schema(self, schema: Schema) -> Result<Self, RebacError> {
        schema.validate()?;
        Ok(Self::assemble(self.repository, self.tree, schema, self.config))
    }

    fn assemble(
        repository: Arc<dyn TupleRepository>,
        tree: Arc<dyn ResourceTree>,
        schema: Schema,
        config: EngineConfig,
    ) -> Self {
        let schema = Arc::new(schema);
        let versions = Arc::new(VersionTable::new());
        let metrics = Arc::new(CheckMetrics::new());
        let cache = config
            .cache_enabled
            .then(|| Arc::new(CheckCache::new(versions.clone(), config.cache_capacity)));

        let zone_guard = Arc::new(ZoneGuard::new(repository.clone(), tree.clone()));
        let expander = Arc::new(
            RelationExpander::new(
                repository.clone(),
                tree.clone(),
                schema.clone(),
                zone_guard.clone(),
                versions.clone(),
            )
            .with_limits(config.max_ancestor_depth, config.max_group_depth),
        );
        let checker = Arc::new(PermissionChecker::new(
            expander.clone(),
            versions.clone(),
            cache.clone(),
            metrics.clone(),
            &config,
        ));
        let store = Arc::new(
            TupleStore::new(
                repository.clone(),
                tree.clone(),
                schema.clone(),
                zone_guard.clone(),
                versions.clone(),
            )
            .with_revoke_policy(config.revoke_policy),
        );
        let sharing = SharingService::new(checker.clone(), store.clone(), zone_guard, tree.clone());
        let lifecycle = LifecycleManager::new(repository.clone(), tree.clone(), store.clone(), versions.clone());

        debug!(
            cache = config.cache_enabled,
            max_ancestor_depth = config.max_ancestor_depth,
            max_group_depth = config.max_group_depth,
            "Assembled authorization engine"
        );

        Self {
            repository,
            tree,
            schema,
            config,
            versions,
            cache,
            metrics,
            expander,
            checker,
            store,
            sharing,
            lifecycle,
        }
    }

    // =============================================================================
    // Checks
    // =============================================================================

    /// Check `subject` doing `action` on `resource`, which the caller expects
    /// to live in `zone_id`. Never errors: faults come back as Deny with the
    /// originating error attached.
    pub async fn check(
        &self,
        subject: &SubjectRef,
        action: Action,
        resource: &str,
        zone_id: &ZoneId,
    ) -> CheckResponse {
        let request = CheckRequest {
            subject: subject.clone(),
            action,
            resource: resource.to_string(),
            zone_id: zone_id.clone(),
        };
        self.check_with_deadline(&request, self.config.check_timeout()).await
    }

    pub async fn check_with_deadline(&self, request: &CheckRequest, deadline: Option<Duration>) -> CheckResponse {
        self.checker.check(request, deadline).await
    }

    /// Each request fails closed on its own
    pub async fn batch_check(&self, requests: &[CheckRequest]) -> Vec<CheckResponse> {
        let deadline = self.config.check_timeout();
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.checker.check(request, deadline).await);
        }
        responses
    }

    /// Effective relations and the tuples they come from
    pub async fn expand(&self, subject: &SubjectRef, resource: &str) -> Result<Expansion, RebacError> {
        self.expander.expand(subject, resource).await
    }

    // =============================================================================
    // Sharing
    // =============================================================================

    /// `actor` gives `subject` `relation` on `resource`
    pub async fn grant(
        &self,
        actor: &SubjectRef,
        subject: &SubjectRef,
        relation: Relation,
        resource: &str,
        zone_id: &ZoneId,
    ) -> Result<TupleId, RebacError> {
        self.sharing.share(actor, subject, relation, resource, zone_id).await
    }

    /// `actor` takes `relation` on `resource` away from `subject`
    pub async fn revoke(
        &self,
        actor: &SubjectRef,
        subject: &SubjectRef,
        relation: Relation,
        resource: &str,
    ) -> Result<(), RebacError> {
        let node = self
            .tree
            .node(resource)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("unknown resource {}", resource)))?;
        self.sharing
            .unshare(actor, subject, relation, resource, &node.zone_id)
            .await
            .map(|_| ())
    }

    // =============================================================================
    // Tuple Management
    // =============================================================================

    /// Write a tuple without an actor gate, for provisioning and migrations
    pub async fn create_tuple(
        &self,
        subject: SubjectRef,
        relation: Relation,
        object: ObjectRef,
        zone_id: ZoneId,
    ) -> Result<TupleId, RebacError> {
        self.store.create_tuple(subject, relation, object, zone_id).await
    }

    pub async fn revoke_tuple(&self, key: &TupleKey) -> Result<RelationTuple, RebacError> {
        self.store.revoke_tuple(key).await
    }

    /// Add `member` to `group`, in the group's zone
    pub async fn add_member(&self, member: &SubjectRef, group: &str) -> Result<TupleId, RebacError> {
        let group_object = ObjectRef::group(group);
        let zone = self
            .tree
            .subject_zone(&SubjectRef::group(group))
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("unknown group {}", group)))?;
        self.store
            .create_tuple(member.clone(), Relation::MemberOf, group_object, zone)
            .await
    }

    pub async fn remove_member(&self, member: &SubjectRef, group: &str) -> Result<(), RebacError> {
        let key = TupleKey::new(member.clone(), Relation::MemberOf, ObjectRef::group(group));
        self.store.revoke_tuple(&key).await.map(|_| ())
    }

    pub async fn list_tuples_for_object(&self, object: &ObjectRef) -> Result<Vec<RelationTuple>, RebacError> {
        self.store.list_tuples_for_object(object).await
    }

    pub async fn list_tuples_for_subject(&self, subject: &SubjectRef) -> Result<Vec<RelationTuple>, RebacError> {
        self.store.list_tuples_for_subject(subject).await
    }

    pub async fn tuple_history(&self, object: &ObjectRef) -> Result<Vec<RelationTuple>, RebacError> {
        self.store.tuple_history(object).await
    }

    // =============================================================================
    // Lifecycle
    // =============================================================================

    /// Revoke everything referencing `target` inside the caller's deletion
    pub async fn cascade_revoke(
        &self,
        target: &CascadeTarget,
        deletion: &dyn DeletionHook,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        self.lifecycle.cascade_revoke(target, deletion).await
    }

    /// Publish a cascade swept and committed in the caller's own transaction
    pub fn cascade_committed(&self, target: &CascadeTarget, swept: &[RelationTuple]) {
        self.lifecycle.cascade_committed(target, swept);
    }

    pub async fn resource_created(&self, path: &str, owner: &SubjectRef) -> Result<TupleId, RebacError> {
        let id = self.lifecycle.on_resource_created(path, owner).await?;
        info!("Resource {} created, owned by {}", path, owner);
        Ok(id)
    }

    pub async fn subject_created(&self, subject: &SubjectRef) -> Result<(), RebacError> {
        self.lifecycle.on_subject_created(subject).await
    }

    // =============================================================================
    // Introspection
    // =============================================================================

    pub fn stats(&self) -> CheckStats {
        self.metrics.snapshot()
    }

    /// Drop every cached decision
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Drop cached decisions that can no longer be served
    pub fn prune_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.prune();
        }
    }

    pub fn cached_decisions(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.len())
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn versions(&self) -> &Arc<VersionTable> {
        &self.versions
    }

    pub fn repository(&self) -> Arc<dyn TupleRepository> {
        self.repository.clone()
    }
}
