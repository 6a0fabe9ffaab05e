use crate::{
    cache::VersionTable,
    error::RebacError,
    models::*,
    repository::TupleRepository,
    store::TupleStore,
    tree::{DeletionHook, ResourceTree},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Keeps tuples in step with the objects and subjects they reference
pub struct LifecycleManager {
    repository: Arc<dyn TupleRepository>,
    tree: Arc<dyn ResourceTree>,
    store: Arc<TupleStore>,
    versions: Arc<VersionTable>,
}

impl LifecycleManager {
    pub fn new(
        repository: Arc<dyn TupleRepository>,
        tree: Arc<dyn ResourceTree>,
        store: Arc<TupleStore>,
        versions: Arc<VersionTable>,
    ) -> Self {
        Self {
            repository,
            tree,
            store,
            versions,
        }
    }

    /// Revoke every Active tuple referencing `target` together with the
    /// caller's deletion. Either both happen or neither does.
    pub async fn cascade_revoke(
        &self,
        target: &CascadeTarget,
        deletion: &dyn DeletionHook,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        let swept = self
            .repository
            .cascade(target, Utc::now(), self.store.revoke_policy(), deletion)
            .await?;

        self.cascade_committed(target, &swept);
        Ok(swept)
    }

    /// Invalidate cached decisions after a cascade the caller committed
    /// itself, e.g. through `PostgresTupleRepository::cascade_in_transaction`.
    /// Must run after the commit, never before.
    pub fn cascade_committed(&self, target: &CascadeTarget, swept: &[RelationTuple]) {
        for tuple in swept {
            self.versions.bump_for_tuple(tuple);
        }
        self.versions.bump_for_target(target);

        info!(swept = swept.len(), "Cascade revoke of {} committed", target);
    }

    /// A file or directory was (re)created: forget its tombstone and give
    /// `owner` the automatic owner tuple.
    pub async fn on_resource_created(&self, path: &str, owner: &SubjectRef) -> Result<TupleId, RebacError> {
        let node = self
            .tree
            .node(path)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("unknown resource {}", path)))?;
        let object = node.object();

        self.repository.restore(&CascadeTarget::Object(object.clone())).await?;
        self.store
            .create_tuple(owner.clone(), Relation::Owner, object, node.zone_id)
            .await
    }

    /// A subject was (re)created: forget its tombstone
    pub async fn on_subject_created(&self, subject: &SubjectRef) -> Result<(), RebacError> {
        self.repository
            .restore(&CascadeTarget::Subject(subject.clone()))
            .await?;
        info!("Subject {} is live", subject);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::VersionScope,
        repository::InMemoryTupleRepository,
        schema::Schema,
        tree::{InMemoryResourceTree, NoopDeletion},
        zone::ZoneGuard,
    };

    fn manager() -> (LifecycleManager, InMemoryResourceTree, Arc<VersionTable>) {
        let repo: Arc<dyn TupleRepository> = Arc::new(InMemoryTupleRepository::new());
        let tree = InMemoryResourceTree::new();
        let acme = ZoneId::new("acme");
        tree.add_zone_root(&acme, "/acme");
        tree.add_file("/acme", "/acme/report.pdf").unwrap();
        tree.add_subject(SubjectRef::user("alice"), &acme);
        let dyn_tree: Arc<dyn ResourceTree> = Arc::new(tree.clone());

        let versions = Arc::new(VersionTable::new());
        let zone_guard = Arc::new(ZoneGuard::new(repo.clone(), dyn_tree.clone()));
        let store = Arc::new(TupleStore::new(
            repo.clone(),
            dyn_tree.clone(),
            Arc::new(Schema::filesystem_schema()),
            zone_guard,
            versions.clone(),
        ));
        (LifecycleManager::new(repo, dyn_tree, store, versions.clone()), tree, versions)
    }

    #[tokio::test]
    async fn test_recreated_resource_gets_owner_again() {
        let (manager, tree, versions) = manager();
        let alice = SubjectRef::user("alice");
        let report = ObjectRef::file("/acme/report.pdf");

        manager.on_resource_created("/acme/report.pdf", &alice).await.unwrap();
        let swept = manager
            .cascade_revoke(&CascadeTarget::Object(report.clone()), &NoopDeletion)
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);
        assert!(versions.current(&VersionScope::Object(report.clone())) >= 2);

        // tombstoned until the resource is created again
        let err = manager
            .store
            .create_tuple(alice.clone(), Relation::Viewer, report.clone(), ZoneId::new("acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::NotFound(_)));

        tree.add_file("/acme", "/acme/report.pdf").unwrap();
        manager.on_resource_created("/acme/report.pdf", &alice).await.unwrap();
        assert_eq!(manager.store.list_tuples_for_object(&report).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cascade_with_node_removal() {
        let (manager, tree, _) = manager();
        let alice = SubjectRef::user("alice");
        manager.on_resource_created("/acme/report.pdf", &alice).await.unwrap();

        let removal = tree.node_removal("/acme/report.pdf");
        manager
            .cascade_revoke(&CascadeTarget::Object(ObjectRef::file("/acme/report.pdf")), &removal)
            .await
            .unwrap();
        assert!(tree.node("/acme/report.pdf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subject_cascade_and_restore() {
        let (manager, _, _) = manager();
        let alice = SubjectRef::user("alice");
        manager.on_resource_created("/acme/report.pdf", &alice).await.unwrap();

        manager
            .cascade_revoke(&CascadeTarget::Subject(alice.clone()), &NoopDeletion)
            .await
            .unwrap();
        assert!(manager.store.list_tuples_for_subject(&alice).await.unwrap().is_empty());

        manager.on_subject_created(&alice).await.unwrap();
        manager
            .store
            .create_tuple(
                alice.clone(),
                Relation::Viewer,
                ObjectRef::file("/acme/report.pdf"),
                ZoneId::new("acme"),
            )
            .await
            .unwrap();
    }
}
