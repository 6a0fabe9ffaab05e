use crate::{
    cache::{VersionScope, VersionStamp, VersionTable},
    error::{DepthKind, RebacError},
    models::*,
    repository::TupleRepository,
    schema::Schema,
    tree::ResourceTree,
    zone::ZoneGuard,
};
use ahash::AHashSet;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// One relation a subject effectively holds, and where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveGrant {
    /// Relation after inheritance, e.g. `editor` for an ancestor's `owner`
    pub relation: Relation,
    /// Relation on the tuple itself
    pub granted: Relation,
    /// The subject or group the tuple names
    pub holder: SubjectRef,
    /// The node or zone the tuple sits on
    pub object: ObjectRef,
    pub tuple_id: TupleId,
    pub inherited: bool,
}

/// Effective relations of a subject on one resource
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub grants: Vec<EffectiveGrant>,
    pub stamp: VersionStamp,
}

impl Expansion {
    pub fn relations(&self) -> AHashSet<Relation> {
        self.grants.iter().map(|g| g.relation).collect()
    }

    pub fn has(&self, relation: Relation) -> bool {
        self.grants.iter().any(|g| g.relation == relation)
    }

    pub fn satisfies(&self, required: &[Relation]) -> bool {
        self.grants.iter().any(|g| required.contains(&g.relation))
    }

    /// Diagnostic view: effective relations plus the grant path for each
    pub fn explain(&self) -> serde_json::Value {
        let mut relations: Vec<Relation> = self.relations().into_iter().collect();
        relations.sort();
        serde_json::json!({
            "relations": relations,
            "grants": self.grants,
        })
    }
}

/// Computes effective relations from direct tuples, group membership and
/// the directory hierarchy.
///
/// The `member_of` graph is acyclic by construction (cycles are refused at
/// write time), so group expansion only tracks visited groups to avoid
/// re-reading diamonds.
pub struct RelationExpander {
    repository: Arc<dyn TupleRepository>,
    tree: Arc<dyn ResourceTree>,
    schema: Arc<Schema>,
    zone_guard: Arc<ZoneGuard>,
    versions: Arc<VersionTable>,
    max_ancestor_depth: usize,
    max_group_depth: usize,
}

impl RelationExpander {
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
            max_ancestor_depth: 32,
            max_group_depth: 32,
        }
    }

    pub fn with_limits(mut self, max_ancestor_depth: usize, max_group_depth: usize) -> Self {
        self.max_ancestor_depth = max_ancestor_depth;
        self.max_group_depth = max_group_depth;
        self
    }

    /// Decide `subject` doing `action` on `resource`, which the caller
    /// expects to live in `zone_id`.
    pub async fn decide(
        &self,
        subject: &SubjectRef,
        action: Action,
        resource: &str,
        zone_id: &ZoneId,
    ) -> Result<(Decision, VersionStamp), RebacError> {
        let node = self.resolve(resource).await?;
        if node.zone_id != *zone_id {
            return Err(RebacError::ZoneMismatch(format!(
                "{} lives in zone {}, not {}",
                resource, node.zone_id, zone_id
            )));
        }

        let mut stamp = VersionStamp::new();
        self.zone_guard
            .validate(subject, &node, &self.versions, &mut stamp)
            .await?;

        let expansion = self.expand_node(subject, &node, stamp).await?;
        let decision = if expansion.satisfies(self.schema.required_relations(action)) {
            Decision::Allow
        } else {
            Decision::Deny
        };

        debug!("{} {} {} -> {:?}", subject, action, resource, decision);
        Ok((decision, expansion.stamp))
    }

    /// Effective relations on `resource`, without the zone guard
    pub async fn expand(&self, subject: &SubjectRef, resource: &str) -> Result<Expansion, RebacError> {
        let node = self.resolve(resource).await?;
        self.expand_node(subject, &node, VersionStamp::new()).await
    }

    async fn resolve(&self, resource: &str) -> Result<ResourceNode, RebacError> {
        self.tree
            .node(resource)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("unknown resource {}", resource)))
    }

    async fn expand_node(
        &self,
        subject: &SubjectRef,
        node: &ResourceNode,
        stamp: VersionStamp,
    ) -> Result<Expansion, RebacError> {
        let mut expansion = Expansion {
            grants: Vec::new(),
            stamp,
        };
        let holders = self.expand_groups(subject, &mut expansion.stamp).await?;

        // Direct tuples, held by the subject or one of its groups
        self.absorb(&node.object(), &holders, false, &mut expansion).await?;

        // Ancestors up to the zone root
        let mut current = node.parent.clone();
        let mut depth = 0usize;
        while let Some(path) = current {
            depth += 1;
            if depth > self.max_ancestor_depth {
                error!(
                    resource = %node.path,
                    limit = self.max_ancestor_depth,
                    "Ancestor chain exceeds depth bound, likely a corrupt hierarchy; denying"
                );
                return Err(RebacError::DepthExceeded {
                    kind: DepthKind::Ancestor,
                    limit: self.max_ancestor_depth,
                });
            }

            let ancestor = self.tree.node(&path).await?.ok_or_else(|| {
                RebacError::NotFound(format!("missing ancestor {} of {}", path, node.path))
            })?;
            if ancestor.zone_id != node.zone_id {
                warn!("Ancestor {} of {} is in another zone; stopping inheritance", path, node.path);
                break;
            }

            self.absorb(&ancestor.object(), &holders, true, &mut expansion).await?;
            current = ancestor.parent;
        }

        // Zone-wide tuples apply like a directory above the root
        self.absorb(&ObjectRef::zone(&node.zone_id), &holders, true, &mut expansion)
            .await?;

        Ok(expansion)
    }

    /// The subject followed by every group it belongs to, transitively.
    async fn expand_groups(
        &self,
        subject: &SubjectRef,
        stamp: &mut VersionStamp,
    ) -> Result<Vec<SubjectRef>, RebacError> {
        let mut holders = vec![subject.clone()];
        let mut seen: AHashSet<SubjectRef> = AHashSet::new();
        seen.insert(subject.clone());

        let mut frontier = vec![subject.clone()];
        let mut depth = 0usize;
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for member in &frontier {
                stamp.observe(&self.versions, VersionScope::Subject(member.clone()));
                let edges = self
                    .repository
                    .read_tuples(Some(member), Some(Relation::MemberOf), None)
                    .await?;
                for edge in edges {
                    if let Some(group) = edge.object.as_group_subject() {
                        if seen.insert(group.clone()) {
                            next.push(group);
                        }
                    }
                }
            }

            if next.is_empty() {
                break;
            }
            depth += 1;
            if depth > self.max_group_depth {
                error!(
                    subject = %subject,
                    limit = self.max_group_depth,
                    "Group nesting exceeds depth bound, likely a corrupt membership graph; denying"
                );
                return Err(RebacError::DepthExceeded {
                    kind: DepthKind::Group,
                    limit: self.max_group_depth,
                });
            }
            holders.extend(next.iter().cloned());
            frontier = next;
        }

        Ok(holders)
    }

    async fn absorb(
        &self,
        object: &ObjectRef,
        holders: &[SubjectRef],
        inherited: bool,
        expansion: &mut Expansion,
    ) -> Result<(), RebacError> {
        expansion
            .stamp
            .observe(&self.versions, VersionScope::Object(object.clone()));
        let tuples = self.repository.read_tuples(None, None, Some(object)).await?;

        for tuple in tuples {
            if tuple.relation == Relation::MemberOf || !holders.contains(&tuple.subject) {
                continue;
            }
            let relation = if inherited {
                match self.schema.inherited(tuple.relation) {
                    Some(implied) => implied,
                    None => continue,
                }
            } else {
                tuple.relation
            };
            expansion.grants.push(EffectiveGrant {
                relation,
                granted: tuple.relation,
                holder: tuple.subject,
                object: tuple.object,
                tuple_id: tuple.id,
                inherited,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryTupleRepository;
    use crate::tree::InMemoryResourceTree;

    struct Fixture {
        repo: Arc<InMemoryTupleRepository>,
        expander: RelationExpander,
        acme: ZoneId,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let tree = InMemoryResourceTree::new();
        let acme = ZoneId::new("acme");
        tree.add_zone_root(&acme, "/acme");
        tree.add_directory("/acme", "/acme/projects").unwrap();
        tree.add_directory("/acme/projects", "/acme/projects/x").unwrap();
        tree.add_file("/acme/projects/x", "/acme/projects/x/file.txt").unwrap();
        tree.add_subject(SubjectRef::user("alice"), &acme);
        tree.add_subject(SubjectRef::group("eng"), &acme);
        tree.add_subject(SubjectRef::group("staff"), &acme);

        let tree: Arc<dyn ResourceTree> = Arc::new(tree);
        let versions = Arc::new(VersionTable::new());
        let zone_guard = Arc::new(ZoneGuard::new(repo.clone(), tree.clone()));
        let expander = RelationExpander::new(
            repo.clone(),
            tree,
            Arc::new(Schema::filesystem_schema()),
            zone_guard,
            versions,
        );
        Fixture { repo, expander, acme }
    }

    #[tokio::test]
    async fn test_owner_on_directory_implies_editor_below() {
        let f = fixture();
        f.repo
            .insert(RelationTuple::new(
                SubjectRef::user("alice"),
                Relation::Owner,
                ObjectRef::directory("/acme/projects"),
                f.acme.clone(),
            ))
            .await
            .unwrap();

        let expansion = f
            .expander
            .expand(&SubjectRef::user("alice"), "/acme/projects/x/file.txt")
            .await
            .unwrap();
        assert!(expansion.has(Relation::Editor));
        assert!(!expansion.has(Relation::Owner));

        let (decision, _) = f
            .expander
            .decide(&SubjectRef::user("alice"), Action::Write, "/acme/projects/x/file.txt", &f.acme)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);

        let (decision, _) = f
            .expander
            .decide(&SubjectRef::user("alice"), Action::Delete, "/acme/projects/x/file.txt", &f.acme)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny);
    }

    #[tokio::test]
    async fn test_nested_group_grant() {
        let f = fixture();
        f.repo
            .insert(RelationTuple::new(
                SubjectRef::user("alice"),
                Relation::MemberOf,
                ObjectRef::group("eng"),
                f.acme.clone(),
            ))
            .await
            .unwrap();
        f.repo
            .insert(RelationTuple::new(
                SubjectRef::group("eng"),
                Relation::MemberOf,
                ObjectRef::group("staff"),
                f.acme.clone(),
            ))
            .await
            .unwrap();
        f.repo
            .insert(RelationTuple::new(
                SubjectRef::group("staff"),
                Relation::Viewer,
                ObjectRef::file("/acme/projects/x/file.txt"),
                f.acme.clone(),
            ))
            .await
            .unwrap();

        let expansion = f
            .expander
            .expand(&SubjectRef::user("alice"), "/acme/projects/x/file.txt")
            .await
            .unwrap();
        assert_eq!(expansion.grants.len(), 1);
        assert_eq!(expansion.grants[0].holder, SubjectRef::group("staff"));
        assert!(!expansion.grants[0].inherited);

        let explained = expansion.explain();
        assert_eq!(explained["relations"], serde_json::json!(["viewer"]));
        assert_eq!(explained["grants"][0]["holder"]["id"], "staff");
    }

    #[tokio::test]
    async fn test_group_depth_bound_fails_closed() {
        let f = fixture();
        let expander = f.expander.with_limits(32, 1);
        f.repo
            .insert(RelationTuple::new(
                SubjectRef::user("alice"),
                Relation::MemberOf,
                ObjectRef::group("eng"),
                f.acme.clone(),
            ))
            .await
            .unwrap();
        f.repo
            .insert(RelationTuple::new(
                SubjectRef::group("eng"),
                Relation::MemberOf,
                ObjectRef::group("staff"),
                f.acme.clone(),
            ))
            .await
            .unwrap();

        let err = expander
            .decide(&SubjectRef::user("alice"), Action::Read, "/acme/projects", &f.acme)
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::DepthExceeded { kind: DepthKind::Group, .. }));
    }

    #[tokio::test]
    async fn test_ancestor_depth_bound_fails_closed() {
        let f = fixture();
        let expander = f.expander.with_limits(2, 32);
        let err = expander
            .decide(&SubjectRef::user("alice"), Action::Read, "/acme/projects/x/file.txt", &f.acme)
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::DepthExceeded { kind: DepthKind::Ancestor, .. }));
    }

    #[tokio::test]
    async fn test_zone_tuple_inherits_everywhere() {
        let f = fixture();
        f.repo
            .insert(RelationTuple::new(
                SubjectRef::user("alice"),
                Relation::Viewer,
                ObjectRef::zone(&f.acme),
                f.acme.clone(),
            ))
            .await
            .unwrap();

        let (decision, stamp) = f
            .expander
            .decide(&SubjectRef::user("alice"), Action::List, "/acme/projects/x", &f.acme)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);
        // node, two ancestors, zone object, the subject's membership scope
        assert_eq!(stamp.len(), 5);
    }

    #[tokio::test]
    async fn test_wrong_zone_assertion_rejected() {
        let f = fixture();
        let err = f
            .expander
            .decide(&SubjectRef::user("alice"), Action::Read, "/acme/projects", &ZoneId::new("globex"))
            .await
            .unwrap_err();
        assert!(matches!(err, RebacError::ZoneMismatch(_)));
    }
}
