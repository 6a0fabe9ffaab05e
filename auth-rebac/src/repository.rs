use crate::{error::RebacError, models::*, tree::DeletionHook};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

pub mod postgres;

pub use postgres::PostgresTupleRepository;

/// Storage capability for relationship tuples.
///
/// Implementations serialize writes per affected object and subject, and
/// keep duplicate, tombstone and cycle checks atomic with the write they
/// guard. Reads only ever return Active tuples unless stated otherwise.
#[async_trait]
pub trait TupleRepository: Send + Sync {
    /// Insert an Active tuple
    async fn insert(&self, tuple: RelationTuple) -> Result<TupleId, RebacError>;

    /// Move the Active tuple for `key` to Revoked (or remove it under `Purge`)
    async fn revoke(
        &self,
        key: &TupleKey,
        at: DateTime<Utc>,
        policy: RevokePolicy,
    ) -> Result<RelationTuple, RebacError>;

    /// Sweep every Active tuple referencing `target`, tombstone the target,
    /// and run `hook` before committing. A failing hook leaves the store untouched.
    async fn cascade(
        &self,
        target: &CascadeTarget,
        at: DateTime<Utc>,
        policy: RevokePolicy,
        hook: &dyn DeletionHook,
    ) -> Result<Vec<RelationTuple>, RebacError>;

    /// Forget the tombstone for a re-created object or subject
    async fn restore(&self, target: &CascadeTarget) -> Result<(), RebacError>;

    /// Read Active tuples matching the given filter
    /// None values act as wildcards
    async fn read_tuples(
        &self,
        subject: Option<&SubjectRef>,
        relation: Option<Relation>,
        object: Option<&ObjectRef>,
    ) -> Result<Vec<RelationTuple>, RebacError>;

    async fn find_active(&self, key: &TupleKey) -> Result<Option<RelationTuple>, RebacError>;

    /// Every retained row on `object`, Active or not
    async fn read_history(&self, object: &ObjectRef) -> Result<Vec<RelationTuple>, RebacError>;
}

/// Write-lock identity. Derived ordering is the acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum LockKey {
    GroupGraph,
    Object(ObjectRef),
    Subject(SubjectRef),
}

impl LockKey {
    /// Locks a write touching `subject` and `object` must hold
    pub(crate) fn for_tuple(subject: &SubjectRef, relation: Relation, object: &ObjectRef) -> Vec<LockKey> {
        let mut keys = Vec::with_capacity(3);
        if relation == Relation::MemberOf {
            keys.push(LockKey::GroupGraph);
        }
        keys.push(LockKey::Object(object.clone()));
        keys.push(LockKey::Subject(subject.clone()));
        keys
    }

    /// Stable name, hashed into a Postgres advisory lock id
    pub(crate) fn lock_name(&self) -> String {
        match self {
            LockKey::GroupGraph => "rebac:group-graph".to_string(),
            LockKey::Object(object) => format!("rebac:object:{}", object),
            LockKey::Subject(subject) => format!("rebac:subject:{}", subject),
        }
    }

    pub(crate) fn for_cascade(target: &CascadeTarget) -> Vec<LockKey> {
        let (subject, object) = cascade_sides(target);
        let mut keys = Vec::with_capacity(3);
        if subject.as_ref().is_some_and(|s| s.subject_type == SubjectType::Group) {
            keys.push(LockKey::GroupGraph);
        }
        if let Some(object) = object {
            keys.push(LockKey::Object(object));
        }
        if let Some(subject) = subject {
            keys.push(LockKey::Subject(subject));
        }
        keys
    }
}

/// Both identities of a cascade target; groups are swept as subject and object.
pub(crate) fn cascade_sides(target: &CascadeTarget) -> (Option<SubjectRef>, Option<ObjectRef>) {
    match target {
        CascadeTarget::Object(object) => (object.as_group_subject(), Some(object.clone())),
        CascadeTarget::Subject(subject) => (Some(subject.clone()), subject.as_group_object()),
    }
}

#[derive(Default)]
struct LockTable {
    slots: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl LockTable {
    async fn acquire(&self, mut keys: Vec<LockKey>) -> Vec<OwnedMutexGuard<()>> {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let slot = self.slots.entry(key).or_default().clone();
            guards.push(slot.lock_owned().await);
        }
        guards
    }
}

/// In-memory tuple repository for testing and development
#[derive(Default)]
pub struct InMemoryTupleRepository {
    rows: DashMap<TupleId, RelationTuple>,
    active: DashMap<TupleKey, TupleId>,
    by_object: DashMap<ObjectRef, HashSet<TupleId>>,
    by_subject: DashMap<SubjectRef, HashSet<TupleId>>,
    deleted_objects: DashSet<ObjectRef>,
    deleted_subjects: DashSet<SubjectRef>,
    locks: LockTable,
}

impl InMemoryTupleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows_for(&self, ids: Option<HashSet<TupleId>>) -> Vec<RelationTuple> {
        match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.rows.get(id).map(|row| row.value().clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn is_tombstoned(&self, subject: &SubjectRef, object: &ObjectRef) -> Option<String> {
        if self.deleted_objects.contains(object) {
            return Some(format!("{} has been deleted", object));
        }
        if self.deleted_subjects.contains(subject) {
            return Some(format!("{} has been deleted", subject));
        }
        None
    }

    /// Would `subject member_of object` close a loop in the group graph?
    /// Walks upward from `object` through Active `member_of` edges, looking
    /// for `subject`. Callers hold the group-graph lock.
    fn closes_cycle(&self, subject: &SubjectRef, object: &ObjectRef) -> bool {
        if subject.subject_type != SubjectType::Group {
            // users and agents never have incoming member_of edges
            return false;
        }
        let Some(start) = object.as_group_subject() else {
            return false;
        };

        let mut visited: HashSet<SubjectRef> = HashSet::new();
        let mut pending = vec![start];
        while let Some(group) = pending.pop() {
            if group == *subject {
                return true;
            }
            if !visited.insert(group.clone()) {
                continue;
            }
            let ids = self.by_subject.get(&group).map(|ids| ids.value().clone());
            pending.extend(
                self.rows_for(ids)
                    .into_iter()
                    .filter(|t| t.is_active() && t.relation == Relation::MemberOf)
                    .filter_map(|t| t.object.as_group_subject()),
            );
        }
        false
    }

    fn unindex(&self, tuple: &RelationTuple) {
        if let Some(mut ids) = self.by_object.get_mut(&tuple.object) {
            ids.remove(&tuple.id);
        }
        if let Some(mut ids) = self.by_subject.get_mut(&tuple.subject) {
            ids.remove(&tuple.id);
        }
    }

    /// Apply a terminal transition to the Active row for `key`. `None` if
    /// another writer got there first.
    fn end_tuple(&self, key: &TupleKey, next: LifecycleState, policy: RevokePolicy) -> Option<RelationTuple> {
        let (_, id) = self.active.remove(key)?;
        match policy {
            RevokePolicy::Retain => {
                let mut row = self.rows.get_mut(&id)?;
                row.state = row.state.transition(next).ok()?;
                Some(row.value().clone())
            }
            RevokePolicy::Purge => {
                let (_, mut row) = self.rows.remove(&id)?;
                self.unindex(&row);
                row.state = next;
                Some(row)
            }
        }
    }
}

#[async_trait]
impl TupleRepository for InMemoryTupleRepository {
    async fn insert(&self, tuple: RelationTuple) -> Result<TupleId, RebacError> {
        let _guards = self
            .locks
            .acquire(LockKey::for_tuple(&tuple.subject, tuple.relation, &tuple.object))
            .await;

        if let Some(reason) = self.is_tombstoned(&tuple.subject, &tuple.object) {
            return Err(RebacError::NotFound(reason));
        }
        let key = tuple.key();
        if self.active.contains_key(&key) {
            return Err(RebacError::DuplicateTuple(key.to_string()));
        }
        if tuple.relation == Relation::MemberOf && self.closes_cycle(&tuple.subject, &tuple.object) {
            return Err(RebacError::CycleDetected(key.to_string()));
        }

        let id = tuple.id;
        self.by_object.entry(tuple.object.clone()).or_default().insert(id);
        self.by_subject.entry(tuple.subject.clone()).or_default().insert(id);
        self.rows.insert(id, tuple);
        self.active.insert(key, id);

        debug!("Inserted tuple {}", id);
        Ok(id)
    }

    async fn revoke(
        &self,
        key: &TupleKey,
        at: DateTime<Utc>,
        policy: RevokePolicy,
    ) -> Result<RelationTuple, RebacError> {
        let _guards = self
            .locks
            .acquire(LockKey::for_tuple(&key.subject, key.relation, &key.object))
            .await;

        self.end_tuple(key, LifecycleState::Revoked { at }, policy)
            .ok_or_else(|| RebacError::NotFound(format!("no active tuple {}", key)))
    }

    async fn cascade(
        &self,
        target: &CascadeTarget,
        at: DateTime<Utc>,
        policy: RevokePolicy,
        hook: &dyn DeletionHook,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        let _guards = self.locks.acquire(LockKey::for_cascade(target)).await;
        let (subject, object) = cascade_sides(target);

        let mut doomed: Vec<TupleKey> = Vec::new();
        if let Some(ref object) = object {
            let ids = self.by_object.get(object).map(|ids| ids.value().clone());
            doomed.extend(self.rows_for(ids).into_iter().filter(|t| t.is_active()).map(|t| t.key()));
        }
        if let Some(ref subject) = subject {
            let ids = self.by_subject.get(subject).map(|ids| ids.value().clone());
            doomed.extend(self.rows_for(ids).into_iter().filter(|t| t.is_active()).map(|t| t.key()));
        }
        doomed.sort();
        doomed.dedup();

        hook.delete()
            .await
            .map_err(|e| RebacError::Internal(e.context(format!("deletion of {} failed", target))))?;

        if let Some(object) = object {
            self.deleted_objects.insert(object);
        }
        if let Some(subject) = subject {
            self.deleted_subjects.insert(subject);
        }

        let swept: Vec<RelationTuple> = doomed
            .iter()
            .filter_map(|key| self.end_tuple(key, LifecycleState::Deleted { at }, policy))
            .collect();

        info!("Cascade on {} swept {} tuples", target, swept.len());
        Ok(swept)
    }

    async fn restore(&self, target: &CascadeTarget) -> Result<(), RebacError> {
        let _guards = self.locks.acquire(LockKey::for_cascade(target)).await;
        let (subject, object) = cascade_sides(target);
        if let Some(object) = object {
            self.deleted_objects.remove(&object);
        }
        if let Some(subject) = subject {
            self.deleted_subjects.remove(&subject);
        }
        Ok(())
    }

    async fn read_tuples(
        &self,
        subject: Option<&SubjectRef>,
        relation: Option<Relation>,
        object: Option<&ObjectRef>,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        let candidates = match (object, subject) {
            (Some(o), _) => self.rows_for(self.by_object.get(o).map(|ids| ids.value().clone())),
            (None, Some(s)) => self.rows_for(self.by_subject.get(s).map(|ids| ids.value().clone())),
            (None, None) => self.rows.iter().map(|row| row.value().clone()).collect(),
        };

        let mut tuples: Vec<RelationTuple> = candidates
            .into_iter()
            .filter(|tuple| {
                tuple.is_active()
                    && subject.map_or(true, |s| tuple.subject == *s)
                    && relation.map_or(true, |r| tuple.relation == r)
                    && object.map_or(true, |o| tuple.object == *o)
            })
            .collect();
        tuples.sort_by_key(|t| t.created_at);
        Ok(tuples)
    }

    async fn find_active(&self, key: &TupleKey) -> Result<Option<RelationTuple>, RebacError> {
        let id = match self.active.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.rows.get(&id).map(|row| row.value().clone()))
    }

    async fn read_history(&self, object: &ObjectRef) -> Result<Vec<RelationTuple>, RebacError> {
        let mut tuples = self.rows_for(self.by_object.get(object).map(|ids| ids.value().clone()));
        tuples.sort_by_key(|t| t.created_at);
        Ok(tuples)
    }
}
