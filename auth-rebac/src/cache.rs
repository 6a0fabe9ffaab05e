//! Check-result cache with versioned invalidation.
//!
//! Every tuple mutation bumps a counter for the object it touched (and for
//! the member, when the tuple is a `member_of` edge) before the mutation
//! returns. The expander records the counter of each scope *before* reading
//! the tuples belonging to it; a cached decision is served only while all
//! recorded counters are unchanged. There is no TTL.

use crate::models::*;
use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Unit of invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionScope {
    /// Tuples whose object is this node, zone or group
    Object(ObjectRef),
    /// `member_of` edges leaving this subject
    Subject(SubjectRef),
}

/// Version counters, owned by one engine instance.
#[derive(Debug, Default)]
pub struct VersionTable {
    counters: DashMap<VersionScope, AtomicU64>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, scope: &VersionScope) -> u64 {
        self.counters
            .get(scope)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn bump(&self, scope: VersionScope) -> u64 {
        let counter = self.counters.entry(scope).or_default();
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Invalidate everything a mutation of `tuple` can influence
    pub fn bump_for_tuple(&self, tuple: &RelationTuple) {
        self.bump(VersionScope::Object(tuple.object.clone()));
        if tuple.relation == Relation::MemberOf {
            self.bump(VersionScope::Subject(tuple.subject.clone()));
        }
    }

    pub fn bump_for_target(&self, target: &CascadeTarget) {
        match target {
            CascadeTarget::Object(object) => {
                self.bump(VersionScope::Object(object.clone()));
                if let Some(group) = object.as_group_subject() {
                    self.bump(VersionScope::Subject(group));
                }
            }
            CascadeTarget::Subject(subject) => {
                self.bump(VersionScope::Subject(subject.clone()));
                if let Some(group) = subject.as_group_object() {
                    self.bump(VersionScope::Object(group));
                }
            }
        }
    }
}

/// Counters observed while computing one decision
#[derive(Debug, Clone, Default)]
pub struct VersionStamp {
    observed: AHashMap<VersionScope, u64>,
}

impl VersionStamp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `scope`'s counter. Call before reading the data it guards.
    pub fn observe(&mut self, versions: &VersionTable, scope: VersionScope) {
        if !self.observed.contains_key(&scope) {
            let version = versions.current(&scope);
            self.observed.insert(scope, version);
        }
    }

    pub fn is_current(&self, versions: &VersionTable) -> bool {
        self.observed
            .iter()
            .all(|(scope, version)| versions.current(scope) == *version)
    }

    pub fn len(&self) -> usize {
        self.observed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub subject: SubjectRef,
    pub action: Action,
    pub resource: String,
    /// Zone the caller asserted; a mismatch must never hit a sibling entry
    pub zone_id: ZoneId,
}

impl CacheKey {
    pub fn new(subject: &SubjectRef, action: Action, resource: &str, zone_id: &ZoneId) -> Self {
        Self {
            subject: subject.clone(),
            action,
            resource: resource.to_string(),
            zone_id: zone_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    decision: Decision,
    stamp: VersionStamp,
}

/// Memoized check decisions
pub struct CheckCache {
    entries: DashMap<CacheKey, CacheEntry>,
    versions: Arc<VersionTable>,
    capacity: usize,
    // one evicting writer at a time; the rest insert and move on
    eviction: Mutex<()>,
}

impl CheckCache {
    pub fn new(versions: Arc<VersionTable>, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            versions,
            capacity,
            eviction: Mutex::new(()),
        }
    }

    pub fn versions(&self) -> &Arc<VersionTable> {
        &self.versions
    }

    /// Cached decision, if every counter it depended on is unchanged
    pub fn lookup(&self, key: &CacheKey) -> Option<Decision> {
        let (decision, fresh) = {
            let entry = self.entries.get(key)?;
            (entry.decision, entry.stamp.is_current(&self.versions))
        };

        if fresh {
            debug!("Cache hit for {} {} {} in {}", key.subject, key.action, key.resource, key.zone_id);
            return Some(decision);
        }

        self.entries
            .remove_if(key, |_, entry| !entry.stamp.is_current(&self.versions));
        None
    }

    /// Store a decision. A stamp that is already stale is dropped.
    pub fn store(&self, key: CacheKey, decision: Decision, stamp: VersionStamp) {
        if !stamp.is_current(&self.versions) {
            return;
        }

        if self.entries.len() >= self.capacity {
            if let Some(_evicting) = self.eviction.try_lock() {
                self.prune();
                if self.entries.len() >= self.capacity {
                    debug!("Check cache full after pruning, clearing {} entries", self.entries.len());
                    self.entries.clear();
                }
            }
        }

        self.entries.insert(key, CacheEntry { decision, stamp });
    }

    /// Drop entries whose stamps have moved
    pub fn prune(&self) {
        let versions = Arc::clone(&self.versions);
        self.entries.retain(|_, entry| entry.stamp.is_current(&versions));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
