use crate::{
    cache::{CacheKey, CheckCache, VersionStamp, VersionTable},
    config::EngineConfig,
    error::RebacError,
    expand::RelationExpander,
    models::*,
    stats::CheckMetrics,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Permission checker: cache in front of the expander, with bounded retries
/// and a deadline. Every failure mode collapses to Deny.
pub struct PermissionChecker {
    expander: Arc<RelationExpander>,
    versions: Arc<VersionTable>,
    cache: Option<Arc<CheckCache>>,
    metrics: Arc<CheckMetrics>,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl PermissionChecker {
    pub fn new(
        expander: Arc<RelationExpander>,
        versions: Arc<VersionTable>,
        cache: Option<Arc<CheckCache>>,
        metrics: Arc<CheckMetrics>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            expander,
            versions,
            cache,
            metrics,
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Check a request, failing closed after `deadline`
    pub async fn check(&self, request: &CheckRequest, deadline: Option<Duration>) -> CheckResponse {
        let started = Instant::now();

        let response = match deadline {
            Some(limit) => match tokio::time::timeout(limit, self.check_uncounted(request)).await {
                Ok(response) => response,
                Err(_) => {
                    warn!(
                        subject = %request.subject,
                        resource = %request.resource,
                        "Check exceeded its deadline of {:?}; denying", limit
                    );
                    CheckResponse::fault(RebacError::Timeout)
                }
            },
            None => self.check_uncounted(request).await,
        };

        if let Some(code) = response.error_code() {
            self.metrics.record_fault(code);
        }
        self.metrics.record_check(started.elapsed(), response.is_allowed());
        response
    }

    async fn check_uncounted(&self, request: &CheckRequest) -> CheckResponse {
        let key = CacheKey::new(&request.subject, request.action, &request.resource, &request.zone_id);

        if let Some(cache) = &self.cache {
            if let Some(decision) = cache.lookup(&key) {
                self.metrics.record_hit();
                return respond(decision, true);
            }
            self.metrics.record_miss();
        }

        match self.evaluate(request).await {
            Ok((decision, stamp)) => {
                if let Some(cache) = &self.cache {
                    cache.store(key, decision, stamp);
                }
                respond(decision, false)
            }
            Err(err) => {
                match &err {
                    RebacError::CrossZoneDenied { .. } | RebacError::NotFound(_) => {
                        debug!("Check denied for {}: {}", request.subject, err)
                    }
                    // already logged at error level by the expander
                    RebacError::DepthExceeded { .. } => {}
                    _ => warn!(
                        subject = %request.subject,
                        action = %request.action,
                        resource = %request.resource,
                        code = err.code(),
                        "Check failed closed: {}", err
                    ),
                }
                CheckResponse::fault(err)
            }
        }
    }

    /// Expand, retrying transient store faults and Allows computed against
    /// data that moved underneath the expansion.
    async fn evaluate(&self, request: &CheckRequest) -> Result<(Decision, VersionStamp), RebacError> {
        let mut backoff = self.retry_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = self
                .expander
                .decide(&request.subject, request.action, &request.resource, &request.zone_id)
                .await;

            match outcome {
                Ok((Decision::Allow, stamp)) if !stamp.is_current(&self.versions) => {
                    if attempt >= self.max_attempts {
                        return Err(RebacError::TransientStore(format!(
                            "tuples for {} kept changing during {} attempts",
                            request.resource, attempt
                        )));
                    }
                    debug!("Allow for {} raced a write, recomputing", request.resource);
                }
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        "Transient store fault during check, retrying in {:?}: {}", backoff, err
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn respond(decision: Decision, cached: bool) -> CheckResponse {
    match decision {
        Decision::Allow => CheckResponse::allow(cached),
        Decision::Deny => CheckResponse::deny(cached),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::VersionTable,
        repository::{InMemoryTupleRepository, TupleRepository},
        schema::Schema,
        tree::{InMemoryResourceTree, ResourceTree},
        zone::ZoneGuard,
    };

    fn checker(repo: Arc<InMemoryTupleRepository>, cached: bool) -> (PermissionChecker, Arc<VersionTable>) {
        let tree = InMemoryResourceTree::new();
        let acme = ZoneId::new("acme");
        tree.add_zone_root(&acme, "/acme");
        tree.add_file("/acme", "/acme/a.txt").unwrap();
        tree.add_subject(SubjectRef::user("alice"), &acme);
        let tree: Arc<dyn ResourceTree> = Arc::new(tree);

        let versions = Arc::new(VersionTable::new());
        let zone_guard = Arc::new(ZoneGuard::new(repo.clone(), tree.clone()));
        let expander = Arc::new(RelationExpander::new(
            repo,
            tree,
            Arc::new(Schema::filesystem_schema()),
            zone_guard,
            versions.clone(),
        ));
        let cache = cached.then(|| Arc::new(CheckCache::new(versions.clone(), 64)));
        let checker = PermissionChecker::new(
            expander,
            versions.clone(),
            cache,
            Arc::new(CheckMetrics::new()),
            &EngineConfig::default(),
        );
        (checker, versions)
    }

    fn read_request() -> CheckRequest {
        CheckRequest {
            subject: SubjectRef::user("alice"),
            action: Action::Read,
            resource: "/acme/a.txt".to_string(),
            zone_id: ZoneId::new("acme"),
        }
    }

    #[tokio::test]
    async fn test_second_check_is_cached() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let (checker, _) = checker(repo, true);

        let first = checker.check(&read_request(), None).await;
        assert!(!first.is_allowed());
        assert!(!first.cached);

        let second = checker.check(&read_request(), None).await;
        assert!(!second.is_allowed());
        assert!(second.cached);
        assert_eq!(checker.metrics.snapshot().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_bumped_scope_forces_recompute() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let (checker, versions) = checker(repo.clone(), true);
        assert!(!checker.check(&read_request(), None).await.is_allowed());

        let tuple = RelationTuple::new(
            SubjectRef::user("alice"),
            Relation::Viewer,
            ObjectRef::file("/acme/a.txt"),
            ZoneId::new("acme"),
        );
        repo.insert(tuple.clone()).await.unwrap();
        versions.bump_for_tuple(&tuple);

        let response = checker.check(&read_request(), None).await;
        assert!(response.is_allowed());
        assert!(!response.cached);
    }

    #[tokio::test]
    async fn test_unknown_resource_fails_closed() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let (checker, _) = checker(repo, false);
        let mut request = read_request();
        request.resource = "/acme/missing".to_string();

        let response = checker.check(&request, None).await;
        assert_eq!(response.decision, Decision::Deny);
        assert_eq!(response.error_code(), Some(crate::error::codes::NOT_FOUND));
        assert_eq!(checker.metrics.snapshot().faults, 1);
    }

    #[tokio::test]
    async fn test_cached_allow_still_checks_asserted_zone() {
        let repo = Arc::new(InMemoryTupleRepository::new());
        let (checker, _) = checker(repo.clone(), true);
        repo.insert(RelationTuple::new(
            SubjectRef::user("alice"),
            Relation::Viewer,
            ObjectRef::file("/acme/a.txt"),
            ZoneId::new("acme"),
        ))
        .await
        .unwrap();

        assert!(checker.check(&read_request(), None).await.is_allowed());
        assert!(checker.check(&read_request(), None).await.cached);

        let mut request = read_request();
        request.zone_id = ZoneId::new("globex");
        let response = checker.check(&request, None).await;
        assert_eq!(response.decision, Decision::Deny);
        assert!(!response.cached);
        assert_eq!(response.error_code(), Some(crate::error::codes::ZONE_MISMATCH));
    }
}
