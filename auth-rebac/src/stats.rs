use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for the check path. Also forwarded to the `metrics` facade so an
/// installed recorder (Prometheus, OTLP, ...) picks them up.
#[derive(Debug, Default)]
pub struct CheckMetrics {
    checks: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    faults: AtomicU64,
    latency_micros: AtomicU64,
}

impl CheckMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rebac_cache_hits_total").increment(1);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rebac_cache_misses_total").increment(1);
    }

    pub fn record_fault(&self, code: &'static str) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rebac_check_faults_total", "code" => code).increment(1);
    }

    pub fn record_check(&self, elapsed: Duration, allowed: bool) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);

        let decision = if allowed { "allow" } else { "deny" };
        metrics::histogram!("rebac_check_duration_seconds", "decision" => decision)
            .record(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> CheckStats {
        CheckStats {
            checks: self.checks.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            total_latency_micros: self.latency_micros.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`CheckMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStats {
    pub checks: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub faults: u64,
    pub total_latency_micros: u64,
}

impl CheckStats {
    #[allow(clippy::cast_precision_loss)]
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn mean_latency_micros(&self) -> f64 {
        if self.checks == 0 {
            0.0
        } else {
            self.total_latency_micros as f64 / self.checks as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let metrics = CheckMetrics::new();
        assert_eq!(metrics.snapshot().cache_hit_rate(), 0.0);

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_check(Duration::from_micros(40), true);
        metrics.record_check(Duration::from_micros(60), false);

        let stats = metrics.snapshot();
        assert!((stats.cache_hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!((stats.mean_latency_micros() - 50.0).abs() < f64::EPSILON);
    }
}
