use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Control plane counters
#[derive(Debug, Default)]
pub struct ControlPlaneMetrics {
    pub runs_created: AtomicU64,
    pub runs_destroyed: AtomicU64,
    pub runs_expired: AtomicU64,
    pub workers_spawned: AtomicU64,
    pub worker_reattachments: AtomicU64,
    pub registry_lookups: AtomicU64,
    pub connectivity_failures: AtomicU64,
}

impl ControlPlaneMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run_created(&self) {
        self.runs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_destroyed(&self) {
        self.runs_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_expired(&self) {
        self.runs_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_spawn(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_reattach(&self) {
        self.worker_reattachments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registry_lookup(&self) {
        self.registry_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connectivity_failure(&self) {
        self.connectivity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> ControlPlaneStats {
        ControlPlaneStats {
            runs_created: self.runs_created.load(Ordering::Relaxed),
            runs_destroyed: self.runs_destroyed.load(Ordering::Relaxed),
            runs_expired: self.runs_expired.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            worker_reattachments: self.worker_reattachments.load(Ordering::Relaxed),
            registry_lookups: self.registry_lookups.load(Ordering::Relaxed),
            connectivity_failures: self.connectivity_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Control plane metrics: created={}, destroyed={}, expired={}, spawned={}, reattached={}, lookups={}, connectivity_failures={}",
            stats.runs_created,
            stats.runs_destroyed,
            stats.runs_expired,
            stats.workers_spawned,
            stats.worker_reattachments,
            stats.registry_lookups,
            stats.connectivity_failures
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneStats {
    pub runs_created: u64,
    pub runs_destroyed: u64,
    pub runs_expired: u64,
    pub workers_spawned: u64,
    pub worker_reattachments: u64,
    pub registry_lookups: u64,
    pub connectivity_failures: u64,
}

/// Global metrics instance
static METRICS: std::sync::LazyLock<ControlPlaneMetrics> =
    std::sync::LazyLock::new(ControlPlaneMetrics::new);

pub fn metrics() -> &'static ControlPlaneMetrics {
    &METRICS
}

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}
