//! Metrics registry for runsync observability
//!
//! Provides OpenTelemetry metrics for:
//! - Job creation per run kind
//! - Run record cache hits and misses
//! - Reconciliation outcomes and duration
//! - Status reports sent upstream

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for runsync metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("runsync"));

// ============================================================================
// Job Metrics
// ============================================================================

/// Counter of Jobs created for runs
///
/// Labels:
/// - `kind`: gate, stack, sentinel
pub static JOBS_CREATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("runsync_jobs_created_total")
        .with_description("Total number of Jobs created for remote runs")
        .with_unit("{jobs}")
        .build()
});

/// Counter of run states reported to the console
///
/// Labels:
/// - `kind`: gate, stack, sentinel
/// - `state`: reported run state
pub static STATUS_REPORTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("runsync_status_reports_total")
        .with_description("Total number of run states reported upstream")
        .with_unit("{reports}")
        .build()
});

// ============================================================================
// Cache Metrics
// ============================================================================

/// Counter of run record cache lookups
///
/// Labels:
/// - `cache`: cache name
/// - `result`: hit, miss
pub static CACHE_LOOKUPS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("runsync_cache_lookups_total")
        .with_description("Total number of run record cache lookups")
        .with_unit("{lookups}")
        .build()
});

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Counter of finished reconciliations
///
/// Labels:
/// - `kind`: gate, stack, sentinel
/// - `outcome`: requeue, await_change, retired, error
pub static RECONCILES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("runsync_reconciles_total")
        .with_description("Total number of run reconciliations by outcome")
        .with_unit("{reconciles}")
        .build()
});

/// Histogram of reconciliation duration
///
/// Labels:
/// - `kind`: gate, stack, sentinel
/// - `outcome`: requeue, await_change, retired, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("runsync_reconcile_duration_seconds")
        .with_description("Duration of run reconciliation in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// How one pass over a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Scheduled again after a delay
    Requeue,
    /// Waiting for the next poll or push event
    AwaitChange,
    /// Local state for the run was cleaned up
    Retired,
    /// The pass failed and backs off
    Error,
}

impl ReconcileOutcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requeue => "requeue",
            Self::AwaitChange => "await_change",
            Self::Retired => "retired",
            Self::Error => "error",
        }
    }
}

/// Labels for cache lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheResult {
    Hit,
    Miss,
}

impl CacheResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one reconciliation of a run
pub struct ReconcileTimer {
    kind: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record the outcome and elapsed time
    pub fn finish(self, outcome: ReconcileOutcome) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = [
            KeyValue::new("kind", self.kind),
            KeyValue::new("outcome", outcome.as_str()),
        ];
        RECONCILE_DURATION.record(duration, &labels);
        RECONCILES.add(1, &labels);
    }
}

/// Record a Job created for a run
pub fn record_job_created(kind: &str) {
    JOBS_CREATED.add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record a run state reported upstream
pub fn record_status_report(kind: &str, state: &str) {
    STATUS_REPORTS.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("state", state.to_string()),
        ],
    );
}

/// Record a cache lookup
pub fn record_cache_lookup(cache: &str, result: CacheResult) {
    CACHE_LOOKUPS.add(
        1,
        &[
            KeyValue::new("cache", cache.to_string()),
            KeyValue::new("result", result.as_str()),
        ],
    );
}
