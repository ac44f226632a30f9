//! Metrics hooks for collector passes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::gc::Severity;

/// Which kind of pass produced a measurement.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    /// Full mark-and-reconcile pass.
    Full,
    /// Lightweight generation-only pass.
    Generation,
    /// Node coalescing sweep.
    Coalesce,
}

/// Trait for tracking collector activity.
///
/// Implementations receive callbacks from the orchestrator, the reconciler and the
/// coalescer. They must be cheap; they are invoked while GC locks are held.
pub trait GcMetrics: Send + Sync {
    /// Records the completion (successful or not) of a pass.
    fn pass_finished(&self, kind: PassKind, duration: Duration, corrections: u64);

    /// Records a restart of the mark phase after a generation conflict.
    fn restart(&self);

    /// Records a consistency issue delivered on the reporting channel.
    fn issue_reported(&self, severity: Severity);

    /// Records a successful merge of `old` nodes into `new` nodes.
    fn nodes_coalesced(&self, old: usize, new: usize);

    /// Records keys rewritten by the generation-only pass.
    fn keys_rewritten(&self, keys: u64);
}

/// A no-op implementation of [`GcMetrics`].
#[derive(Default)]
pub struct NoopGcMetrics;

impl GcMetrics for NoopGcMetrics {
    fn pass_finished(&self, _kind: PassKind, _duration: Duration, _corrections: u64) {}
    fn restart(&self) {}
    fn issue_reported(&self, _severity: Severity) {}
    fn nodes_coalesced(&self, _old: usize, _new: usize) {}
    fn keys_rewritten(&self, _keys: u64) {}
}

/// A thread-safe counter-based implementation of [`GcMetrics`].
#[derive(Default)]
pub struct CounterGcMetrics {
    /// Completed full passes.
    pub full_passes: AtomicU64,
    /// Completed generation-only passes.
    pub generation_passes: AtomicU64,
    /// Completed coalescing sweeps.
    pub coalesce_sweeps: AtomicU64,
    /// Corrections applied across all passes.
    pub corrections: AtomicU64,
    /// Mark-phase restarts.
    pub restarts: AtomicU64,
    /// Repairable issues reported.
    pub repairable_issues: AtomicU64,
    /// Fatal issues reported.
    pub fatal_issues: AtomicU64,
    /// Nodes removed by coalescing.
    pub nodes_merged_away: AtomicU64,
    /// Keys rewritten by the generation-only pass.
    pub keys_rewritten: AtomicU64,
    /// Total time spent in passes, in microseconds.
    pub busy_micros: AtomicU64,
}

impl GcMetrics for CounterGcMetrics {
    fn pass_finished(&self, kind: PassKind, duration: Duration, corrections: u64) {
        match kind {
            PassKind::Full => self.full_passes.fetch_add(1, Ordering::Relaxed),
            PassKind::Generation => self.generation_passes.fetch_add(1, Ordering::Relaxed),
            PassKind::Coalesce => self.coalesce_sweeps.fetch_add(1, Ordering::Relaxed),
        };
        self.corrections.fetch_add(corrections, Ordering::Relaxed);
        let micros = duration.as_micros().min(u128::from(u64::MAX)) as u64;
        self.busy_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    fn issue_reported(&self, severity: Severity) {
        match severity {
            Severity::Repairable => self.repairable_issues.fetch_add(1, Ordering::Relaxed),
            Severity::Fatal => self.fatal_issues.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn nodes_coalesced(&self, old: usize, new: usize) {
        self.nodes_merged_away
            .fetch_add(old.saturating_sub(new) as u64, Ordering::Relaxed);
    }

    fn keys_rewritten(&self, keys: u64) {
        self.keys_rewritten.fetch_add(keys, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
pub fn default_metrics() -> Arc<dyn GcMetrics> {
    Arc::new(NoopGcMetrics)
}
