//! Consistency issues and pass statistics.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

use crate::metrics::{GcMetrics, PassKind};

/// How bad a consistency issue is.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Fixed in place by the pass that found it.
    Repairable,
    /// The pass aborted.
    Fatal,
}

/// What kind of inconsistency was found.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Sibling or parent/child bounds disagree.
    Topology,
    /// A child node could not be read.
    UnreadableNode,
    /// Pointer into a bucket with no recorded generation.
    MissingGen,
    /// Pointer generation newer than its bucket.
    FutureGen,
    /// Dirty pointer older than its bucket.
    StaleDirtyPtr,
    /// Pointer into a stripe that does not exist.
    DeadStripe,
    /// Pointer to a bucket past the end of its device.
    MissingBucket,
    /// Key version above the recorded maximum.
    KeyVersion,
    /// Replica combination not registered.
    ReplicasMissing,
    /// Root node does not span the whole key space.
    RootBounds,
    /// A root pointer needed a repair that cannot be staged.
    RootRepair,
    /// Stripe shape differs between live and recomputed state.
    StripeShape,
    /// Bucket field differs between live and recomputed state.
    BucketMismatch,
    /// Stripe block counts differ.
    StripeMismatch,
    /// Device usage differs.
    DevUsageMismatch,
    /// Filesystem usage differs.
    FsUsageMismatch,
}

impl IssueKind {
    /// Short name used in log events.
    pub fn name(self) -> &'static str {
        match self {
            IssueKind::Topology => "topology",
            IssueKind::UnreadableNode => "unreadable_node",
            IssueKind::MissingGen => "missing_gen",
            IssueKind::FutureGen => "future_gen",
            IssueKind::StaleDirtyPtr => "stale_dirty_ptr",
            IssueKind::DeadStripe => "dead_stripe",
            IssueKind::MissingBucket => "missing_bucket",
            IssueKind::KeyVersion => "key_version",
            IssueKind::ReplicasMissing => "replicas_missing",
            IssueKind::RootBounds => "root_bounds",
            IssueKind::RootRepair => "root_repair",
            IssueKind::StripeShape => "stripe_shape",
            IssueKind::BucketMismatch => "bucket_mismatch",
            IssueKind::StripeMismatch => "stripe_mismatch",
            IssueKind::DevUsageMismatch => "dev_usage_mismatch",
            IssueKind::FsUsageMismatch => "fs_usage_mismatch",
        }
    }
}

/// One reported inconsistency.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Issue {
    /// Severity.
    pub severity: Severity,
    /// Kind.
    pub kind: IssueKind,
    /// Human-readable detail.
    pub description: String,
}

/// Reporting channel for consistency issues.
///
/// Every issue is logged, counted, kept for later inspection and forwarded to
/// each live subscriber.
pub struct IssueLog {
    issues: Mutex<Vec<Issue>>,
    subscribers: Mutex<Vec<Sender<Issue>>>,
    metrics: Arc<dyn GcMetrics>,
}

impl IssueLog {
    pub(crate) fn new(metrics: Arc<dyn GcMetrics>) -> Self {
        Self {
            issues: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            metrics,
        }
    }

    pub(crate) fn report(&self, severity: Severity, kind: IssueKind, description: String) {
        match severity {
            Severity::Repairable => {
                warn!(kind = kind.name(), %description, "gc.issue.repairable")
            }
            Severity::Fatal => error!(kind = kind.name(), %description, "gc.issue.fatal"),
        }
        self.metrics.issue_reported(severity);
        let issue = Issue {
            severity,
            kind,
            description,
        };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(issue.clone()).is_ok());
        self.issues.lock().push(issue);
    }

    pub(crate) fn repairable(&self, kind: IssueKind, description: String) {
        self.report(Severity::Repairable, kind, description);
    }

    pub(crate) fn fatal(&self, kind: IssueKind, description: String) {
        self.report(Severity::Fatal, kind, description);
    }

    /// Receives every issue reported from now on.
    pub fn subscribe(&self) -> Receiver<Issue> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Every issue reported so far.
    pub fn all(&self) -> Vec<Issue> {
        self.issues.lock().clone()
    }

    /// Issues of one kind.
    pub fn of_kind(&self, kind: IssueKind) -> Vec<Issue> {
        self.issues
            .lock()
            .iter()
            .filter(|issue| issue.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of issues reported so far.
    pub fn len(&self) -> usize {
        self.issues.lock().len()
    }

    /// Whether nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.issues.lock().is_empty()
    }
}

/// Summary of one pass.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GcStats {
    /// Pass kind.
    pub kind: Option<PassKind>,
    /// Whether this was an initial pass.
    pub initial: bool,
    /// Mark-phase restarts.
    pub restarts: u32,
    /// Issues reported during the pass.
    pub repairs: u64,
    /// Live fields overwritten by reconciliation.
    pub corrections: u64,
    /// Nodes visited.
    pub nodes_visited: u64,
    /// Keys whose references were marked.
    pub keys_marked: u64,
    /// Keys committed again with stale pointers dropped.
    pub keys_rewritten: u64,
    /// Nodes rewritten copy-on-write in place.
    pub nodes_rewritten: u64,
    /// Nodes that disappeared into coalesced siblings.
    pub nodes_merged_away: u64,
    /// Wall time.
    pub duration_ms: u64,
}
