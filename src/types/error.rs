use thiserror::Error;

use super::{NodeId, StripeIdx};

/// Error type for garbage collection and compaction.
#[derive(Debug, Error)]
pub enum GcError {
    /// An allocation needed to stage a repair or build shadow state failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// The tree cannot be repaired without an unsupported rewrite.
    #[error("structural conflict: {0}")]
    StructuralConflict(String),
    /// Live and shadow disagree on a stripe's immutable shape.
    #[error("stripe {idx} shape differs between live and recomputed state")]
    StripeShapeMismatch {
        /// Offending stripe.
        idx: StripeIdx,
    },
    /// Generation conflicts kept forcing restarts.
    #[error("unable to fix bucket generations after {restarts} restarts")]
    RetryBoundExceeded {
        /// Restarts performed before giving up.
        restarts: u32,
    },
    /// A concurrent update raced with a transactional commit.
    #[error("concurrent update conflict")]
    TransientConflict,
    /// A tree node could not be read.
    #[error("unreadable tree node {node}")]
    Unreadable {
        /// Node that failed to read.
        node: NodeId,
    },
    /// The operation observed a stop request.
    #[error("shutdown requested")]
    Shutdown,
    /// Lookup failed.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Caller or internal invariant violated.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Options could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GcError {
    /// Whether this error must abort a pass.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, GcError::TransientConflict | GcError::Shutdown)
    }
}

/// Result type alias for GC operations.
pub type Result<T> = std::result::Result<T, GcError>;
