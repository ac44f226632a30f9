//! Low-level primitives for the collector.
//!
//! Includes the versioned GC-position snapshot, per-worker sharded
//! accumulators, and the I/O-rate clock that paces background passes.

/// I/O-rate clock.
///
/// Advances with sectors written rather than wall time.
pub mod clock;

/// Versioned snapshot of the GC position.
///
/// A single writer publishes; readers never block and retry on a torn read.
pub mod seqlock;

/// Per-worker sharded accumulators folded on demand.
pub mod sharded;
