//! Engine error taxonomy.
//!
//! Transient faults (an unavailable source) are handled inside the
//! component that sees them; everything else propagates out of the
//! execution entry points via [`Result`].

use crate::execution::{WorkerCount, WorkerIndex};
use crate::recovery::model::{StateKey, StepId};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Transient I/O failure in a source cursor.
    ///
    /// The worker retries cursor construction from the last good
    /// resume state under the configured [`crate::inputs::RetryPolicy`]
    /// before escalating to [`EngineError::PartitionFailed`].
    #[error("source unavailable: {reason}")]
    SourceUnavailable { reason: String },

    /// A partition exhausted its retry budget.
    #[error("partition {part} of step {step_id} failed after {attempts} attempts")]
    PartitionFailed {
        step_id: StepId,
        part: StateKey,
        attempts: u32,
    },

    /// A routed record arrived at a worker that does not own its key.
    ///
    /// This is a configuration bug (peer count or address list
    /// mismatch) and must never be silently corrected.
    #[error(
        "routing mismatch: key {key} for step {step_id} arrived at worker \
         {got:?} of {count:?} but routes to {expected:?}"
    )]
    RoutingMismatch {
        step_id: StepId,
        key: StateKey,
        expected: WorkerIndex,
        got: WorkerIndex,
        count: WorkerCount,
    },

    /// Recovery data failed to deserialize.
    #[error("snapshot corrupt: {context}")]
    SnapshotCorrupt {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// A peer did not show up at the epoch barrier in time.
    #[error("peer {peer:?} unreachable at epoch {epoch} barrier")]
    PeerUnreachable { peer: WorkerIndex, epoch: u64 },

    /// A stateful step was fed a record that is not a `[key, value]`
    /// two-element array with a string key.
    #[error("step {step_id} requires `[key, value]` records with a string key; got `{got}`")]
    InvalidKeyedRecord { step_id: StepId, got: String },

    /// Cluster configuration error (bad address list, out-of-range
    /// process id, peer handshake disagreement).
    #[error("invalid cluster config: {0}")]
    Config(String),

    /// Underlying recovery store failure.
    #[error("recovery store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Recovery store schema migration failure.
    #[error("recovery store migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Metrics registry failure.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Error bubbled up from user-supplied logic in a source or sink.
    #[error("error in step {step_id}: {reason}")]
    Logic { step_id: StepId, reason: String },
}

impl EngineError {
    pub(crate) fn snapshot_corrupt(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::SnapshotCorrupt {
            context: context.into(),
            source,
        }
    }
}
