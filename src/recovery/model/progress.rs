//! Data model representing progress in the dataflow and the recovery
//! system.
//!
//! A progress store is a K-V mapping from [`WorkerKey`] to
//! [`ProgressMsg`]s noting how far each worker got.

use serde::Deserialize;
use serde::Serialize;

pub(crate) use crate::execution::{WorkerCount, WorkerIndex};

use super::change::*;

/// Incrementing ID for a dataflow cluster execution.
///
/// This is used to ensure progress information from worker `3` of a
/// previous execution is not mis-interpreted as belonging to the
/// current one. As you resume a dataflow, this increases by 1 each
/// time.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Execution(pub u64);

/// Key used to store progress information for a specific worker in
/// the recovery store.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerKey(pub Execution, pub WorkerIndex);

/// The oldest epoch for which work is still outstanding on a worker.
///
/// All epochs before this are fully snapshotted on that worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerFrontier(pub u64);

/// The epoch a new dataflow execution should resume from the
/// beginning of.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeEpoch(pub u64);

/// To resume a dataflow execution, you need to know which epoch to
/// resume state from, but also which execution to label new progress
/// data with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResumeFrom(pub Execution, pub ResumeEpoch);

impl Default for ResumeFrom {
    /// Starting from scratch.
    fn default() -> Self {
        Self(Execution(0), ResumeEpoch(0))
    }
}

/// Types of recovery data related to progress on a worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressMsg {
    /// Information about this execution. Applies during the entire
    /// execution.
    Init(WorkerCount, ResumeEpoch),
    /// Progress made by this worker.
    Advance(WorkerFrontier),
}

/// A change to the progress store.
pub type ProgressChange = KChange<WorkerKey, ProgressMsg>;

/// All progress stores have to implement this writer.
pub trait ProgressWriter: KWriter<WorkerKey, ProgressMsg> {}

/// All progress stores have to implement this reader.
pub trait ProgressReader: KReader<WorkerKey, ProgressMsg> {}
