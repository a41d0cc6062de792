//! Millrace is a streaming dataflow engine: you describe a directed
//! graph of operator steps over JSON records, and one or more workers
//! execute it with partitioned, resumable inputs, per-key managed
//! state, time-based windowing, and crash recovery.
//!
//! Build a graph with [`Dataflow`], then hand it to one of the entry
//! points in [`execution`]: [`run_main`] for a single in-thread
//! worker, [`spawn_cluster`] for a thread-per-worker cluster in this
//! process, or [`cluster_main`] for one process of a multi-process
//! cluster connected over TCP.
//!
//! Stateful steps operate on `[key, value]` records; each key's state
//! lives on exactly one worker (chosen by a deterministic hash of the
//! key) and records are routed there automatically. With recovery
//! enabled, every worker snapshots its state and input positions at
//! the close of each epoch, and a restarted cluster resumes from the
//! last epoch all workers finished without re-reading input it
//! already processed.

pub mod dataflow;
pub mod errors;
pub(crate) mod exchange;
pub mod execution;
pub mod inputs;
pub mod metrics;
pub mod operators;
pub mod outputs;
pub mod recovery;
pub mod window;
pub(crate) mod worker;

pub use crate::dataflow::Dataflow;
pub use crate::dataflow::MapFn;
pub use crate::dataflow::PredicateFn;
pub use crate::dataflow::StreamId;
pub use crate::errors::EngineError;
pub use crate::errors::Result;
pub use crate::execution::cluster_main;
pub use crate::execution::run_main;
pub use crate::execution::run_main_with_interrupt;
pub use crate::execution::spawn_cluster;
pub use crate::execution::EpochInterval;
pub use crate::execution::RunConfig;
pub use crate::execution::WorkerCount;
pub use crate::execution::WorkerIndex;
pub use crate::inputs::PartitionedInput;
pub use crate::inputs::RetryPolicy;
pub use crate::inputs::SourceCursor;
pub use crate::metrics::Metrics;
pub use crate::operators::Reducer;
pub use crate::operators::StateBuilder;
pub use crate::operators::StatefulMapper;
pub use crate::outputs::Output;
pub use crate::outputs::Sink;
pub use crate::recovery::model::StateBytes;
pub use crate::recovery::model::StateKey;
pub use crate::recovery::model::StepId;
pub use crate::recovery::RecoveryConfig;
pub use crate::window::ClockConfig;
pub use crate::window::TimeGetter;
pub use crate::window::WindowConfig;
