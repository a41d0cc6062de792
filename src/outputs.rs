//! Internal code for output.
//!
//! Sinks are built once per worker and receive every record the
//! worker's output steps emit. Delivery is at-least-once: after a
//! crash, records from the epoch in flight are written again on
//! resume, so sinks that care should deduplicate or write
//! idempotently.

use serde_json::Value;

use crate::errors::Result;
use crate::execution::{WorkerCount, WorkerIndex};

/// Where a worker writes a batch of records.
pub trait Sink: Send {
    fn write_batch(&mut self, items: Vec<Value>) -> Result<()>;

    /// Release any held resources. Called once when the dataflow
    /// finishes or the worker shuts down.
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// An output definition, built into one [`Sink`] per worker.
pub trait Output: Send + Sync {
    fn build(&self, index: WorkerIndex, count: WorkerCount) -> Result<Box<dyn Sink>>;
}

/// Collects everything written into a shared vector. Handy for tests
/// and demos.
pub mod testing {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    pub struct CapturingOutput {
        items: Arc<Mutex<Vec<Value>>>,
    }

    impl CapturingOutput {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn items(&self) -> Vec<Value> {
            self.items.lock().expect("output capture poisoned").clone()
        }
    }

    impl Output for CapturingOutput {
        fn build(&self, _index: WorkerIndex, _count: WorkerCount) -> Result<Box<dyn Sink>> {
            Ok(Box::new(self.clone()))
        }
    }

    impl Sink for CapturingOutput {
        fn write_batch(&mut self, items: Vec<Value>) -> Result<()> {
            self.items
                .lock()
                .expect("output capture poisoned")
                .extend(items);
            Ok(())
        }
    }
}
