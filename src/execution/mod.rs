//! Entry points for actually running a dataflow.
//!
//! [`run_main`] runs a flow on a single worker in the current thread,
//! which is what you want while prototyping sources and sinks.
//! [`spawn_cluster`] runs several workers as threads in this process.
//! [`cluster_main`] runs one worker of a multi-process cluster; start
//! one process per address in the shared address list and the workers
//! find each other over TCP.
//!
//! All of them block until the dataflow is complete: every input
//! partition has reached end of input and all windows have flushed.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::dataflow::Dataflow;
use crate::errors::{EngineError, Result};
use crate::exchange::mem;
use crate::exchange::tcp::TcpMesh;
use crate::exchange::Mesh;
use crate::inputs::RetryPolicy;
use crate::metrics::Metrics;
use crate::recovery::RecoveryConfig;
use crate::worker::Worker;

/// Identifies a worker in a cluster.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerIndex(pub usize);

/// Total number of workers in a cluster.
///
/// Keyed state routing hashes against this, so resizing a cluster
/// moves key ownership; recovery handles that by having every worker
/// read back all state and keep what routes to it.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerCount(pub usize);

/// How much system time should pass between state snapshot epochs.
///
/// Shorter means less work replayed on resume but more snapshot
/// overhead.
#[derive(Debug, Copy, Clone)]
pub struct EpochInterval(pub Duration);

impl Default for EpochInterval {
    fn default() -> Self {
        Self(Duration::from_secs(10))
    }
}

/// Knobs shared by all the execution entry points.
#[derive(Clone)]
pub struct RunConfig {
    pub epoch_interval: EpochInterval,
    /// Persist state and progress here so a crashed execution can
    /// resume. [`None`] disables recovery entirely.
    pub recovery: Option<RecoveryConfig>,
    /// Retry schedule for transient source faults.
    pub retry: RetryPolicy,
    /// Most records a worker takes from one input partition per
    /// activation.
    pub batch_max_len: usize,
    /// Longest a worker waits on one input partition per activation;
    /// whatever arrived by then is the batch, even if it's short.
    pub batch_max_wait: Duration,
    /// How long to wait for peers at startup and at each epoch
    /// barrier before failing with [`EngineError::PeerUnreachable`].
    pub barrier_timeout: Duration,
    /// Share a metrics registry with the caller; [`None`] builds a
    /// fresh one per execution.
    pub metrics: Option<Metrics>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            epoch_interval: EpochInterval::default(),
            recovery: None,
            retry: RetryPolicy::default(),
            batch_max_len: 1000,
            batch_max_wait: Duration::from_millis(50),
            barrier_timeout: Duration::from_secs(30),
            metrics: None,
        }
    }
}

impl RunConfig {
    fn metrics(&self) -> Result<Metrics> {
        match &self.metrics {
            Some(metrics) => Ok(metrics.clone()),
            None => Metrics::new(),
        }
    }
}

/// Execute a dataflow on a single worker in the current thread.
///
/// Blocks until execution is complete.
pub fn run_main(flow: Dataflow, config: RunConfig) -> Result<()> {
    let interrupt = Arc::new(AtomicBool::new(false));
    run_main_with_interrupt(flow, config, interrupt)
}

/// [`run_main`], but stoppable: set the flag and the worker finishes
/// its current epoch (snapshotting it if recovery is on) and returns.
pub fn run_main_with_interrupt(
    flow: Dataflow,
    config: RunConfig,
    interrupt: Arc<AtomicBool>,
) -> Result<()> {
    let metrics = config.metrics()?;
    let mesh = mem::full_mesh(WorkerCount(1))
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Config("cluster must have at least one worker".into()))?;
    Worker::build(&flow, Box::new(mesh), &config, metrics, interrupt)?.run()
}

/// Execute a dataflow on a cluster of worker threads in this process.
///
/// Blocks until execution is complete. The first worker error aborts
/// the whole execution.
pub fn spawn_cluster(flow: Dataflow, worker_count: usize, config: RunConfig) -> Result<()> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let metrics = config.metrics()?;

    let mut handles = Vec::with_capacity(worker_count);
    for mesh in mem::full_mesh(WorkerCount(worker_count)) {
        let index = mesh.index();
        let flow = flow.clone();
        let config = config.clone();
        let metrics = metrics.clone();
        let interrupt = interrupt.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("millrace-worker-{}", index.0))
                .spawn(move || {
                    Worker::build(&flow, Box::new(mesh), &config, metrics, interrupt)?.run()
                })?,
        );
    }

    let mut result = Ok(());
    for handle in handles {
        match handle.join() {
            Ok(worker_result) => {
                if result.is_ok() {
                    result = worker_result;
                }
            }
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
    result
}

/// Execute one worker of a multi-process cluster.
///
/// `addresses` is the full ordered list of `host:port` listen
/// addresses, identical in every process; `proc_index` says which
/// entry is this process. Blocks until execution is complete.
pub fn cluster_main(
    flow: Dataflow,
    addresses: Vec<String>,
    proc_index: usize,
    config: RunConfig,
) -> Result<()> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let metrics = config.metrics()?;
    let mesh = TcpMesh::connect(addresses, WorkerIndex(proc_index), config.barrier_timeout)?;
    Worker::build(&flow, Box::new(mesh), &config, metrics, interrupt)?.run()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Arc;

    use chrono::DateTime;
    use chrono::TimeZone;
    use chrono::Utc;
    use serde_json::json;
    use serde_json::Value;

    use crate::inputs::PartitionedInput;
    use crate::inputs::SourceCursor;
    use crate::outputs::testing::CapturingOutput;
    use crate::recovery::model::{StateBytes, StateKey, StepId};
    use crate::window::ClockConfig;
    use crate::window::WindowConfig;

    use super::*;

    /// Partitioned input over fixed in-memory records, resumable by
    /// index.
    struct StaticInput {
        parts: Vec<(StateKey, Vec<Value>)>,
    }

    impl StaticInput {
        fn new(parts: Vec<(&str, Vec<Value>)>) -> Self {
            Self {
                parts: parts
                    .into_iter()
                    .map(|(name, items)| (StateKey::new(name), items))
                    .collect(),
            }
        }
    }

    impl PartitionedInput for StaticInput {
        fn list_parts(&self) -> Vec<StateKey> {
            self.parts.iter().map(|(key, _items)| key.clone()).collect()
        }

        fn build_part(
            &self,
            part: &StateKey,
            resume_snapshot: Option<StateBytes>,
        ) -> Result<Box<dyn SourceCursor>> {
            let items = self
                .parts
                .iter()
                .find(|(key, _items)| key == part)
                .map(|(_key, items)| items.clone())
                .unwrap();
            let at = resume_snapshot
                .map(StateBytes::de::<usize>)
                .transpose()?
                .unwrap_or(0);
            Ok(Box::new(StaticCursor { items, at }))
        }
    }

    struct StaticCursor {
        items: Vec<Value>,
        at: usize,
    }

    impl SourceCursor for StaticCursor {
        fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
            if self.at < self.items.len() {
                let item = self.items[self.at].clone();
                self.at += 1;
                Ok(Some(vec![item]))
            } else {
                Ok(None)
            }
        }

        fn snapshot(&self) -> Result<StateBytes> {
            StateBytes::ser(&self.at)
        }
    }

    fn test_config() -> RunConfig {
        RunConfig {
            epoch_interval: EpochInterval(Duration::from_millis(50)),
            barrier_timeout: Duration::from_secs(10),
            batch_max_len: 100,
            batch_max_wait: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn tmp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("millrace-test-{}", fastrand::u64(..)));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn as_keyed(value: &Value) -> (String, i64) {
        let arr = value.as_array().unwrap();
        (
            arr[0].as_str().unwrap().to_string(),
            arr[1].as_i64().unwrap(),
        )
    }

    #[test]
    fn map_transforms_every_record() {
        let mut flow = Dataflow::new();
        let inp = flow.input(
            "inp",
            StaticInput::new(vec![("p0", vec![json!(1), json!(2), json!(3)])]),
        );
        let doubled = flow.map(
            "double",
            inp,
            Arc::new(|value| json!(value.as_i64().unwrap() * 2)),
        );
        let capture = CapturingOutput::new();
        flow.output("out", doubled, capture.clone());

        run_main(flow, test_config()).unwrap();

        let mut got: Vec<i64> = capture
            .items()
            .iter()
            .map(|value| value.as_i64().unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![2, 4, 6]);
    }

    #[test]
    fn branch_and_merge_conserve_records() {
        let mut flow = Dataflow::new();
        let inp = flow.input(
            "inp",
            StaticInput::new(vec![("p0", (1..=6).map(|n| json!(n)).collect())]),
        );
        let (evens, odds) = flow.branch(
            "parity",
            inp,
            Arc::new(|value| value.as_i64().unwrap() % 2 == 0),
        );
        let rejoined = flow.merge("rejoin", vec![evens, odds]);
        let capture = CapturingOutput::new();
        flow.output("out", rejoined, capture.clone());

        run_main(flow, test_config()).unwrap();

        let mut got: Vec<i64> = capture
            .items()
            .iter()
            .map(|value| value.as_i64().unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn windowed_sum_feeds_stateful_max() {
        let mut flow = Dataflow::new();
        let inp = flow.input(
            "inp",
            StaticInput::new(vec![(
                "p0",
                vec![json!(["a", 3]), json!(["a", 2]), json!(["b", 5])],
            )]),
        );
        let sums = flow.reduce_window(
            "sum",
            inp,
            ClockConfig::System,
            WindowConfig::Tumbling {
                length: chrono::Duration::hours(1),
                align_to: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            },
            Arc::new(|acc, value| json!(acc.as_i64().unwrap() + value.as_i64().unwrap())),
        );
        let maxes = flow.stateful_map(
            "keep_max",
            sums,
            Arc::new(|| json!(i64::MIN)),
            Arc::new(|state, value| {
                let max = state.as_i64().unwrap().max(value.as_i64().unwrap());
                (Some(json!(max)), Some(json!(max)))
            }),
        );
        let capture = CapturingOutput::new();
        flow.output("out", maxes, capture.clone());

        run_main(flow, test_config()).unwrap();

        let mut got: Vec<(String, i64)> = capture.items().iter().map(as_keyed).collect();
        got.sort();
        assert_eq!(got, vec![("a".to_string(), 5), ("b".to_string(), 5)]);
    }

    #[test]
    fn consecutive_windows_feed_downstream_max() {
        let t0 = Utc.with_ymd_and_hms(2023, 5, 4, 12, 0, 0).unwrap();
        let at = |secs: i64, n: i64| {
            json!([
                "a",
                {
                    "t": (t0 + chrono::Duration::seconds(secs)).to_rfc3339(),
                    "n": n,
                },
            ])
        };

        let mut flow = Dataflow::new();
        // Two consecutive 2s windows: the first sums to 3 and closes
        // when the third record advances the watermark, the second
        // sums to 2 and closes at end of input.
        let inp = flow.input(
            "inp",
            StaticInput::new(vec![("p0", vec![at(0, 1), at(1, 2), at(2, 2)])]),
        );
        let sums = flow.reduce_window(
            "win",
            inp,
            ClockConfig::Event {
                dt_getter: Arc::new(|value| {
                    value["t"]
                        .as_str()
                        .unwrap()
                        .parse::<DateTime<Utc>>()
                        .unwrap()
                }),
                wait_for_system_duration: chrono::Duration::zero(),
            },
            WindowConfig::Tumbling {
                length: chrono::Duration::seconds(2),
                align_to: t0,
            },
            Arc::new(|acc, value| {
                json!({
                    "t": acc["t"],
                    "n": acc["n"].as_i64().unwrap() + value["n"].as_i64().unwrap(),
                })
            }),
        );
        let maxes = flow.stateful_map(
            "keep_max",
            sums,
            Arc::new(|| json!(i64::MIN)),
            Arc::new(|state, value| {
                let max = state.as_i64().unwrap().max(value["n"].as_i64().unwrap());
                (Some(json!(max)), Some(json!(max)))
            }),
        );
        let capture = CapturingOutput::new();
        flow.output("out", maxes, capture.clone());

        run_main(flow, test_config()).unwrap();

        // The max must ride through the smaller second aggregate.
        let got: Vec<(String, i64)> = capture.items().iter().map(as_keyed).collect();
        assert_eq!(got, vec![("a".to_string(), 3), ("a".to_string(), 3)]);
    }

    #[test]
    fn late_records_are_dropped_and_counted() {
        let metrics = Metrics::new().unwrap();
        let t0 = Utc.with_ymd_and_hms(2023, 5, 4, 12, 0, 0).unwrap();
        let at = |secs: i64, n: i64| {
            json!([
                "a",
                {
                    "t": (t0 + chrono::Duration::seconds(secs)).to_rfc3339(),
                    "n": n,
                },
            ])
        };

        let mut flow = Dataflow::new();
        // The third record sits behind the watermark the second one
        // advanced; its window has already closed.
        let inp = flow.input(
            "inp",
            StaticInput::new(vec![("p0", vec![at(0, 1), at(10, 1), at(1, 1)])]),
        );
        let sums = flow.reduce_window(
            "win",
            inp,
            ClockConfig::Event {
                dt_getter: Arc::new(|value| {
                    value["t"]
                        .as_str()
                        .unwrap()
                        .parse::<DateTime<Utc>>()
                        .unwrap()
                }),
                wait_for_system_duration: chrono::Duration::zero(),
            },
            WindowConfig::Tumbling {
                length: chrono::Duration::seconds(5),
                align_to: t0,
            },
            Arc::new(|acc, value| {
                json!({
                    "t": acc["t"],
                    "n": acc["n"].as_i64().unwrap() + value["n"].as_i64().unwrap(),
                })
            }),
        );
        let capture = CapturingOutput::new();
        flow.output("out", sums, capture.clone());

        let mut config = test_config();
        config.metrics = Some(metrics.clone());
        run_main(flow, config).unwrap();

        assert_eq!(metrics.dropped_late_records(&StepId::new("win")), 1);
        // Two windows closed; the late record counted toward neither.
        let total: i64 = capture
            .items()
            .iter()
            .map(|value| value[1]["n"].as_i64().unwrap())
            .sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn resumed_execution_skips_consumed_input() {
        let dir = tmp_dir();
        let mut config = test_config();
        config.recovery = Some(RecoveryConfig::new(&dir));

        let build_flow = |capture: &CapturingOutput| {
            let mut flow = Dataflow::new();
            let inp = flow.input(
                "inp",
                StaticInput::new(vec![("p0", vec![json!(["a", 1]), json!(["a", 1])])]),
            );
            let counts = flow.stateful_map(
                "count",
                inp,
                Arc::new(|| json!(0)),
                Arc::new(|state, _value| {
                    let n = state.as_i64().unwrap() + 1;
                    (Some(json!(n)), Some(json!(n)))
                }),
            );
            flow.output("out", counts, capture.clone());
            flow
        };

        let first = CapturingOutput::new();
        run_main(build_flow(&first), config.clone()).unwrap();
        let mut got: Vec<(String, i64)> = first.items().iter().map(as_keyed).collect();
        got.sort();
        assert_eq!(got, vec![("a".to_string(), 1), ("a".to_string(), 2)]);

        // Same input again: the cursor resumes past everything it
        // already yielded, so nothing new comes out.
        let second = CapturingOutput::new();
        run_main(build_flow(&second), config).unwrap();
        assert!(second.items().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn interrupted_window_resumes_mid_window() {
        let dir = tmp_dir();
        let mut config = test_config();
        config.recovery = Some(RecoveryConfig::new(&dir));

        let t0 = Utc.with_ymd_and_hms(2023, 5, 4, 12, 0, 0).unwrap();
        let at = |secs: i64, n: i64| {
            json!([
                "a",
                {
                    "t": (t0 + chrono::Duration::seconds(secs)).to_rfc3339(),
                    "n": n,
                },
            ])
        };

        let build_flow = |records: Vec<Value>, capture: &CapturingOutput| {
            let mut flow = Dataflow::new();
            let inp = flow.input("inp", StaticInput::new(vec![("p0", records)]));
            let sums = flow.reduce_window(
                "win",
                inp,
                ClockConfig::Event {
                    dt_getter: Arc::new(|value| {
                        value["t"]
                            .as_str()
                            .unwrap()
                            .parse::<DateTime<Utc>>()
                            .unwrap()
                    }),
                    wait_for_system_duration: chrono::Duration::zero(),
                },
                WindowConfig::Tumbling {
                    length: chrono::Duration::seconds(10),
                    align_to: t0,
                },
                Arc::new(|acc, value| {
                    json!({
                        "t": acc["t"],
                        "n": acc["n"].as_i64().unwrap() + value["n"].as_i64().unwrap(),
                    })
                }),
            );
            flow.output("out", sums, capture.clone());
            flow
        };

        // First execution stops at its first epoch close, while the
        // window is still open: its accumulator goes to the store, not
        // downstream.
        let first = CapturingOutput::new();
        let interrupt = Arc::new(AtomicBool::new(true));
        run_main_with_interrupt(
            build_flow(vec![at(0, 1), at(1, 2)], &first),
            config.clone(),
            interrupt,
        )
        .unwrap();
        assert!(first.items().is_empty());

        // The second execution re-opens the window from its snapshot,
        // adds one more record, and closes it at end of input. The sum
        // covers both executions.
        let second = CapturingOutput::new();
        run_main(
            build_flow(vec![at(0, 1), at(1, 2), at(2, 4)], &second),
            config,
        )
        .unwrap();
        let got: Vec<i64> = second
            .items()
            .iter()
            .map(|value| value[1]["n"].as_i64().unwrap())
            .collect();
        assert_eq!(got, vec![7]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn keys_route_consistently_across_workers() {
        let keys = ["a", "b", "c", "d", "e", "f"];
        let records: Vec<Value> = keys.iter().map(|key| json!([key, 1])).collect();

        let mut flow = Dataflow::new();
        // Both partitions carry every key once; whichever worker reads
        // which partition, each key's state must land on exactly one
        // worker, so its running count must reach exactly 2.
        let inp = flow.input(
            "inp",
            StaticInput::new(vec![("p0", records.clone()), ("p1", records)]),
        );
        let counts = flow.stateful_map(
            "count",
            inp,
            Arc::new(|| json!(0)),
            Arc::new(|state, _value| {
                let n = state.as_i64().unwrap() + 1;
                (Some(json!(n)), Some(json!(n)))
            }),
        );
        let capture = CapturingOutput::new();
        flow.output("out", counts, capture.clone());

        spawn_cluster(flow, 2, test_config()).unwrap();

        let mut highest: HashMap<String, i64> = HashMap::new();
        for item in capture.items() {
            let (key, n) = as_keyed(&item);
            let entry = highest.entry(key).or_insert(0);
            *entry = (*entry).max(n);
        }
        assert_eq!(highest.len(), keys.len());
        assert!(highest.values().all(|n| *n == 2));
    }
}
