//! The worker loop.
//!
//! Each worker compiles the [`Dataflow`] blueprint into runtime steps,
//! then single-threadedly drives records through them: pump the input
//! batchers, push each record through its consuming steps via a work
//! queue, route keyed records that another worker owns over the mesh,
//! and fire any due window awakenings. Time is carved into epochs; at
//! each epoch close every worker meets at a barrier (so all records
//! exchanged within the epoch are accounted for on the owning worker)
//! and then snapshots its input cursors and stateful bundles.
//!
//! Once every worker's inputs are exhausted the cluster runs a series
//! of flush rounds, each its own epoch, so window aggregates drain and
//! can still feed stateful steps further down the graph, including
//! ones on other workers.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;

use crate::dataflow::{Dataflow, MapFn, PredicateFn, Step, StreamId};
use crate::errors::{EngineError, Result};
use crate::exchange::{Dedup, Mesh, WireFrame};
use crate::execution::{RunConfig, WorkerCount, WorkerIndex};
use crate::inputs::{build_local_parts, Batcher};
use crate::metrics::Metrics;
use crate::operators::reduce_window::ReduceWindowLogic;
use crate::operators::stateful_map::StatefulMapLogic;
use crate::operators::stateful_unary::StatefulBundle;
use crate::outputs::Sink;
use crate::recovery::model::*;
use crate::recovery::{read_resume_state, RecoveryBundle};
use crate::window::WindowStatefulLogic;

/// How long the worker parks when a loop iteration found no work.
const IDLE_PARK: Duration = Duration::from_millis(1);

/// A dataflow step compiled for this worker.
enum RuntimeStep {
    Input {
        step_id: StepId,
        parts: HashMap<StateKey, Batcher>,
        output: StreamId,
    },
    Map {
        mapper: MapFn,
        output: StreamId,
    },
    Branch {
        predicate: PredicateFn,
        trues: StreamId,
        falses: StreamId,
    },
    Merge {
        output: StreamId,
    },
    Stateful {
        bundle: StatefulBundle,
        output: StreamId,
    },
    Output {
        /// Taken on close so [`Sink::close`] can consume it.
        sink: Option<Box<dyn Sink>>,
    },
}

pub(crate) struct Worker {
    index: WorkerIndex,
    count: WorkerCount,
    mesh: Box<dyn Mesh>,
    metrics: Metrics,
    epoch_interval: Duration,
    barrier_timeout: Duration,
    interrupt: Arc<AtomicBool>,
    recovery: Option<RecoveryBundle>,
    execution: Execution,

    steps: Vec<RuntimeStep>,
    /// Step indexes consuming each stream.
    consumers: HashMap<StreamId, Vec<usize>>,
    /// Step index of each stateful step, for delivering routed
    /// records.
    stateful_steps: HashMap<StepId, usize>,

    /// The currently open epoch.
    epoch: u64,
    /// Next sequence number for records we route out this epoch.
    seq: u64,
    dedup: Dedup,
    /// Records routed to us for epochs we haven't opened yet.
    pending_remote: BTreeMap<u64, Vec<(StepId, StateKey, Value)>>,
    /// Epochs each peer has closed, and whether its inputs were
    /// exhausted as of that close.
    peer_done: HashMap<WorkerIndex, BTreeMap<u64, bool>>,
}

impl Worker {
    pub(crate) fn build(
        flow: &Dataflow,
        mesh: Box<dyn Mesh>,
        config: &RunConfig,
        metrics: Metrics,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self> {
        let index = mesh.index();
        let count = mesh.count();

        let (resume_from, mut resume_state) = match &config.recovery {
            Some(recovery_config) => read_resume_state(recovery_config)?,
            None => (ResumeFrom::default(), FlowStateBytes::new()),
        };
        let ResumeFrom(execution, resume_epoch) = resume_from;

        let mut recovery = config
            .recovery
            .as_ref()
            .map(|recovery_config| RecoveryBundle::build(recovery_config, index))
            .transpose()?;
        if let Some(bundle) = recovery.as_mut() {
            bundle.progress_writer.write(KChange(
                WorkerKey(execution, index),
                Change::Upsert(ProgressMsg::Init(count, resume_epoch)),
            ));
        }

        let mut steps = Vec::with_capacity(flow.steps().len());
        let mut consumers: HashMap<StreamId, Vec<usize>> = HashMap::new();
        let mut stateful_steps = HashMap::new();

        for step in flow.steps() {
            let idx = steps.len();
            match step {
                Step::Input {
                    step_id,
                    input,
                    output,
                } => {
                    let parts = build_local_parts(
                        input.as_ref(),
                        step_id,
                        index,
                        count,
                        resume_state.remove(step_id),
                        config.retry,
                        config.batch_max_len,
                        config.batch_max_wait,
                    )?;
                    steps.push(RuntimeStep::Input {
                        step_id: step_id.clone(),
                        parts,
                        output: *output,
                    });
                }
                Step::Map {
                    upstream,
                    mapper,
                    output,
                    ..
                } => {
                    consumers.entry(*upstream).or_default().push(idx);
                    steps.push(RuntimeStep::Map {
                        mapper: mapper.clone(),
                        output: *output,
                    });
                }
                Step::Branch {
                    upstream,
                    predicate,
                    trues,
                    falses,
                    ..
                } => {
                    consumers.entry(*upstream).or_default().push(idx);
                    steps.push(RuntimeStep::Branch {
                        predicate: predicate.clone(),
                        trues: *trues,
                        falses: *falses,
                    });
                }
                Step::Merge {
                    upstreams, output, ..
                } => {
                    for upstream in upstreams {
                        consumers.entry(*upstream).or_default().push(idx);
                    }
                    steps.push(RuntimeStep::Merge { output: *output });
                }
                Step::StatefulMap {
                    step_id,
                    upstream,
                    builder,
                    mapper,
                    output,
                } => {
                    consumers.entry(*upstream).or_default().push(idx);
                    stateful_steps.insert(step_id.clone(), idx);
                    let bundle = StatefulBundle::new(
                        step_id.clone(),
                        StatefulMapLogic::builder(builder.clone(), mapper.clone()),
                        local_step_state(resume_state.remove(step_id), index, count),
                    )?;
                    steps.push(RuntimeStep::Stateful {
                        bundle,
                        output: *output,
                    });
                }
                Step::ReduceWindow {
                    step_id,
                    upstream,
                    clock,
                    windower,
                    reducer,
                    output,
                } => {
                    consumers.entry(*upstream).or_default().push(idx);
                    stateful_steps.insert(step_id.clone(), idx);
                    let bundle = StatefulBundle::new(
                        step_id.clone(),
                        WindowStatefulLogic::builder(
                            step_id.clone(),
                            clock.clone(),
                            windower.clone(),
                            ReduceWindowLogic::builder(reducer.clone()),
                            metrics.clone(),
                        ),
                        local_step_state(resume_state.remove(step_id), index, count),
                    )?;
                    steps.push(RuntimeStep::Stateful {
                        bundle,
                        output: *output,
                    });
                }
                Step::Output {
                    upstream, output, ..
                } => {
                    consumers.entry(*upstream).or_default().push(idx);
                    steps.push(RuntimeStep::Output {
                        sink: Some(output.build(index, count)?),
                    });
                }
            }
        }

        Ok(Self {
            index,
            count,
            mesh,
            metrics,
            epoch_interval: config.epoch_interval.0,
            barrier_timeout: config.barrier_timeout,
            interrupt,
            recovery,
            execution,
            steps,
            consumers,
            stateful_steps,
            epoch: resume_epoch.0,
            seq: 0,
            dedup: Dedup::new(),
            pending_remote: BTreeMap::new(),
            peer_done: HashMap::new(),
        })
    }

    /// Drive the dataflow to completion.
    pub(crate) fn run(&mut self) -> Result<()> {
        tracing::info!(
            "{:?} of {:?} starting at epoch {}",
            self.index,
            self.count,
            self.epoch
        );

        loop {
            let global_eof = self.run_epoch(false)?;
            if self.interrupt.load(Ordering::Relaxed) {
                tracing::info!("{:?} interrupted; stopping at epoch close", self.index);
                return self.close_sinks();
            }
            if global_eof {
                break;
            }
        }

        // Flush rounds. Draining a stateful step can emit records that
        // feed a later stateful step, possibly on another worker, so
        // we repeat with an epoch barrier between rounds until every
        // chain through the graph has settled. A round settles at
        // least one cross-worker hop and local chains settle within a
        // round, so stateful-step-count + 1 rounds always suffice.
        let rounds = self.stateful_steps.len() + 1;
        for _round in 0..rounds {
            self.drain_bundles()?;
            self.run_epoch(true)?;
        }

        tracing::info!("{:?} done", self.index);
        self.close_sinks()
    }

    /// Run one epoch to its close: barrier, then snapshot.
    ///
    /// Returns whether every worker reported end of input as of this
    /// epoch, which is the (deterministic, cluster-wide) signal to
    /// start flushing.
    fn run_epoch(&mut self, flushing: bool) -> Result<bool> {
        let started = Instant::now();
        let epoch = self.epoch;
        let mut queue = VecDeque::new();

        let eof = loop {
            let mut did_work = false;

            let local_eof = if flushing {
                true
            } else {
                self.pump_inputs(&mut queue)?
            };
            did_work |= !queue.is_empty();
            did_work |= self.pump_mesh(&mut queue)?;
            self.process_queue(&mut queue)?;

            self.awake_due(&mut queue)?;
            self.process_queue(&mut queue)?;

            // At end of input there's no point waiting out the
            // interval; close promptly so flushing can start.
            if flushing || local_eof || started.elapsed() >= self.epoch_interval {
                break local_eof;
            }
            if !did_work {
                thread::park_timeout(self.idle_park());
            }
        };

        // Barrier: every peer must close this epoch before anyone
        // snapshots it, so records exchanged within it have reached
        // the workers that own them. Keep servicing the mesh while we
        // wait; peers may still be routing us records for this epoch.
        self.broadcast(WireFrame::EpochDone { epoch, eof })?;
        let deadline = Instant::now() + self.barrier_timeout;
        while !self.barrier_reached(epoch) {
            let mut barrier_queue = VecDeque::new();
            let did_work = self.pump_mesh(&mut barrier_queue)?;
            self.process_queue(&mut barrier_queue)?;
            if !did_work {
                if Instant::now() >= deadline {
                    return Err(EngineError::PeerUnreachable {
                        peer: self.missing_peer(epoch),
                        epoch,
                    });
                }
                thread::park_timeout(IDLE_PARK);
            }
        }

        let global_eof = eof
            && self.peers().into_iter().all(|peer| {
                self.peer_done
                    .get(&peer)
                    .and_then(|done| done.get(&epoch))
                    .copied()
                    .unwrap_or(false)
            });

        self.snapshot_epoch(epoch)?;

        // Open the next epoch and apply any records peers sent ahead.
        self.dedup.retire(epoch);
        for done in self.peer_done.values_mut() {
            done.retain(|done_epoch, _eof| *done_epoch > epoch);
        }
        self.epoch = epoch + 1;
        self.seq = 0;
        let mut queue = VecDeque::new();
        if let Some(records) = self.pending_remote.remove(&self.epoch) {
            for (step_id, key, value) in records {
                self.deliver_keyed(&step_id, key, value, &mut queue)?;
            }
        }
        self.process_queue(&mut queue)?;

        Ok(global_eof)
    }

    /// Take a batch from each local input partition.
    ///
    /// Returns true once every partition has reached end of input.
    fn pump_inputs(&mut self, queue: &mut VecDeque<(StreamId, Value)>) -> Result<bool> {
        let mut all_eof = true;
        for step in self.steps.iter_mut() {
            if let RuntimeStep::Input { parts, output, .. } = step {
                for batcher in parts.values_mut() {
                    match batcher.next_batch()? {
                        Poll::Ready(Some(items)) => {
                            all_eof = false;
                            for item in items {
                                queue.push_back((*output, item));
                            }
                        }
                        Poll::Ready(None) => {}
                        Poll::Pending => all_eof = false,
                    }
                }
            }
        }
        Ok(all_eof)
    }

    /// Service every frame queued on the mesh.
    fn pump_mesh(&mut self, queue: &mut VecDeque<(StreamId, Value)>) -> Result<bool> {
        let mut did_work = false;
        while let Some((from, frame)) = self.mesh.try_recv()? {
            did_work = true;
            match frame {
                // Handshakes are consumed by the transport; an
                // in-memory mesh can surface them, harmlessly.
                WireFrame::Hello { .. } => {}
                WireFrame::Record {
                    epoch,
                    seq,
                    step_id,
                    key,
                    value,
                } => {
                    let expected = key.route(self.count);
                    if expected != self.index {
                        return Err(EngineError::RoutingMismatch {
                            step_id,
                            key,
                            expected,
                            got: self.index,
                            count: self.count,
                        });
                    }
                    if !self.dedup.admit(from, epoch, seq) {
                        continue;
                    }
                    if epoch > self.epoch {
                        // The sender has already opened an epoch we
                        // haven't; hold the record until we do.
                        self.pending_remote
                            .entry(epoch)
                            .or_default()
                            .push((step_id, key, value));
                    } else {
                        self.deliver_keyed(&step_id, key, value, queue)?;
                    }
                }
                WireFrame::EpochDone { epoch, eof } => {
                    self.peer_done.entry(from).or_default().insert(epoch, eof);
                }
            }
        }
        Ok(did_work)
    }

    /// Feed a routed record to the stateful step that asked for it.
    fn deliver_keyed(
        &mut self,
        step_id: &StepId,
        key: StateKey,
        value: Value,
        queue: &mut VecDeque<(StreamId, Value)>,
    ) -> Result<()> {
        let idx = *self.stateful_steps.get(step_id).ok_or_else(|| {
            EngineError::Config(format!("routed record for unknown step {step_id:?}"))
        })?;
        match &mut self.steps[idx] {
            RuntimeStep::Stateful { bundle, output } => {
                let out = *output;
                for (key, value) in bundle.awake_with(key, Poll::Ready(Some(value)))? {
                    queue.push_back((out, keyed(key, value)));
                }
                Ok(())
            }
            _ => Err(EngineError::Config(format!(
                "routed record for non-stateful step {step_id:?}"
            ))),
        }
    }

    /// Push queued records through their consuming steps until the
    /// queue is empty.
    fn process_queue(&mut self, queue: &mut VecDeque<(StreamId, Value)>) -> Result<()> {
        while let Some((stream, value)) = queue.pop_front() {
            let consumer_idxs = match self.consumers.get(&stream) {
                Some(idxs) => idxs.clone(),
                // A stream nothing consumes; drop its records.
                None => continue,
            };
            for idx in consumer_idxs {
                self.feed_step(idx, &value, queue)?;
            }
        }
        Ok(())
    }

    fn feed_step(
        &mut self,
        idx: usize,
        value: &Value,
        queue: &mut VecDeque<(StreamId, Value)>,
    ) -> Result<()> {
        match &mut self.steps[idx] {
            RuntimeStep::Input { .. } => {}
            RuntimeStep::Map { mapper, output } => {
                queue.push_back((*output, mapper(value.clone())));
            }
            RuntimeStep::Branch {
                predicate,
                trues,
                falses,
            } => {
                let side = if predicate(value) { *trues } else { *falses };
                queue.push_back((side, value.clone()));
            }
            RuntimeStep::Merge { output } => {
                queue.push_back((*output, value.clone()));
            }
            RuntimeStep::Stateful { bundle, output } => {
                let (key, inner) = extract_keyed(bundle.step_id(), value)?;
                let owner = key.route(self.count);
                if owner == self.index {
                    let out = *output;
                    for (key, value) in bundle.awake_with(key, Poll::Ready(Some(inner)))? {
                        queue.push_back((out, keyed(key, value)));
                    }
                } else {
                    let frame = WireFrame::Record {
                        epoch: self.epoch,
                        seq: self.seq,
                        step_id: bundle.step_id().clone(),
                        key,
                        value: inner,
                    };
                    self.seq += 1;
                    self.metrics.inc_routed();
                    self.mesh.send(owner, frame)?;
                }
            }
            RuntimeStep::Output { sink } => {
                if let Some(sink) = sink.as_mut() {
                    sink.write_batch(vec![value.clone()])?;
                }
            }
        }
        Ok(())
    }

    /// How long to park when an iteration found no work: the usual
    /// idle interval, shortened if a stateful key asked to be awoken
    /// sooner.
    fn idle_park(&self) -> Duration {
        let next_awake = self
            .steps
            .iter()
            .filter_map(|step| match step {
                RuntimeStep::Stateful { bundle, .. } => bundle.next_awake(),
                _ => None,
            })
            .min();
        match next_awake {
            Some(at) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(IDLE_PARK),
            None => IDLE_PARK,
        }
    }

    /// Fire any stateful keys whose requested awake time has passed.
    fn awake_due(&mut self, queue: &mut VecDeque<(StreamId, Value)>) -> Result<()> {
        let now = Utc::now();
        for step in self.steps.iter_mut() {
            if let RuntimeStep::Stateful { bundle, output } = step {
                for (key, value) in bundle.awake_due(now)? {
                    queue.push_back((*output, keyed(key, value)));
                }
            }
        }
        Ok(())
    }

    /// Signal end of input to every stateful bundle, in graph order so
    /// drained records flow into bundles further down within the same
    /// round.
    fn drain_bundles(&mut self) -> Result<()> {
        let mut queue = VecDeque::new();
        for idx in 0..self.steps.len() {
            if let RuntimeStep::Stateful { bundle, output } = &mut self.steps[idx] {
                let out = *output;
                for (key, value) in bundle.drain_eof()? {
                    queue.push_back((out, keyed(key, value)));
                }
            }
            self.process_queue(&mut queue)?;
        }
        Ok(())
    }

    /// Persist input cursor positions and stateful bundle snapshots at
    /// the close of an epoch, then advance our frontier past it.
    fn snapshot_epoch(&mut self, epoch: u64) -> Result<()> {
        let Some(recovery) = self.recovery.as_mut() else {
            // Still drain the awoken-key tracking so it doesn't grow
            // without bound.
            for step in self.steps.iter_mut() {
                if let RuntimeStep::Stateful { bundle, .. } = step {
                    bundle.snapshots()?;
                }
            }
            return Ok(());
        };

        for step in self.steps.iter_mut() {
            match step {
                RuntimeStep::Input { step_id, parts, .. } => {
                    for (part, batcher) in parts.iter() {
                        recovery.state_writer.write(KChange(
                            StoreKey(SnapshotEpoch(epoch), FlowKey(step_id.clone(), part.clone())),
                            Change::Upsert(Change::Upsert(batcher.snapshot())),
                        ));
                        self.metrics.inc_snapshots();
                    }
                }
                RuntimeStep::Stateful { bundle, .. } => {
                    for KChange(flow_key, change) in bundle.snapshots()? {
                        recovery.state_writer.write(KChange(
                            StoreKey(SnapshotEpoch(epoch), flow_key),
                            Change::Upsert(change),
                        ));
                        self.metrics.inc_snapshots();
                    }
                }
                _ => {}
            }
        }

        recovery.progress_writer.write(KChange(
            WorkerKey(self.execution, self.index),
            Change::Upsert(ProgressMsg::Advance(WorkerFrontier(epoch + 1))),
        ));
        Ok(())
    }

    fn broadcast(&mut self, frame: WireFrame) -> Result<()> {
        for peer in self.peers() {
            self.mesh.send(peer, frame.clone())?;
        }
        Ok(())
    }

    fn peers(&self) -> Vec<WorkerIndex> {
        (0..self.count.0)
            .map(WorkerIndex)
            .filter(|peer| *peer != self.index)
            .collect()
    }

    fn barrier_reached(&self, epoch: u64) -> bool {
        self.peers().into_iter().all(|peer| {
            self.peer_done
                .get(&peer)
                .map_or(false, |done| done.contains_key(&epoch))
        })
    }

    /// A peer we're still waiting on at the barrier for this epoch.
    fn missing_peer(&self, epoch: u64) -> WorkerIndex {
        self.peers()
            .into_iter()
            .find(|peer| {
                !self
                    .peer_done
                    .get(peer)
                    .map_or(false, |done| done.contains_key(&epoch))
            })
            .unwrap_or(self.index)
    }

    fn close_sinks(&mut self) -> Result<()> {
        for step in self.steps.iter_mut() {
            if let RuntimeStep::Output { sink } = step {
                if let Some(sink) = sink.take() {
                    sink.close()?;
                }
            }
        }
        Ok(())
    }
}

/// Resized clusters move key ownership; keep only the resume state for
/// keys that route here.
fn local_step_state(
    all: StepStateBytes,
    index: WorkerIndex,
    count: WorkerCount,
) -> StepStateBytes {
    let mut local = StepStateBytes::default();
    for (key, snapshot) in all {
        if key.is_local(index, count) {
            local.write(KChange(key, Change::Upsert(snapshot)));
        }
    }
    local
}

fn keyed(key: StateKey, value: Value) -> Value {
    Value::Array(vec![Value::String(key.0), value])
}

fn extract_keyed(step_id: &StepId, value: &Value) -> Result<(StateKey, Value)> {
    if let Some([key, inner]) = value.as_array().map(Vec::as_slice) {
        if let Some(key) = key.as_str() {
            return Ok((StateKey::new(key), inner.clone()));
        }
    }
    Err(EngineError::InvalidKeyedRecord {
        step_id: step_id.clone(),
        got: value.to_string(),
    })
}
