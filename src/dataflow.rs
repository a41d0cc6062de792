//! A dataflow is a directed graph of operator steps.
//!
//! Build one with [`Dataflow::new`], chain steps off the [`StreamId`]
//! handles they return, then hand the flow to one of the entry points
//! in [`crate::execution`].
//!
//! Records are [`serde_json::Value`]s. The stateful steps
//! ([`Dataflow::stateful_map`], [`Dataflow::reduce_window`]) require
//! keyed records: two-element `[key, value]` arrays with a string
//! key. State and processing for each key are independent, and keys
//! are automatically routed to a consistent worker cluster-wide.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::inputs::PartitionedInput;
use crate::operators::Reducer;
use crate::operators::StateBuilder;
use crate::operators::StatefulMapper;
use crate::outputs::Output;
use crate::recovery::model::StepId;
use crate::window::ClockConfig;
use crate::window::WindowConfig;

/// Transforms one record into another.
pub type MapFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Decides which side of a [`Dataflow::branch`] a record goes to.
pub type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Handle to one edge in the operator graph.
///
/// Using a handle after another step has consumed it is fine; a
/// stream can feed any number of downstream steps and each sees every
/// record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) usize);

pub(crate) enum Step {
    Input {
        step_id: StepId,
        input: Arc<dyn PartitionedInput>,
        output: StreamId,
    },
    Map {
        step_id: StepId,
        upstream: StreamId,
        mapper: MapFn,
        output: StreamId,
    },
    Branch {
        step_id: StepId,
        upstream: StreamId,
        predicate: PredicateFn,
        trues: StreamId,
        falses: StreamId,
    },
    Merge {
        step_id: StepId,
        upstreams: Vec<StreamId>,
        output: StreamId,
    },
    StatefulMap {
        step_id: StepId,
        upstream: StreamId,
        builder: StateBuilder,
        mapper: StatefulMapper,
        output: StreamId,
    },
    ReduceWindow {
        step_id: StepId,
        upstream: StreamId,
        clock: ClockConfig,
        windower: WindowConfig,
        reducer: Reducer,
        output: StreamId,
    },
    Output {
        step_id: StepId,
        upstream: StreamId,
        output: Arc<dyn Output>,
    },
}

impl Step {
    pub(crate) fn step_id(&self) -> &StepId {
        match self {
            Step::Input { step_id, .. }
            | Step::Map { step_id, .. }
            | Step::Branch { step_id, .. }
            | Step::Merge { step_id, .. }
            | Step::StatefulMap { step_id, .. }
            | Step::ReduceWindow { step_id, .. }
            | Step::Output { step_id, .. } => step_id,
        }
    }
}

impl Clone for Step {
    fn clone(&self) -> Self {
        match self {
            Step::Input {
                step_id,
                input,
                output,
            } => Step::Input {
                step_id: step_id.clone(),
                input: input.clone(),
                output: *output,
            },
            Step::Map {
                step_id,
                upstream,
                mapper,
                output,
            } => Step::Map {
                step_id: step_id.clone(),
                upstream: *upstream,
                mapper: mapper.clone(),
                output: *output,
            },
            Step::Branch {
                step_id,
                upstream,
                predicate,
                trues,
                falses,
            } => Step::Branch {
                step_id: step_id.clone(),
                upstream: *upstream,
                predicate: predicate.clone(),
                trues: *trues,
                falses: *falses,
            },
            Step::Merge {
                step_id,
                upstreams,
                output,
            } => Step::Merge {
                step_id: step_id.clone(),
                upstreams: upstreams.clone(),
                output: *output,
            },
            Step::StatefulMap {
                step_id,
                upstream,
                builder,
                mapper,
                output,
            } => Step::StatefulMap {
                step_id: step_id.clone(),
                upstream: *upstream,
                builder: builder.clone(),
                mapper: mapper.clone(),
                output: *output,
            },
            Step::ReduceWindow {
                step_id,
                upstream,
                clock,
                windower,
                reducer,
                output,
            } => Step::ReduceWindow {
                step_id: step_id.clone(),
                upstream: *upstream,
                clock: clock.clone(),
                windower: windower.clone(),
                reducer: reducer.clone(),
                output: *output,
            },
            Step::Output {
                step_id,
                upstream,
                output,
            } => Step::Output {
                step_id: step_id.clone(),
                upstream: *upstream,
                output: output.clone(),
            },
        }
    }
}

#[derive(Clone, Default)]
pub struct Dataflow {
    steps: Vec<Step>,
    next_stream: usize,
    step_ids: HashSet<StepId>,
}

impl Dataflow {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_stream(&mut self) -> StreamId {
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        id
    }

    fn register_step_id(&mut self, step_id: &str) -> StepId {
        let step_id = StepId::new(step_id);
        assert!(
            self.step_ids.insert(step_id.clone()),
            "duplicate step id {step_id:?}; step ids must be unique within a dataflow \
             since they key recovery state"
        );
        step_id
    }

    /// Read records from a partitioned input.
    ///
    /// Each partition's read position is snapshotted with the rest of
    /// the dataflow state, so on resume no already-processed batch is
    /// read again.
    pub fn input(&mut self, step_id: &str, input: impl PartitionedInput + 'static) -> StreamId {
        let step_id = self.register_step_id(step_id);
        let output = self.new_stream();
        self.steps.push(Step::Input {
            step_id,
            input: Arc::new(input),
            output,
        });
        output
    }

    /// Transform each record one-to-one.
    pub fn map(&mut self, step_id: &str, upstream: StreamId, mapper: MapFn) -> StreamId {
        let step_id = self.register_step_id(step_id);
        let output = self.new_stream();
        self.steps.push(Step::Map {
            step_id,
            upstream,
            mapper,
            output,
        });
        output
    }

    /// Split a stream in two on a predicate.
    ///
    /// Returns the `(trues, falses)` streams. Every record goes to
    /// exactly one side.
    pub fn branch(
        &mut self,
        step_id: &str,
        upstream: StreamId,
        predicate: PredicateFn,
    ) -> (StreamId, StreamId) {
        let step_id = self.register_step_id(step_id);
        let trues = self.new_stream();
        let falses = self.new_stream();
        self.steps.push(Step::Branch {
            step_id,
            upstream,
            predicate,
            trues,
            falses,
        });
        (trues, falses)
    }

    /// Combine multiple streams into one.
    ///
    /// No ordering is guaranteed between records from different
    /// upstreams.
    pub fn merge(&mut self, step_id: &str, upstreams: Vec<StreamId>) -> StreamId {
        let step_id = self.register_step_id(step_id);
        let output = self.new_stream();
        self.steps.push(Step::Merge {
            step_id,
            upstreams,
            output,
        });
        output
    }

    /// Map incoming `[key, value]` records, having access to
    /// persistent state for each key.
    ///
    /// `builder` makes the initial state the first time a key is
    /// seen; `mapper` gets the state and the incoming value and
    /// returns the updated state ([`None`] discards the key's state)
    /// and the value to emit ([`None`] emits nothing for this
    /// record). Output is re-paired with the key.
    pub fn stateful_map(
        &mut self,
        step_id: &str,
        upstream: StreamId,
        builder: StateBuilder,
        mapper: StatefulMapper,
    ) -> StreamId {
        let step_id = self.register_step_id(step_id);
        let output = self.new_stream();
        self.steps.push(Step::StatefulMap {
            step_id,
            upstream,
            builder,
            mapper,
            output,
        });
        output
    }

    /// Combine `[key, value]` records within a window into an
    /// accumulator; emit exactly one `[key, accumulator]` record when
    /// the window closes.
    ///
    /// Records behind the watermark are dropped and counted, never
    /// silently reassigned to a later window.
    pub fn reduce_window(
        &mut self,
        step_id: &str,
        upstream: StreamId,
        clock: ClockConfig,
        windower: WindowConfig,
        reducer: Reducer,
    ) -> StreamId {
        let step_id = self.register_step_id(step_id);
        let output = self.new_stream();
        self.steps.push(Step::ReduceWindow {
            step_id,
            upstream,
            clock,
            windower,
            reducer,
            output,
        });
        output
    }

    /// Write records to an output.
    pub fn output(&mut self, step_id: &str, upstream: StreamId, output: impl Output + 'static) {
        let step_id = self.register_step_id(step_id);
        self.steps.push(Step::Output {
            step_id,
            upstream,
            output: Arc::new(output),
        });
    }

    pub(crate) fn steps(&self) -> &[Step] {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result;
    use crate::inputs::SourceCursor;
    use crate::recovery::model::{StateBytes, StateKey};

    struct NoInput;

    impl PartitionedInput for NoInput {
        fn list_parts(&self) -> Vec<StateKey> {
            vec![]
        }

        fn build_part(
            &self,
            _part: &StateKey,
            _resume_snapshot: Option<StateBytes>,
        ) -> Result<Box<dyn SourceCursor>> {
            unreachable!("no partitions to build")
        }
    }

    #[test]
    fn streams_get_distinct_ids() {
        let mut flow = Dataflow::new();
        let inp = flow.input("inp", NoInput);
        let (evens, odds) = flow.branch(
            "fork",
            inp,
            Arc::new(|value| value.as_i64().unwrap() % 2 == 0),
        );
        let merged = flow.merge("join", vec![evens, odds]);

        let mut seen = HashSet::new();
        for id in [inp, evens, odds, merged] {
            assert!(seen.insert(id));
        }
    }

    #[test]
    #[should_panic(expected = "duplicate step id")]
    fn duplicate_step_ids_panic() {
        let mut flow = Dataflow::new();
        flow.input("inp", NoInput);
        flow.input("inp", NoInput);
    }
}
