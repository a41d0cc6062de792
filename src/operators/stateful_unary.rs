//! The most primitive stateful machinery for non-input steps.
//!
//! To derive a new stateful step, create a new [`StatefulLogic`] impl
//! and wrap a builder of it in a [`StatefulBundle`]. If you fulfil the
//! API of [`StatefulLogic`], you get recovery behavior for free.
//!
//! The general idea is that you pass a **logic builder** which takes
//! any previous state snapshot from the last execution and builds an
//! instance of your logic. Then your logic is **snapshotted** at the
//! end of each epoch, and that state durably saved in the recovery
//! store.

use std::collections::HashMap;
use std::collections::HashSet;
use std::task::Poll;

use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;

use crate::errors::Result;
use crate::recovery::model::*;

/// If a [`StatefulLogic`] for a key should be retained by its
/// [`StatefulBundle`].
///
/// See [`StatefulLogic::fate`].
pub(crate) enum LogicFate {
    /// This logic for this key should be retained and used again
    /// whenever new data for this key comes in.
    Retain,
    /// The logic for this key is "complete" and should be
    /// discarded. It will be built again if the key is encountered
    /// again.
    Discard,
}

/// Impl this trait to create a step which maintains recoverable
/// per-key state.
///
/// A separate instance of this will be created for each key in the
/// input stream. There is no way to interact across keys.
pub(crate) trait StatefulLogic {
    /// Logic to run when this step is awoken for a key.
    ///
    /// `next_value` has the same semantics as
    /// [`std::async_iter::AsyncIterator::poll_next`]:
    ///
    /// - [`Poll::Pending`]: no new values ready yet. We were probably
    ///   awoken because of a timeout.
    ///
    /// - [`Poll::Ready`] with a [`Some`]: a new value has arrived.
    ///
    /// - [`Poll::Ready`] with a [`None`]: the stream has ended and
    ///   logic will not be called again.
    ///
    /// This must return values to be emitted downstream.
    fn on_awake(&mut self, next_value: Poll<Option<Value>>) -> Result<Vec<Value>>;

    /// Called after each awakening to decide if the logic for this
    /// key is still relevant.
    ///
    /// Since the bundle owns this logic, we need a way to communicate
    /// back up whether it should be retained.
    fn fate(&self) -> LogicFate;

    /// Return the next system time this logic should be awoken at,
    /// if any.
    ///
    /// Any previously recorded awake times are forgotten after each
    /// call. The logic internally needs to keep track of multiple
    /// awake times (if it needs that) and keep returning the next
    /// one.
    fn next_awake(&self) -> Option<DateTime<Utc>>;

    /// Snapshot the internal state of this logic.
    ///
    /// Serialize any and all state necessary to re-construct the
    /// logic exactly how it currently is in the bundle's
    /// `logic_builder`. This will be called at the end of each epoch.
    fn snapshot(&self) -> Result<StateBytes>;
}

pub(crate) type LogicBuilder =
    Box<dyn Fn(Option<StateBytes>) -> Result<Box<dyn StatefulLogic>> + Send>;

/// All per-key logic instances for one stateful step on one worker.
///
/// The worker loop drives this: [`awake_with`](Self::awake_with) for
/// each incoming keyed value, [`awake_due`](Self::awake_due) each
/// iteration so timeout-based logic fires, and
/// [`snapshots`](Self::snapshots) at each epoch close.
///
/// Only keys awoken since the last snapshot are snapshotted again;
/// untouched keys can't have changed state.
pub(crate) struct StatefulBundle {
    step_id: StepId,
    logic_builder: LogicBuilder,
    /// Logic for each key. There is only a single logic for each key
    /// representing the state at the current epoch; the worker only
    /// feeds us values in epoch order.
    current_logic: HashMap<StateKey, Box<dyn StatefulLogic>>,
    /// Next awaken timestamp for each key, if requested.
    current_next_awake: HashMap<StateKey, DateTime<Utc>>,
    /// Keys awoken since the last snapshot. Drained by
    /// [`snapshots`](Self::snapshots).
    awoken_keys: HashSet<StateKey>,
}

impl StatefulBundle {
    pub(crate) fn new(
        step_id: StepId,
        logic_builder: LogicBuilder,
        resume_state: StepStateBytes,
    ) -> Result<Self> {
        let mut current_logic = HashMap::new();
        let mut current_next_awake = HashMap::new();

        for (key, snapshot) in resume_state {
            let (logic_snapshot, next_awake): (StateBytes, Option<DateTime<Utc>>) =
                snapshot.de()?;
            current_logic.insert(key.clone(), (logic_builder)(Some(logic_snapshot))?);
            if let Some(next_awake) = next_awake {
                current_next_awake.insert(key, next_awake);
            }
        }

        Ok(Self {
            step_id,
            logic_builder,
            current_logic,
            current_next_awake,
            awoken_keys: HashSet::new(),
        })
    }

    pub(crate) fn step_id(&self) -> &StepId {
        &self.step_id
    }

    /// Run the logic for one key, building it if this is a new key.
    ///
    /// Returns the values to emit downstream, re-paired with the key.
    pub(crate) fn awake_with(
        &mut self,
        key: StateKey,
        next_value: Poll<Option<Value>>,
    ) -> Result<Vec<(StateKey, Value)>> {
        let mut logic = match self.current_logic.remove(&key) {
            Some(logic) => logic,
            None => (self.logic_builder)(None)?,
        };
        let output = logic.on_awake(next_value)?;

        match logic.fate() {
            LogicFate::Discard => {
                // Any pending awake time is part of the state.
                self.current_next_awake.remove(&key);
                // Do not re-insert the logic. It'll be dropped.
            }
            LogicFate::Retain => {
                if let Some(next_awake) = logic.next_awake() {
                    self.current_next_awake.insert(key.clone(), next_awake);
                } else {
                    self.current_next_awake.remove(&key);
                }
                self.current_logic.insert(key.clone(), logic);
            }
        }
        self.awoken_keys.insert(key.clone());

        Ok(output
            .into_iter()
            .map(|value| (key.clone(), value))
            .collect())
    }

    /// Wake up any keys that are past their requested awakening time.
    pub(crate) fn awake_due(&mut self, now: DateTime<Utc>) -> Result<Vec<(StateKey, Value)>> {
        let due_keys: Vec<StateKey> = self
            .current_next_awake
            .iter()
            .filter(|(_key, next_awake)| **next_awake <= now)
            .map(|(key, _next_awake)| key.clone())
            .collect();

        let mut output = Vec::new();
        for key in due_keys {
            output.extend(self.awake_with(key, Poll::Pending)?);
        }
        Ok(output)
    }

    /// Signal all retained keys that the stream has ended.
    ///
    /// Called once after all input is exhausted so window-style logic
    /// can flush.
    pub(crate) fn drain_eof(&mut self) -> Result<Vec<(StateKey, Value)>> {
        let keys: HashSet<StateKey> = self
            .current_logic
            .keys()
            .chain(self.current_next_awake.keys())
            .cloned()
            .collect();

        let mut output = Vec::new();
        for key in keys {
            output.extend(self.awake_with(key, Poll::Ready(None))?);
        }
        Ok(output)
    }

    /// The soonest requested awake time across all keys, used by the
    /// worker to bound how long it parks between activations.
    pub(crate) fn next_awake(&self) -> Option<DateTime<Utc>> {
        self.current_next_awake.values().min().cloned()
    }

    /// Snapshot every key awoken since the last call.
    ///
    /// A key whose logic was discarded produces a [`Change::Discard`]
    /// so resume won't rebuild it.
    pub(crate) fn snapshots(&mut self) -> Result<Vec<FlowChange>> {
        let mut changes = Vec::with_capacity(self.awoken_keys.len());
        for key in self.awoken_keys.drain() {
            let change = if let Some(logic) = self.current_logic.get(&key) {
                let state = (logic.snapshot()?, self.current_next_awake.get(&key).cloned());
                Change::Upsert(StateBytes::ser(&state)?)
            } else {
                Change::Discard
            };
            changes.push(KChange(FlowKey(self.step_id.clone(), key), change));
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sums incoming numbers; emits and discards itself when it sees
    /// a value of 0.
    struct RunningSum {
        total: i64,
        done: bool,
    }

    fn sum_builder() -> LogicBuilder {
        Box::new(|resume_snapshot| {
            let total = resume_snapshot.map(StateBytes::de::<i64>).transpose()?;
            Ok(Box::new(RunningSum {
                total: total.unwrap_or(0),
                done: false,
            }))
        })
    }

    impl StatefulLogic for RunningSum {
        fn on_awake(&mut self, next_value: Poll<Option<Value>>) -> Result<Vec<Value>> {
            if let Poll::Ready(Some(value)) = next_value {
                let n = value.as_i64().unwrap();
                if n == 0 {
                    self.done = true;
                    return Ok(vec![Value::from(self.total)]);
                }
                self.total += n;
            }
            Ok(vec![])
        }

        fn fate(&self) -> LogicFate {
            if self.done {
                LogicFate::Discard
            } else {
                LogicFate::Retain
            }
        }

        fn next_awake(&self) -> Option<DateTime<Utc>> {
            None
        }

        fn snapshot(&self) -> Result<StateBytes> {
            StateBytes::ser(&self.total)
        }
    }

    /// Schedules an awake at the datetime carried by each value.
    struct Alarm {
        at: Option<DateTime<Utc>>,
    }

    fn alarm_builder() -> LogicBuilder {
        Box::new(|resume_snapshot| {
            let at = resume_snapshot
                .map(StateBytes::de::<Option<DateTime<Utc>>>)
                .transpose()?
                .flatten();
            Ok(Box::new(Alarm { at }))
        })
    }

    impl StatefulLogic for Alarm {
        fn on_awake(&mut self, next_value: Poll<Option<Value>>) -> Result<Vec<Value>> {
            if let Poll::Ready(Some(value)) = next_value {
                self.at = value.as_str().and_then(|at| at.parse().ok());
            }
            Ok(vec![])
        }

        fn fate(&self) -> LogicFate {
            LogicFate::Retain
        }

        fn next_awake(&self) -> Option<DateTime<Utc>> {
            self.at
        }

        fn snapshot(&self) -> Result<StateBytes> {
            StateBytes::ser(&self.at)
        }
    }

    #[test]
    fn next_awake_reports_the_soonest_key() {
        let mut bundle =
            StatefulBundle::new(StepId::new("alarm"), alarm_builder(), Default::default())
                .unwrap();
        assert_eq!(bundle.next_awake(), None);

        let soon = Utc::now() + chrono::Duration::seconds(5);
        let later = soon + chrono::Duration::minutes(1);
        bundle
            .awake_with(
                StateKey::new("later"),
                Poll::Ready(Some(Value::from(later.to_rfc3339()))),
            )
            .unwrap();
        bundle
            .awake_with(
                StateKey::new("soon"),
                Poll::Ready(Some(Value::from(soon.to_rfc3339()))),
            )
            .unwrap();

        assert_eq!(bundle.next_awake(), Some(soon));
    }

    #[test]
    fn keys_are_isolated() {
        let mut bundle =
            StatefulBundle::new(StepId::new("sum"), sum_builder(), Default::default()).unwrap();

        let a = StateKey::new("a");
        let b = StateKey::new("b");
        bundle
            .awake_with(a.clone(), Poll::Ready(Some(Value::from(1))))
            .unwrap();
        bundle
            .awake_with(b.clone(), Poll::Ready(Some(Value::from(10))))
            .unwrap();
        bundle
            .awake_with(a.clone(), Poll::Ready(Some(Value::from(2))))
            .unwrap();

        let out = bundle
            .awake_with(a.clone(), Poll::Ready(Some(Value::from(0))))
            .unwrap();
        assert_eq!(out, vec![(a, Value::from(3))]);
        let out = bundle
            .awake_with(b.clone(), Poll::Ready(Some(Value::from(0))))
            .unwrap();
        assert_eq!(out, vec![(b, Value::from(10))]);
    }

    #[test]
    fn discarded_logic_snapshots_as_discard() {
        let mut bundle =
            StatefulBundle::new(StepId::new("sum"), sum_builder(), Default::default()).unwrap();

        let a = StateKey::new("a");
        bundle
            .awake_with(a.clone(), Poll::Ready(Some(Value::from(0))))
            .unwrap();

        let changes = bundle.snapshots().unwrap();
        assert_eq!(
            changes,
            vec![KChange(
                FlowKey(StepId::new("sum"), a),
                Change::Discard
            )]
        );
        // Drained; nothing new to snapshot.
        assert!(bundle.snapshots().unwrap().is_empty());
    }

    #[test]
    fn resume_rebuilds_state() {
        let step_id = StepId::new("sum");
        let a = StateKey::new("a");

        let mut bundle =
            StatefulBundle::new(step_id.clone(), sum_builder(), Default::default()).unwrap();
        bundle
            .awake_with(a.clone(), Poll::Ready(Some(Value::from(5))))
            .unwrap();
        let changes = bundle.snapshots().unwrap();

        let mut resume_state = StepStateBytes::default();
        for KChange(FlowKey(_step, key), change) in changes {
            resume_state.write(KChange(key, change));
        }

        let mut resumed = StatefulBundle::new(step_id, sum_builder(), resume_state).unwrap();
        let out = resumed
            .awake_with(a.clone(), Poll::Ready(Some(Value::from(0))))
            .unwrap();
        assert_eq!(out, vec![(a, Value::from(5))]);
    }
}
