//! Internal code for windowing.
//!
//! Architecture
//! ------------
//!
//! Windowing is based around two core traits and one bridge type:
//! [`Clock`], [`Windower`], and [`WindowStatefulLogic`].
//!
//! Window-emitting steps like
//! [`crate::dataflow::Dataflow::reduce_window`] are built by
//! implementing [`WindowLogic`] and wrapping it in
//! [`WindowStatefulLogic`], so the window management code is written
//! once.
//!
//! [`WindowStatefulLogic`] itself implements
//! [`crate::operators::stateful_unary::StatefulLogic`], which is the
//! abstraction the recovery system understands. We get recovery for
//! "free" as long as we play by the rules of that trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::task::Poll;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::errors::Result;
use crate::metrics::Metrics;
use crate::operators::stateful_unary::LogicBuilder;
use crate::operators::stateful_unary::LogicFate;
use crate::operators::stateful_unary::StatefulLogic;
use crate::recovery::model::StateBytes;
use crate::recovery::model::StepId;

pub(crate) mod event_time_clock;
pub(crate) mod system_clock;
pub(crate) mod tumbling_window;

use self::event_time_clock::EventClock;
use self::system_clock::SystemClock;
use self::tumbling_window::TumblingWindower;

/// Extracts an event time from a record.
pub type TimeGetter = Arc<dyn Fn(&Value) -> DateTime<Utc> + Send + Sync>;

/// Describes the sense of time a windowing step should use.
#[derive(Clone)]
pub enum ClockConfig {
    /// Use the system time a record is processed at. Once input ends,
    /// all windows close immediately.
    System,
    /// Use timestamps carried in the records themselves.
    Event {
        /// How to pull the timestamp out of a record.
        dt_getter: TimeGetter,
        /// How much system time to wait for out-of-order records
        /// before considering them late.
        wait_for_system_duration: Duration,
    },
}

pub(crate) type ClockBuilder =
    Box<dyn Fn(Option<StateBytes>) -> Result<Box<dyn Clock>> + Send>;

impl ClockConfig {
    pub(crate) fn builder(self) -> ClockBuilder {
        match self {
            Self::System => Box::new(|_resume_snapshot| Ok(Box::new(SystemClock {}))),
            Self::Event {
                dt_getter,
                wait_for_system_duration,
            } => Box::new(move |resume_snapshot| {
                Ok(Box::new(EventClock::new(
                    dt_getter.clone(),
                    wait_for_system_duration,
                    resume_snapshot,
                )?))
            }),
        }
    }
}

/// Defines the sense of time for a windowing step.
pub(crate) trait Clock {
    /// Return the current time of the stream.
    ///
    /// There should be no more items with times before the
    /// watermark. If there unexpectedly is, those items are dropped
    /// as late.
    ///
    /// This will be called with each value in arrival order, but also
    /// might be called between values and should use internal state
    /// to still return the watermark.
    fn watermark(&mut self, next_value: &Poll<Option<Value>>) -> DateTime<Utc>;

    /// Get the time for an item.
    ///
    /// This can mutate internal state if noting that an item has
    /// arrived should advance the clock.
    fn time_for(&mut self, value: &Value) -> DateTime<Utc>;

    /// Snapshot the internal state of this clock.
    fn snapshot(&self) -> Result<StateBytes>;
}

/// Describes the type of windows you would like.
#[derive(Debug, Clone)]
pub enum WindowConfig {
    /// Tumbling windows of fixed length which cover all time and do
    /// not overlap. Each item falls in exactly one window.
    ///
    /// Window start times are inclusive, but end times are exclusive.
    Tumbling {
        /// Length of each window.
        length: Duration,
        /// Align windows so this instant starts a window. You can use
        /// this to align all windows to hour boundaries, e.g.
        align_to: DateTime<Utc>,
    },
}

pub(crate) type WindowerBuilder =
    Box<dyn Fn(Option<StateBytes>) -> Result<Box<dyn Windower>> + Send>;

impl WindowConfig {
    pub(crate) fn builder(self) -> WindowerBuilder {
        match self {
            Self::Tumbling { length, align_to } => Box::new(move |resume_snapshot| {
                Ok(Box::new(TumblingWindower::new(
                    length,
                    align_to,
                    resume_snapshot,
                )?))
            }),
        }
    }
}

/// Unique ID for a window coming from a single [`Windower`] impl.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) struct WindowKey(pub(crate) i64);

/// An error that can occur when windowing an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InsertError {
    /// The inserted item was late for a window.
    Late(WindowKey),
}

/// Defines a kind of time-based windower.
///
/// This should keep internal state of which windows are open and
/// accepting values.
///
/// A separate instance of this is created for each key in the keyed
/// stream. There is no way to interact across keys.
pub(crate) trait Windower {
    /// Attempt to insert an incoming value into a window, creating it
    /// if necessary.
    ///
    /// If the current item is "late" for all windows, return
    /// [`InsertError::Late`].
    fn insert(
        &mut self,
        watermark: &DateTime<Utc>,
        item_time: &DateTime<Utc>,
    ) -> Vec<std::result::Result<WindowKey, InsertError>>;

    /// Look at the current watermark, determine which windows are now
    /// closed, return them, and remove them from internal state.
    ///
    /// A window closes as soon as the watermark reaches its end time.
    fn drain_closed(&mut self, watermark: &DateTime<Utc>) -> Vec<WindowKey>;

    /// Is this windower currently tracking any windows?
    fn is_empty(&self) -> bool;

    /// Return the system time estimate of the next window close, if
    /// any.
    fn next_close(&self) -> Option<DateTime<Utc>>;

    /// Snapshot the internal state of this windower.
    fn snapshot(&self) -> Result<StateBytes>;
}

/// Impl this trait to create a windowing step.
///
/// A separate instance of this will be created for each window a
/// [`Windower`] creates. There is no way to interact across windows
/// or keys.
pub(crate) trait WindowLogic {
    /// Logic to run when this window sees a new value.
    ///
    /// `next_value` has the same semantics as
    /// [`std::iter::Iterator::next`]: an incoming value or [`None`]
    /// if the window for this key has just closed.
    ///
    /// This must return any values to be emitted downstream. You
    /// probably only want to emit values when `next_value` is
    /// [`None`], signaling the window has closed. They will be
    /// automatically paired with the key in the output stream.
    fn with_next(&mut self, next_value: Option<(Value, DateTime<Utc>)>) -> Vec<Value>;

    /// Snapshot the internal state of this logic.
    fn snapshot(&self) -> Result<StateBytes>;
}

pub(crate) type WindowLogicBuilder =
    Arc<dyn Fn(Option<StateBytes>) -> Result<Box<dyn WindowLogic>> + Send + Sync>;

/// Implements [`StatefulLogic`] in terms of [`WindowLogic`], bridging
/// the gap between a windowing step and the underlying stateful
/// machinery.
pub(crate) struct WindowStatefulLogic {
    step_id: StepId,
    clock: Box<dyn Clock>,
    windower: Box<dyn Windower>,
    current_state: HashMap<WindowKey, Box<dyn WindowLogic>>,
    logic_builder: WindowLogicBuilder,
    metrics: Metrics,
}

impl WindowStatefulLogic {
    pub(crate) fn builder(
        step_id: StepId,
        clock_config: ClockConfig,
        window_config: WindowConfig,
        logic_builder: WindowLogicBuilder,
        metrics: Metrics,
    ) -> LogicBuilder {
        let clock_builder = clock_config.builder();
        let windower_builder = window_config.builder();

        Box::new(move |resume_snapshot| {
            let (clock_snapshot, windower_snapshot, logic_snapshots) = match resume_snapshot {
                Some(snapshot) => {
                    let (clock, windower, logic): (
                        StateBytes,
                        StateBytes,
                        Vec<(WindowKey, StateBytes)>,
                    ) = snapshot.de()?;
                    (Some(clock), Some(windower), logic)
                }
                None => (None, None, Vec::new()),
            };

            let clock = clock_builder(clock_snapshot)?;
            let windower = windower_builder(windower_snapshot)?;
            let current_state = logic_snapshots
                .into_iter()
                .map(|(window_key, snapshot)| {
                    Ok((window_key, (logic_builder)(Some(snapshot))?))
                })
                .collect::<Result<HashMap<_, _>>>()?;

            Ok(Box::new(Self {
                step_id: step_id.clone(),
                clock,
                windower,
                current_state,
                logic_builder: logic_builder.clone(),
                metrics: metrics.clone(),
            }))
        })
    }
}

impl StatefulLogic for WindowStatefulLogic {
    fn on_awake(&mut self, next_value: Poll<Option<Value>>) -> Result<Vec<Value>> {
        let mut output = Vec::new();

        let watermark = self.clock.watermark(&next_value);
        tracing::trace!("Watermark at {watermark:?}");

        if let Poll::Ready(Some(value)) = next_value {
            let item_time = self.clock.time_for(&value);

            for window_result in self.windower.insert(&watermark, &item_time) {
                match window_result {
                    Err(InsertError::Late(window_key)) => {
                        tracing::debug!(
                            step_id = %self.step_id,
                            "Dropping {value:?} late for {window_key:?}"
                        );
                        self.metrics.inc_dropped_late(&self.step_id);
                    }
                    Ok(window_key) => {
                        let logic = match self.current_state.entry(window_key) {
                            std::collections::hash_map::Entry::Occupied(entry) => {
                                entry.into_mut()
                            }
                            std::collections::hash_map::Entry::Vacant(entry) => {
                                entry.insert((self.logic_builder)(None)?)
                            }
                        };
                        output.extend(logic.with_next(Some((value.clone(), item_time))));
                    }
                }
            }
        }

        for closed_window in self.windower.drain_closed(&watermark) {
            let mut logic = self
                .current_state
                .remove(&closed_window)
                .expect("No logic for closed window");
            output.extend(logic.with_next(None));
        }

        Ok(output)
    }

    fn fate(&self) -> LogicFate {
        if self.windower.is_empty() {
            LogicFate::Discard
        } else {
            LogicFate::Retain
        }
    }

    fn next_awake(&self) -> Option<DateTime<Utc>> {
        self.windower.next_close()
    }

    fn snapshot(&self) -> Result<StateBytes> {
        let logic_snapshots = self
            .current_state
            .iter()
            .map(|(window_key, logic)| Ok((*window_key, logic.snapshot()?)))
            .collect::<Result<Vec<_>>>()?;
        StateBytes::ser(&(
            self.clock.snapshot()?,
            self.windower.snapshot()?,
            logic_snapshots,
        ))
    }
}
