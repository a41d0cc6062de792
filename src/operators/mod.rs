//! Stateful step implementations.
//!
//! [`stateful_unary`] holds the generic per-key state machinery; the
//! other modules implement the user-facing steps on top of it.

use std::sync::Arc;

use serde_json::Value;

pub(crate) mod reduce_window;
pub(crate) mod stateful_map;
pub(crate) mod stateful_unary;

/// Builds the initial state for a key in
/// [`crate::dataflow::Dataflow::stateful_map`].
pub type StateBuilder = Arc<dyn Fn() -> Value + Send + Sync>;

/// Combines state and an incoming value in
/// [`crate::dataflow::Dataflow::stateful_map`].
///
/// Returns the updated state (or [`None`] to discard all state for
/// the key) and the value to emit downstream ([`None`] emits
/// nothing).
pub type StatefulMapper =
    Arc<dyn Fn(Value, Value) -> (Option<Value>, Option<Value>) + Send + Sync>;

/// Combines two values within a window in
/// [`crate::dataflow::Dataflow::reduce_window`].
pub type Reducer = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;
