//! Implements the stateful map step.
//!
//! Map incoming values, having access to persistent state for each
//! key.

use std::task::Poll;

use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;

use crate::errors::Result;
use crate::recovery::model::StateBytes;

use super::stateful_unary::LogicBuilder;
use super::stateful_unary::LogicFate;
use super::stateful_unary::StatefulLogic;
use super::StateBuilder;
use super::StatefulMapper;

pub(crate) struct StatefulMapLogic {
    builder: StateBuilder,
    mapper: StatefulMapper,
    state: Option<Value>,
}

impl StatefulMapLogic {
    /// Returns a builder that can reverse [`StatefulLogic::snapshot`].
    pub(crate) fn builder(builder: StateBuilder, mapper: StatefulMapper) -> LogicBuilder {
        Box::new(move |resume_snapshot| {
            let state = match resume_snapshot {
                Some(snapshot) => snapshot.de::<Option<Value>>()?,
                None => Some((builder)()),
            };
            Ok(Box::new(Self {
                builder: builder.clone(),
                mapper: mapper.clone(),
                state,
            }))
        })
    }
}

impl StatefulLogic for StatefulMapLogic {
    fn on_awake(&mut self, next_value: Poll<Option<Value>>) -> Result<Vec<Value>> {
        if let Poll::Ready(Some(value)) = next_value {
            let state = self
                .state
                .take()
                .unwrap_or_else(|| (self.builder)());
            let (updated_state, updated_value) = (self.mapper)(state, value);
            tracing::trace!(
                "stateful_map: -> (updated_state={updated_state:?}, \
                 updated_value={updated_value:?})"
            );
            self.state = updated_state;
            Ok(updated_value.into_iter().collect())
        } else {
            Ok(vec![])
        }
    }

    fn fate(&self) -> LogicFate {
        // A mapper returning no updated state asked for this key to
        // be forgotten.
        if self.state.is_some() {
            LogicFate::Retain
        } else {
            LogicFate::Discard
        }
    }

    fn next_awake(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn snapshot(&self) -> Result<StateBytes> {
        StateBytes::ser::<Option<Value>>(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn keep_max_builder() -> LogicBuilder {
        let builder: StateBuilder = Arc::new(|| Value::Null);
        let mapper: StatefulMapper = Arc::new(|state, value| {
            let max = match state.as_i64() {
                None => value.as_i64().unwrap(),
                Some(prev) => prev.max(value.as_i64().unwrap()),
            };
            (Some(json!(max)), Some(json!(max)))
        });
        StatefulMapLogic::builder(builder, mapper)
    }

    #[test]
    fn emitted_values_are_monotonic() {
        let mut logic = keep_max_builder()(None).unwrap();

        let mut emitted = Vec::new();
        for n in [3, 1, 4, 1, 5, 2] {
            emitted.extend(logic.on_awake(Poll::Ready(Some(json!(n)))).unwrap());
        }
        assert_eq!(
            emitted,
            vec![json!(3), json!(3), json!(4), json!(4), json!(5), json!(5)]
        );
    }

    #[test]
    fn snapshot_round_trip() {
        let builder = keep_max_builder();
        let mut logic = builder(None).unwrap();
        logic.on_awake(Poll::Ready(Some(json!(7)))).unwrap();

        let snapshot = logic.snapshot().unwrap();
        let mut resumed = builder(Some(snapshot)).unwrap();

        let out = resumed.on_awake(Poll::Ready(Some(json!(2)))).unwrap();
        assert_eq!(out, vec![json!(7)]);
    }

    #[test]
    fn none_output_suppresses_emission() {
        // Deduplicate: emit a value the first time its key awakes,
        // nothing afterwards.
        let builder: StateBuilder = Arc::new(|| json!(false));
        let mapper: StatefulMapper = Arc::new(|state, value| {
            if state.as_bool() == Some(true) {
                (Some(json!(true)), None)
            } else {
                (Some(json!(true)), Some(value))
            }
        });
        let mut logic = StatefulMapLogic::builder(builder, mapper)(None).unwrap();

        assert_eq!(
            logic.on_awake(Poll::Ready(Some(json!("x")))).unwrap(),
            vec![json!("x")]
        );
        assert!(logic.on_awake(Poll::Ready(Some(json!("x")))).unwrap().is_empty());
        assert!(matches!(logic.fate(), LogicFate::Retain));
    }

    #[test]
    fn discarding_state_discards_the_key() {
        let builder: StateBuilder = Arc::new(|| json!(0));
        let mapper: StatefulMapper = Arc::new(|_state, value| (None, Some(value)));
        let mut logic = StatefulMapLogic::builder(builder, mapper)(None).unwrap();

        logic.on_awake(Poll::Ready(Some(json!(1)))).unwrap();
        assert!(matches!(logic.fate(), LogicFate::Discard));
    }
}
