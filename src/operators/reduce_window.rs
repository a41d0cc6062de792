//! Implements the reduce window step.
//!
//! Combine values within a window into an accumulator. Emit the
//! accumulator when the window closes.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;

use crate::errors::Result;
use crate::recovery::model::StateBytes;
use crate::window::WindowLogic;
use crate::window::WindowLogicBuilder;

use super::Reducer;

pub(crate) struct ReduceWindowLogic {
    reducer: Reducer,
    acc: Option<Value>,
}

impl ReduceWindowLogic {
    pub(crate) fn builder(reducer: Reducer) -> WindowLogicBuilder {
        Arc::new(move |resume_snapshot| {
            let acc = resume_snapshot
                .map(StateBytes::de::<Option<Value>>)
                .transpose()?
                .flatten();
            Ok(Box::new(Self {
                reducer: reducer.clone(),
                acc,
            }))
        })
    }
}

impl WindowLogic for ReduceWindowLogic {
    fn with_next(&mut self, next_value: Option<(Value, DateTime<Utc>)>) -> Vec<Value> {
        match next_value {
            Some((value, _item_time)) => {
                let updated_acc = match self.acc.take() {
                    // If there's no accumulator yet, use the current
                    // value.
                    None => value,
                    Some(acc) => {
                        let updated_acc = (self.reducer)(acc, value);
                        tracing::trace!("reduce_window: -> updated_acc={updated_acc:?}");
                        updated_acc
                    }
                };
                self.acc = Some(updated_acc);
                vec![]
            }
            // Emit at end of window.
            None => self.acc.take().into_iter().collect(),
        }
    }

    fn snapshot(&self) -> Result<StateBytes> {
        StateBytes::ser::<Option<Value>>(&self.acc)
    }
}
