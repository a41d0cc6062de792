use std::task::Poll;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde_json::Value;

use crate::errors::Result;
use crate::recovery::model::StateBytes;

use super::Clock;
use super::TimeGetter;

/// Use datetimes from events as the clock.
///
/// The watermark is the timestamp of the latest received event minus
/// the late allowance, advanced by the system time elapsed since that
/// event arrived. So even a stalled stream eventually closes its
/// windows. Once input ends, the watermark jumps to the end of time.
pub(crate) struct EventClock {
    dt_getter: TimeGetter,
    late: Duration,
    // State
    late_time: DateTime<Utc>,
    system_time_of_last_event: DateTime<Utc>,
}

impl EventClock {
    pub(crate) fn new(
        dt_getter: TimeGetter,
        late: Duration,
        resume_snapshot: Option<StateBytes>,
    ) -> Result<Self> {
        let (late_time, system_time_of_last_event) = match resume_snapshot {
            Some(snapshot) => snapshot.de()?,
            None => (DateTime::<Utc>::MIN_UTC, Utc::now()),
        };
        Ok(Self {
            dt_getter,
            late,
            late_time,
            system_time_of_last_event,
        })
    }
}

impl Clock for EventClock {
    fn watermark(&mut self, next_value: &Poll<Option<Value>>) -> DateTime<Utc> {
        let now = Utc::now();
        match next_value {
            Poll::Ready(Some(event)) => {
                let event_late_time = self.time_for(event) - self.late;
                if event_late_time > self.late_time {
                    self.late_time = event_late_time;
                    self.system_time_of_last_event = now;
                }
            }
            Poll::Ready(None) => {
                self.late_time = DateTime::<Utc>::MAX_UTC;
                self.system_time_of_last_event = now;
            }
            Poll::Pending => {}
        }
        let system_duration_since_last_event =
            now.signed_duration_since(self.system_time_of_last_event);
        self.late_time
            .checked_add_signed(system_duration_since_last_event)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn time_for(&mut self, event: &Value) -> DateTime<Utc> {
        (self.dt_getter)(event)
    }

    fn snapshot(&self) -> Result<StateBytes> {
        StateBytes::ser(&(self.late_time, self.system_time_of_last_event))
    }
}
