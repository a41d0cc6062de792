use std::collections::HashMap;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

use crate::errors::Result;
use crate::recovery::model::StateBytes;

use super::InsertError;
use super::WindowKey;
use super::Windower;

/// Tumbling windows of fixed length aligned to an instant.
///
/// Windows cover all time and do not overlap, so each item falls in
/// exactly one window. Window `n` covers `[align_to + n * length,
/// align_to + (n + 1) * length)`; start times are inclusive, end
/// times are exclusive. A window closes as soon as the watermark
/// reaches its end time, so an item timestamped exactly at a boundary
/// belongs to the window opening there.
pub(crate) struct TumblingWindower {
    length: Duration,
    align_to: DateTime<Utc>,
    close_times: HashMap<WindowKey, DateTime<Utc>>,
}

impl TumblingWindower {
    pub(crate) fn new(
        length: Duration,
        align_to: DateTime<Utc>,
        resume_snapshot: Option<StateBytes>,
    ) -> Result<Self> {
        let close_times = resume_snapshot
            .map(StateBytes::de::<HashMap<WindowKey, DateTime<Utc>>>)
            .transpose()?
            .unwrap_or_default();
        Ok(Self {
            length,
            align_to,
            close_times,
        })
    }

    /// The single window containing a given time, and its close time.
    fn intersects(&self, time: &DateTime<Utc>) -> (WindowKey, DateTime<Utc>) {
        let since_align = time.signed_duration_since(self.align_to);
        // Round towards -inf so times before the alignment instant
        // get negative window indexes.
        let window_idx = since_align
            .num_milliseconds()
            .div_euclid(self.length.num_milliseconds());

        let window_open =
            self.align_to + Duration::milliseconds(window_idx * self.length.num_milliseconds());
        let window_close = window_open + self.length;
        (WindowKey(window_idx), window_close)
    }

    fn insert_window(&mut self, key: WindowKey, close_time: DateTime<Utc>) {
        self.close_times
            .entry(key)
            .and_modify(|existing| {
                assert!(
                    existing == &close_time,
                    "TumblingWindower is not generating consistent boundaries"
                )
            })
            .or_insert(close_time);
    }
}

impl Windower for TumblingWindower {
    fn insert(
        &mut self,
        watermark: &DateTime<Utc>,
        item_time: &DateTime<Utc>,
    ) -> Vec<std::result::Result<WindowKey, InsertError>> {
        let (key, close_time) = self.intersects(item_time);
        tracing::trace!("Item in {key:?} closing at {close_time:?}");
        if close_time <= *watermark {
            vec![Err(InsertError::Late(key))]
        } else {
            self.insert_window(key, close_time);
            vec![Ok(key)]
        }
    }

    fn drain_closed(&mut self, watermark: &DateTime<Utc>) -> Vec<WindowKey> {
        let mut future_close_times = HashMap::new();
        let mut closed_ids = Vec::new();

        for (id, close_at) in self.close_times.iter() {
            if close_at <= watermark {
                closed_ids.push(*id);
            } else {
                future_close_times.insert(*id, *close_at);
            }
        }

        self.close_times = future_close_times;
        closed_ids
    }

    fn is_empty(&self) -> bool {
        self.close_times.is_empty()
    }

    fn next_close(&self) -> Option<DateTime<Utc>> {
        self.close_times.values().min().cloned()
    }

    fn snapshot(&self) -> Result<StateBytes> {
        StateBytes::ser::<HashMap<WindowKey, DateTime<Utc>>>(&self.close_times)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn windower() -> TumblingWindower {
        TumblingWindower {
            length: Duration::seconds(10),
            align_to: Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 0).unwrap(),
            close_times: HashMap::new(),
        }
    }

    #[test]
    fn intersect_bulk() {
        let windower = windower();

        //         9:00:08
        //         I
        // [0--------)
        //           [1--------)
        let item_time = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 8).unwrap();
        assert_eq!(
            windower.intersects(&item_time),
            (
                WindowKey(0),
                Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 10).unwrap()
            ),
        );
    }

    #[test]
    fn intersect_edge_belongs_to_the_opening_window() {
        let windower = windower();

        //           9:00:10
        //           I
        // [0--------)
        //           [1--------)
        let item_time = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 10).unwrap();
        assert_eq!(
            windower.intersects(&item_time),
            (
                WindowKey(1),
                Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 20).unwrap()
            ),
        );
    }

    #[test]
    fn intersect_before_align_rounds_down() {
        let windower = windower();

        //      8:59:55
        //      I
        // [-1--------)
        //            [0--------)
        let item_time = Utc.with_ymd_and_hms(2023, 3, 16, 8, 59, 55).unwrap();
        assert_eq!(
            windower.intersects(&item_time),
            (
                WindowKey(-1),
                Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 0).unwrap()
            ),
        );
    }

    #[test]
    fn insert_marks_items_behind_the_watermark_late() {
        let mut windower = windower();

        //              9:00:17
        //              W
        //         9:00:08
        //         I
        // [0--------)
        //           [1--------)
        let watermark = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 17).unwrap();
        let item_time = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 8).unwrap();
        assert_eq!(
            windower.insert(&watermark, &item_time),
            vec![Err(InsertError::Late(WindowKey(0)))]
        );
    }

    #[test]
    fn insert_at_exact_close_time_is_late() {
        let mut windower = windower();

        // The watermark reaching a window's end time closes it.
        let watermark = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 10).unwrap();
        let item_time = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 8).unwrap();
        assert_eq!(
            windower.insert(&watermark, &item_time),
            vec![Err(InsertError::Late(WindowKey(0)))]
        );
    }

    #[test]
    fn drain_closed_closes_at_exact_close_time() {
        let mut windower = windower();

        let watermark1 = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 4).unwrap();
        let item_time = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 3).unwrap();
        let _ = windower.insert(&watermark1, &item_time);

        let watermark2 = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 9).unwrap();
        assert_eq!(windower.drain_closed(&watermark2), Vec::<WindowKey>::new());

        let watermark3 = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 10).unwrap();
        assert_eq!(windower.drain_closed(&watermark3), vec![WindowKey(0)]);
        assert!(windower.is_empty());
    }

    #[test]
    fn snapshot_round_trip() {
        let mut windower = windower();

        let watermark = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 4).unwrap();
        let item_time = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 3).unwrap();
        let _ = windower.insert(&watermark, &item_time);

        let snapshot = windower.snapshot().unwrap();
        let resumed = TumblingWindower::new(
            Duration::seconds(10),
            Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 0).unwrap(),
            Some(snapshot),
        )
        .unwrap();

        assert_eq!(
            resumed.next_close(),
            Some(Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 10).unwrap())
        );
    }
}
