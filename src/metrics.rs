//! Operational counters.
//!
//! A [`Metrics`] handle is built once per process and cloned into
//! every component that needs to count something. Callers can scrape
//! or inspect the underlying [`prometheus::Registry`] however they
//! like; the engine itself never exposes a server for it.

use std::sync::Arc;

use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;

use crate::errors::Result;
use crate::recovery::model::StepId;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    dropped_late_records: IntCounterVec,
    routed_records: IntCounter,
    snapshots_written: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let dropped_late_records = IntCounterVec::new(
            Opts::new(
                "dropped_late_records",
                "Records dropped because they arrived behind the watermark",
            ),
            &["step_id"],
        )?;
        registry.register(Box::new(dropped_late_records.clone()))?;

        let routed_records = IntCounter::new(
            "routed_records",
            "Keyed records routed between workers",
        )?;
        registry.register(Box::new(routed_records.clone()))?;

        let snapshots_written = IntCounter::new(
            "snapshots_written",
            "State snapshots written to the recovery store",
        )?;
        registry.register(Box::new(snapshots_written.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            dropped_late_records,
            routed_records,
            snapshots_written,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn inc_dropped_late(&self, step_id: &StepId) {
        self.dropped_late_records
            .with_label_values(&[&step_id.0])
            .inc();
    }

    pub(crate) fn inc_routed(&self) {
        self.routed_records.inc();
    }

    pub(crate) fn inc_snapshots(&self) {
        self.snapshots_written.inc();
    }

    /// Count of late drops for one step so far.
    pub fn dropped_late_records(&self, step_id: &StepId) -> u64 {
        self.dropped_late_records
            .with_label_values(&[&step_id.0])
            .get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_drops_are_counted_per_step() {
        let metrics = Metrics::new().unwrap();
        let win = StepId::new("win");
        let other = StepId::new("other");

        metrics.inc_dropped_late(&win);
        metrics.inc_dropped_late(&win);

        assert_eq!(metrics.dropped_late_records(&win), 2);
        assert_eq!(metrics.dropped_late_records(&other), 0);
    }
}
