//! Implementation of in-memory state and progress stores.
//!
//! The resume system uses these to build up a queryable picture of
//! the real recovery store, since we don't assume real recovery
//! stores have querying abilities.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::recovery::model::*;

/// A state store with all data in memory.
#[derive(Debug)]
pub(crate) struct InMemStore<V> {
    db: HashMap<FlowKey, BTreeMap<SnapshotEpoch, Change<V>>>,
}

impl<V> InMemStore<V> {
    pub(crate) fn new() -> Self {
        Self { db: HashMap::new() }
    }

    /// Drop all changes at or past the given epoch.
    ///
    /// Snapshots written during epochs the previous execution never
    /// finalized must not be visible to the resumed execution.
    pub(crate) fn filter_before(&mut self, resume_epoch: &ResumeEpoch) {
        for changes in self.db.values_mut() {
            changes.split_off(&SnapshotEpoch(resume_epoch.0));
        }
        self.db.retain(|_key, changes| !changes.is_empty());
    }

    /// Drop all but the latest epoch for each key.
    pub(crate) fn filter_last(&mut self) {
        for changes in self.db.values_mut() {
            if let Some(split_epoch) = changes.keys().next_back().cloned() {
                *changes = changes.split_off(&split_epoch);
            }
        }
    }

    /// Drain all remaining changes into per-key changes, in epoch
    /// order. This'll let you write them into the resume state for
    /// each step.
    pub(crate) fn drain_flatten(&mut self) -> impl Iterator<Item = KChange<FlowKey, V>> + '_ {
        self.db.drain().flat_map(|(key, changes)| {
            changes
                // Emits in epoch order.
                .into_values()
                .map(move |change| KChange(key.clone(), change))
        })
    }
}

impl<V> KWriter<StoreKey, Change<V>> for InMemStore<V> {
    fn write(&mut self, kchange: KChange<StoreKey, Change<V>>) {
        let KChange(StoreKey(epoch, key), change) = kchange;
        let changes = self.db.entry(key.clone()).or_default();
        changes.write(KChange(epoch, change));
        if changes.is_empty() {
            self.db.remove(&key);
        }
    }
}

/// A progress store with all data in memory.
///
/// Collects [`ProgressMsg`]s from all workers of all previous
/// executions and calculates where the next execution should resume.
#[derive(Debug)]
pub(crate) struct InMemProgress {
    inits: HashMap<WorkerKey, (WorkerCount, ResumeEpoch)>,
    frontiers: HashMap<WorkerKey, WorkerFrontier>,
}

impl InMemProgress {
    pub(crate) fn new() -> Self {
        Self {
            inits: HashMap::new(),
            frontiers: HashMap::new(),
        }
    }

    /// Calculate where a new execution should resume from.
    ///
    /// This is the minimum finalized frontier across all workers of
    /// the most recent execution (a worker that never advanced
    /// contributes its init resume epoch), labeled with the next
    /// execution number. Deterministic, so all workers converge to
    /// the same value.
    pub(crate) fn resume_from(&self) -> ResumeFrom {
        let last_ex = self.inits.keys().map(|WorkerKey(ex, _)| *ex).max();

        match last_ex {
            None => ResumeFrom::default(),
            Some(ex) => {
                let resume_epoch = self
                    .inits
                    .iter()
                    .filter(|(WorkerKey(key_ex, _), _)| *key_ex == ex)
                    .map(|(key, (_count, init_epoch))| {
                        self.frontiers
                            .get(key)
                            .map(|front| front.0)
                            .unwrap_or(init_epoch.0)
                    })
                    .min()
                    .unwrap_or(0);
                ResumeFrom(Execution(ex.0 + 1), ResumeEpoch(resume_epoch))
            }
        }
    }
}

impl KWriter<WorkerKey, ProgressMsg> for InMemProgress {
    fn write(&mut self, kchange: KChange<WorkerKey, ProgressMsg>) {
        let KChange(key, change) = kchange;
        match change {
            Change::Upsert(msg) => match msg {
                ProgressMsg::Init(count, epoch) => {
                    self.inits.insert(key, (count, epoch));
                }
                ProgressMsg::Advance(front) => {
                    self.frontiers.insert(key, front);
                }
            },
            Change::Discard => {
                self.inits.remove(&key);
                self.frontiers.remove(&key);
            }
        }
    }
}
