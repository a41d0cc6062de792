//! Data model representing state in the dataflow and the recovery
//! system.
//!
//! A state store is a K-V mapping from [`StoreKey`] to
//! [`StateBytes`].

use std::collections::hash_map;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::hash::Hasher;

use seahash::SeaHasher;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::{EngineError, Result};
use crate::execution::{WorkerCount, WorkerIndex};

use super::change::*;

/// Unique ID for a step in a dataflow.
///
/// Recovery data is keyed off of this to ensure state is not mixed
/// between steps.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Display for StepId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// Key to route state within a dataflow step.
///
/// Only strings are routeable: the key interfaces with routing,
/// serialization, and the recovery store, all of which need stable
/// hashing and equality, and we can't guarantee that on arbitrary
/// record contents.
///
/// Partitioned inputs also use this as the partition id, which doubles
/// as how partitions are divvied up between workers.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey(pub String);

impl StateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Deterministic hash of this key for routing.
    ///
    /// Must be stable across processes and executions; recovery and
    /// cluster exchange both depend on a key always landing on the
    /// same worker for a fixed worker count.
    fn route_hash(&self) -> u64 {
        let mut hasher = SeaHasher::default();
        self.0.hash(&mut hasher);
        hasher.finish()
    }

    /// The worker that owns all state for this key.
    pub fn route(&self, count: WorkerCount) -> WorkerIndex {
        WorkerIndex(usize::try_from(self.route_hash() % count.0 as u64).unwrap_or(0))
    }

    pub fn is_local(&self, index: WorkerIndex, count: WorkerCount) -> bool {
        self.route(count) == index
    }
}

impl Display for StateKey {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// Key to route state within a whole dataflow.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey(pub StepId, pub StateKey);

/// The epoch at whose close a snapshot was taken.
#[derive(
    Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SnapshotEpoch(pub u64);

/// Key to route state within the state store.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey(pub SnapshotEpoch, pub FlowKey);

/// A snapshot of state for a specific key within a step.
///
/// The recovery system only deals in bytes so each operator can store
/// custom shapes without the store knowing about them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    /// Serialize a state object from an operator into bytes the
    /// recovery system can store.
    pub fn ser<T: Serialize>(obj: &T) -> Result<Self> {
        let t_name = std::any::type_name::<T>();
        serde_json::to_vec(obj)
            .map(Self)
            .map_err(|err| {
                EngineError::snapshot_corrupt(
                    format!("error serializing recovery state type {t_name}"),
                    err,
                )
            })
    }

    /// Deserialize bytes from the recovery system into a state object
    /// an operator can use.
    ///
    /// Fails with [`EngineError::SnapshotCorrupt`]; per policy that is
    /// fatal for the partition being resumed.
    pub fn de<T: DeserializeOwned>(self) -> Result<T> {
        let t_name = std::any::type_name::<T>();
        serde_json::from_slice(&self.0).map_err(|err| {
            EngineError::snapshot_corrupt(
                format!("error deserializing recovery state type {t_name}"),
                err,
            )
        })
    }
}

/// A change to state within the dataflow.
pub type FlowChange = KChange<FlowKey, StateBytes>;

/// A change to the state store.
pub type StoreChange = KChange<StoreKey, Change<StateBytes>>;

/// All state stores have to implement this writer.
pub trait StateWriter: KWriter<StoreKey, Change<StateBytes>> {}

/// All state stores have to implement this reader.
pub trait StateReader: KReader<StoreKey, Change<StateBytes>> {}

/// Resume state for all keys within a step.
///
/// Built up during the resume process, drained by each step as the
/// worker compiles the dataflow.
#[derive(Debug, Default)]
pub struct StepStateBytes(HashMap<StateKey, StateBytes>);

impl StepStateBytes {
    pub fn remove(&mut self, key: &StateKey) -> Option<StateBytes> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &StateKey> {
        self.0.keys()
    }
}

impl IntoIterator for StepStateBytes {
    type Item = (StateKey, StateBytes);
    type IntoIter = hash_map::IntoIter<StateKey, StateBytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl KWriter<StateKey, StateBytes> for StepStateBytes {
    fn write(&mut self, kchange: KChange<StateKey, StateBytes>) {
        self.0.write(kchange)
    }
}

/// Resume state for all steps within a dataflow.
#[derive(Debug, Default)]
pub struct FlowStateBytes(HashMap<StepId, StepStateBytes>);

impl FlowStateBytes {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn remove(&mut self, step_id: &StepId) -> StepStateBytes {
        if let Some(step_state) = self.0.remove(step_id) {
            step_state
        } else {
            if !self.0.is_empty() {
                tracing::warn!(
                    "No resume state for {step_id:?}, but other steps have state; \
                     this is concerning unless you're adding a new step to this dataflow"
                );
            }
            Default::default()
        }
    }
}

impl KWriter<FlowKey, StateBytes> for FlowStateBytes {
    fn write(&mut self, kchange: KChange<FlowKey, StateBytes>) {
        let KChange(FlowKey(step_id, state_key), change) = kchange;
        self.0
            .entry(step_id)
            .or_default()
            .write(KChange(state_key, change));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_is_deterministic() {
        let count = WorkerCount(5);
        for key in ["a", "b", "server.example.com", ""] {
            let key = StateKey::new(key);
            let first = key.route(count);
            for _ in 0..10 {
                assert_eq!(key.route(count), first);
            }
            assert!(first.0 < count.0);
        }
    }

    #[test]
    fn state_bytes_round_trip() {
        let snap = StateBytes::ser(&(Some(3_i64), "acc")).unwrap();
        let (n, s): (Option<i64>, String) = snap.de().unwrap();
        assert_eq!(n, Some(3));
        assert_eq!(s, "acc");
    }

    #[test]
    fn corrupt_state_bytes_is_fatal() {
        let snap = StateBytes(b"not json".to_vec());
        let res: Result<u64> = snap.de();
        assert!(matches!(res, Err(EngineError::SnapshotCorrupt { .. })));
    }
}
