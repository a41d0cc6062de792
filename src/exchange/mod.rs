//! Cluster exchange: routing keyed records between workers.
//!
//! Workers form a full mesh. Each keyed record a worker does not own
//! is wrapped in a [`WireFrame::Record`] carrying the epoch and a
//! per-sender sequence number and sent to the owning worker. Epoch
//! barriers ride the same channels as [`WireFrame::EpochDone`]
//! frames.
//!
//! Transport delivery is at-least-once (a sender may re-send after a
//! reconnect), so receivers run every record through [`Dedup`] before
//! processing it.
//!
//! Frames on the wire are length-prefixed: `[len:u32 BE][payload]`
//! with a JSON payload.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::errors::{EngineError, Result};
use crate::execution::{WorkerCount, WorkerIndex};
use crate::recovery::model::{StateKey, StepId};

pub(crate) mod mem;
pub(crate) mod tcp;

/// A message between two workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum WireFrame {
    /// Handshake; first frame on every outbound connection.
    Hello { index: WorkerIndex },
    /// A keyed record routed to the worker that owns the key.
    Record {
        epoch: u64,
        /// Per-sender sequence number, monotonic within the epoch.
        seq: u64,
        step_id: StepId,
        key: StateKey,
        value: Value,
    },
    /// The sender has emitted everything it will for this epoch. With
    /// `eof` set, the sender's inputs are exhausted and it will never
    /// open another epoch.
    EpochDone { epoch: u64, eof: bool },
}

impl WireFrame {
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)
            .map_err(|err| EngineError::snapshot_corrupt("error encoding wire frame", err))?;
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|err| EngineError::snapshot_corrupt("error decoding wire frame", err))
    }
}

/// Try to decode one frame from a sticky buffer, consuming its bytes
/// on success.
pub(crate) fn try_decode_from_buffer(buffer: &mut Vec<u8>) -> Result<Option<WireFrame>> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let payload_len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if buffer.len() < 4 + payload_len {
        return Ok(None);
    }
    let frame = WireFrame::decode(&buffer[4..4 + payload_len])?;
    buffer.drain(0..4 + payload_len);
    Ok(Some(frame))
}

/// Full-mesh transport between the workers of one execution.
///
/// Membership is fixed at startup; there is no dynamic join.
pub(crate) trait Mesh: Send {
    fn index(&self) -> WorkerIndex;

    fn count(&self) -> WorkerCount;

    fn send(&mut self, to: WorkerIndex, frame: WireFrame) -> Result<()>;

    /// Pull the next queued frame and who sent it, if any.
    fn try_recv(&mut self) -> Result<Option<(WorkerIndex, WireFrame)>>;
}

/// Drops re-delivered records.
///
/// Tracks the next expected sequence number per sender per epoch.
/// At-least-once transports may replay a suffix of an epoch after a
/// reconnect; replayed records have sequence numbers we've already
/// admitted and are dropped.
#[derive(Debug, Default)]
pub(crate) struct Dedup {
    next_seq: HashMap<(WorkerIndex, u64), u64>,
}

impl Dedup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns true if this record has not been seen before.
    pub(crate) fn admit(&mut self, from: WorkerIndex, epoch: u64, seq: u64) -> bool {
        let next = self.next_seq.entry((from, epoch)).or_insert(0);
        if seq < *next {
            tracing::debug!(
                "Dropping duplicate record seq {seq} from {from:?} in epoch {epoch}"
            );
            false
        } else {
            *next = seq + 1;
            true
        }
    }

    /// Forget tracking for epochs at or before the given one; the
    /// barrier guarantees no more records for them will arrive.
    pub(crate) fn retire(&mut self, epoch: u64) {
        self.next_seq.retain(|(_from, e), _next| *e > epoch);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn frame_survives_the_wire() {
        let frame = WireFrame::Record {
            epoch: 7,
            seq: 42,
            step_id: StepId::new("sum"),
            key: StateKey::new("a"),
            value: json!({"count": 1}),
        };

        let mut buffer = frame.encode().unwrap();
        // Partial read: nothing decodes yet.
        let mut partial = buffer[..3].to_vec();
        assert_eq!(try_decode_from_buffer(&mut partial).unwrap(), None);

        let decoded = try_decode_from_buffer(&mut buffer).unwrap();
        assert_eq!(decoded, Some(frame));
        assert!(buffer.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let first = WireFrame::Hello {
            index: WorkerIndex(1),
        };
        let second = WireFrame::EpochDone {
            epoch: 3,
            eof: true,
        };

        let mut buffer = first.encode().unwrap();
        buffer.extend(second.encode().unwrap());

        assert_eq!(try_decode_from_buffer(&mut buffer).unwrap(), Some(first));
        assert_eq!(try_decode_from_buffer(&mut buffer).unwrap(), Some(second));
        assert!(buffer.is_empty());
    }

    #[test]
    fn dedup_drops_replays() {
        let mut dedup = Dedup::new();
        let sender = WorkerIndex(1);

        assert!(dedup.admit(sender, 5, 0));
        assert!(dedup.admit(sender, 5, 1));
        // Replayed suffix after a reconnect.
        assert!(!dedup.admit(sender, 5, 0));
        assert!(!dedup.admit(sender, 5, 1));
        assert!(dedup.admit(sender, 5, 2));
    }

    #[test]
    fn dedup_is_per_sender_and_epoch() {
        let mut dedup = Dedup::new();

        assert!(dedup.admit(WorkerIndex(1), 5, 0));
        assert!(dedup.admit(WorkerIndex(2), 5, 0));
        assert!(dedup.admit(WorkerIndex(1), 6, 0));
    }

    #[test]
    fn retire_forgets_closed_epochs() {
        let mut dedup = Dedup::new();
        let sender = WorkerIndex(0);

        assert!(dedup.admit(sender, 5, 0));
        dedup.retire(5);
        assert!(dedup.next_seq.is_empty());
        // A fresh epoch starts clean.
        assert!(dedup.admit(sender, 6, 0));
    }
}
