//! In-process mesh over channels.
//!
//! Used by single-process execution and tests; delivery is reliable
//! and ordered, so [`super::Dedup`] never actually drops anything
//! here.

use tokio::sync::mpsc;

use crate::errors::{EngineError, Result};
use crate::execution::{WorkerCount, WorkerIndex};

use super::Mesh;
use super::WireFrame;

pub(crate) struct MemMesh {
    index: WorkerIndex,
    /// Inbox senders of every worker, indexed by worker.
    peers: Vec<mpsc::UnboundedSender<(WorkerIndex, WireFrame)>>,
    inbox: mpsc::UnboundedReceiver<(WorkerIndex, WireFrame)>,
}

/// Build a full mesh for an in-process cluster, one [`MemMesh`] per
/// worker.
pub(crate) fn full_mesh(count: WorkerCount) -> Vec<MemMesh> {
    let (txs, rxs): (Vec<_>, Vec<_>) = (0..count.0).map(|_| mpsc::unbounded_channel()).unzip();

    rxs.into_iter()
        .enumerate()
        .map(|(index, inbox)| MemMesh {
            index: WorkerIndex(index),
            peers: txs.clone(),
            inbox,
        })
        .collect()
}

impl Mesh for MemMesh {
    fn index(&self) -> WorkerIndex {
        self.index
    }

    fn count(&self) -> WorkerCount {
        WorkerCount(self.peers.len())
    }

    fn send(&mut self, to: WorkerIndex, frame: WireFrame) -> Result<()> {
        self.peers[to.0]
            .send((self.index, frame))
            .map_err(|_hung_up| EngineError::PeerUnreachable { peer: to, epoch: 0 })
    }

    fn try_recv(&mut self) -> Result<Option<(WorkerIndex, WireFrame)>> {
        match self.inbox.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            // All peers gone; nothing more will ever arrive.
            Err(mpsc::error::TryRecvError::Disconnected) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_arrive_tagged_with_sender() {
        let mut meshes = full_mesh(WorkerCount(2));
        let mut m1 = meshes.pop().unwrap();
        let mut m0 = meshes.pop().unwrap();

        m0.send(
            WorkerIndex(1),
            WireFrame::EpochDone {
                epoch: 1,
                eof: false,
            },
        )
        .unwrap();

        let (from, frame) = m1.try_recv().unwrap().unwrap();
        assert_eq!(from, WorkerIndex(0));
        assert_eq!(
            frame,
            WireFrame::EpochDone {
                epoch: 1,
                eof: false
            }
        );
        assert_eq!(m1.try_recv().unwrap(), None);
    }

    #[test]
    fn self_send_works() {
        let mut meshes = full_mesh(WorkerCount(1));
        let mut m0 = meshes.pop().unwrap();

        m0.send(
            WorkerIndex(0),
            WireFrame::Hello {
                index: WorkerIndex(0),
            },
        )
        .unwrap();
        assert!(m0.try_recv().unwrap().is_some());
    }
}
