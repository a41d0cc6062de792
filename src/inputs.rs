//! Internal code for input.
//!
//! Inputs are defined as a set of named partitions, each of which
//! yields a resumable cursor. Partitions are divvied up between
//! workers with the same routing hash used for keyed state, so a
//! partition always lands on the same worker for a fixed worker
//! count.
//!
//! Actual reads happen off the worker thread: each built partition is
//! wrapped in a [`Batcher`] which runs the cursor on a dedicated I/O
//! thread and hands batches (paired with the cursor snapshot taken
//! right after the read) to the worker over a bounded queue. The
//! worker never blocks on a slow source, and the snapshot it persists
//! at an epoch close always matches the records it actually took.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::task::Poll;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::errors::{EngineError, Result};
use crate::execution::{WorkerCount, WorkerIndex};
use crate::recovery::model::*;

/// How many read-ahead batches a partition can queue before its I/O
/// thread backpressures.
const BATCH_QUEUE_DEPTH: usize = 64;

/// How long the I/O thread idles after an empty read before polling
/// the cursor again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long [`Batcher::next_batch`] sleeps between queue polls while
/// waiting out its time budget.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A resumable read position within one input partition.
///
/// Cursors run on a dedicated I/O thread, never on the worker loop.
pub trait SourceCursor: Send {
    /// Get the next batch of records, if any are ready.
    ///
    /// Returns `Ok(Some(batch))` with zero or more records,
    /// `Ok(None)` at end of input. A batch may be empty if the
    /// partition is alive but idle. Transient faults should be
    /// reported as [`EngineError::SourceUnavailable`]; they are
    /// retried under the configured [`RetryPolicy`].
    fn next_batch(&mut self) -> Result<Option<Vec<Value>>>;

    /// Snapshot the current read position.
    ///
    /// Will be called after each successful [`next_batch`]
    /// (Self::next_batch); re-building a cursor from this snapshot
    /// must not re-yield records from batches already returned.
    fn snapshot(&self) -> Result<StateBytes>;

    /// Release any held resources. Called once after end of input or
    /// when the worker shuts down.
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// An input made up of independent, named partitions.
pub trait PartitionedInput: Send + Sync {
    /// All partition names across the whole input, regardless of
    /// worker. Must be deterministic and identical on every worker.
    fn list_parts(&self) -> Vec<StateKey>;

    /// Build a cursor for one partition, resuming from a previous
    /// snapshot if one is given.
    fn build_part(
        &self,
        part: &StateKey,
        resume_snapshot: Option<StateBytes>,
    ) -> Result<Box<dyn SourceCursor>>;
}

/// Retry schedule for transient source faults.
#[derive(Debug, Copy, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up with
    /// [`EngineError::PartitionFailed`].
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each further attempt,
    /// with jitter.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with full jitter. `attempt` starts at 1.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        exp.mul_f64(fastrand::f64())
    }
}

enum FeedItem {
    /// A batch of records and the cursor position right after reading
    /// them.
    Batch(Vec<Value>, StateBytes),
    Eof,
    Fatal(EngineError),
}

/// Runs a [`SourceCursor`] on its own I/O thread and queues batches
/// for the worker.
pub(crate) struct Batcher {
    rx: mpsc::Receiver<FeedItem>,
    /// Cursor position matching everything handed out so far.
    last_snapshot: StateBytes,
    max_len: usize,
    max_wait: Duration,
    eof: bool,
}

impl Batcher {
    pub(crate) fn spawn(
        step_id: StepId,
        part: StateKey,
        cursor: Box<dyn SourceCursor>,
        retry: RetryPolicy,
        max_len: usize,
        max_wait: Duration,
    ) -> Result<Self> {
        let last_snapshot = cursor.snapshot()?;
        let (tx, rx) = mpsc::channel(BATCH_QUEUE_DEPTH);

        thread::Builder::new()
            .name(format!("millrace-io-{step_id}-{part}"))
            .spawn(move || feed(step_id, part, cursor, retry, tx))?;

        Ok(Self {
            rx,
            last_snapshot,
            max_len,
            max_wait,
            eof: false,
        })
    }

    /// Gather queued batches until the configured batch length is
    /// reached or the configured wait duration elapses, whichever
    /// comes first.
    ///
    /// `Ready(Some(..))` carries records, `Ready(None)` means this
    /// partition is exhausted, `Pending` means nothing arrived within
    /// the budget.
    pub(crate) fn next_batch(&mut self) -> Result<Poll<Option<Vec<Value>>>> {
        if self.eof {
            return Ok(Poll::Ready(None));
        }

        let deadline = Instant::now() + self.max_wait;
        let mut items = Vec::new();
        while items.len() < self.max_len {
            match self.rx.try_recv() {
                Ok(FeedItem::Batch(batch, snapshot)) => {
                    items.extend(batch);
                    self.last_snapshot = snapshot;
                }
                Ok(FeedItem::Eof) | Err(TryRecvError::Disconnected) => {
                    self.eof = true;
                    break;
                }
                Ok(FeedItem::Fatal(err)) => return Err(err),
                Err(TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    thread::sleep(RECV_POLL_INTERVAL);
                }
            }
        }

        if !items.is_empty() {
            Ok(Poll::Ready(Some(items)))
        } else if self.eof {
            Ok(Poll::Ready(None))
        } else {
            Ok(Poll::Pending)
        }
    }

    /// Cursor position as of the last batch returned by
    /// [`next_batch`](Self::next_batch). Persist this at epoch close.
    pub(crate) fn snapshot(&self) -> StateBytes {
        self.last_snapshot.clone()
    }
}

/// I/O thread body. Owns the cursor for its whole life.
fn feed(
    step_id: StepId,
    part: StateKey,
    mut cursor: Box<dyn SourceCursor>,
    retry: RetryPolicy,
    tx: mpsc::Sender<FeedItem>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            let _ = tx.blocking_send(FeedItem::Fatal(err.into()));
            return;
        }
    };

    rt.block_on(async move {
        let mut attempt = 0u32;
        loop {
            match cursor.next_batch() {
                Ok(Some(items)) => {
                    attempt = 0;
                    let idle = items.is_empty();
                    let snapshot = match cursor.snapshot() {
                        Ok(snapshot) => snapshot,
                        Err(err) => {
                            let _ = tx.send(FeedItem::Fatal(err)).await;
                            return;
                        }
                    };
                    if !idle && tx.send(FeedItem::Batch(items, snapshot)).await.is_err() {
                        // Worker hung up; shut down quietly.
                        break;
                    }
                    if idle {
                        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                    }
                }
                Ok(None) => {
                    tracing::trace!("Input {step_id:?} partition {part:?} reached EOF");
                    let _ = tx.send(FeedItem::Eof).await;
                    break;
                }
                Err(EngineError::SourceUnavailable { reason }) => {
                    attempt += 1;
                    if attempt >= retry.max_attempts {
                        let _ = tx
                            .send(FeedItem::Fatal(EngineError::PartitionFailed {
                                step_id: step_id.clone(),
                                part: part.clone(),
                                attempts: attempt,
                            }))
                            .await;
                        return;
                    }
                    let delay = retry.backoff(attempt);
                    tracing::warn!(
                        "Input {step_id:?} partition {part:?} unavailable \
                         (attempt {attempt}): {reason}; retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let _ = tx.send(FeedItem::Fatal(err)).await;
                    return;
                }
            }
        }
        if let Err(err) = cursor.close() {
            tracing::warn!("Error closing input {step_id:?} partition {part:?}: {err}");
        }
    });
}

/// Build batchers for every partition of this input owned by this
/// worker.
pub(crate) fn build_local_parts(
    input: &dyn PartitionedInput,
    step_id: &StepId,
    index: WorkerIndex,
    count: WorkerCount,
    mut resume_state: StepStateBytes,
    retry: RetryPolicy,
    batch_max_len: usize,
    batch_max_wait: Duration,
) -> Result<HashMap<StateKey, Batcher>> {
    let keys: BTreeSet<StateKey> = input.list_parts().into_iter().collect();

    let mut parts = HashMap::new();
    for key in keys {
        // The state key routing hash doubles as the partition to
        // worker assignment, so partition resume state follows the
        // same path as all other keyed state.
        if !key.is_local(index, count) {
            continue;
        }
        let state = resume_state.remove(&key);
        tracing::info!(
            "{index:?} building input {step_id:?} source {key:?} \
             with resume state {state:?}"
        );
        let cursor = input.build_part(&key, state)?;
        parts.insert(
            key.clone(),
            Batcher::spawn(
                step_id.clone(),
                key,
                cursor,
                retry,
                batch_max_len,
                batch_max_wait,
            )?,
        );
    }

    if !resume_state.is_empty() {
        tracing::warn!(
            "Resume state exists for {step_id:?} for unknown partitions {:?}; \
             changing partition counts? recovery state routing bug?",
            resume_state.keys().collect::<Vec<_>>()
        );
    }

    Ok(parts)
}
