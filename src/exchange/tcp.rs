//! TCP mesh transport.
//!
//! Each worker listens on its own address from the shared address
//! list and dials every other worker. The first frame on every
//! outbound connection is a [`WireFrame::Hello`] naming the dialing
//! worker, so the accepting side knows who frames are from.
//!
//! All socket I/O runs on a dedicated runtime thread per worker; the
//! worker loop talks to it through channels and never blocks on the
//! network. Dropping the [`TcpMesh`] shuts the runtime thread down.

use std::collections::HashMap;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::thread;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::errors::{EngineError, Result};
use crate::execution::{WorkerCount, WorkerIndex};

use super::Mesh;
use super::WireFrame;

const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct TcpMesh {
    index: WorkerIndex,
    count: WorkerCount,
    outboxes: HashMap<WorkerIndex, mpsc::UnboundedSender<WireFrame>>,
    inbox_tx: mpsc::UnboundedSender<(WorkerIndex, WireFrame)>,
    inbox: mpsc::UnboundedReceiver<(WorkerIndex, WireFrame)>,
    /// Dropping this stops the runtime thread.
    _shutdown: oneshot::Sender<()>,
}

impl TcpMesh {
    /// Bind, dial all peers, and wait for all peers to dial us.
    ///
    /// Blocks until the full mesh is up or `handshake_timeout`
    /// passes, in which case the first missing peer is reported as
    /// [`EngineError::PeerUnreachable`].
    pub(crate) fn connect(
        addresses: Vec<String>,
        index: WorkerIndex,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let count = WorkerCount(addresses.len());
        if index.0 >= count.0 {
            return Err(EngineError::Config(format!(
                "worker index {index:?} out of range for {count:?} addresses"
            )));
        }

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let setup_inbox_tx = inbox_tx.clone();
        thread::Builder::new()
            .name(format!("millrace-mesh-{}", index.0))
            .spawn(move || {
                run_mesh(
                    addresses,
                    index,
                    handshake_timeout,
                    setup_inbox_tx,
                    ready_tx,
                    shutdown_rx,
                )
            })?;

        let outboxes = ready_rx
            .recv()
            .map_err(|_hung_up| EngineError::Config("mesh thread died during setup".into()))??;

        Ok(Self {
            index,
            count,
            outboxes,
            inbox_tx,
            inbox,
            _shutdown: shutdown_tx,
        })
    }
}

impl Mesh for TcpMesh {
    fn index(&self) -> WorkerIndex {
        self.index
    }

    fn count(&self) -> WorkerCount {
        self.count
    }

    fn send(&mut self, to: WorkerIndex, frame: WireFrame) -> Result<()> {
        if to == self.index {
            // Loopback never touches a socket.
            return self
                .inbox_tx
                .send((self.index, frame))
                .map_err(|_hung_up| EngineError::PeerUnreachable { peer: to, epoch: 0 });
        }
        let outbox = self.outboxes.get(&to).ok_or_else(|| EngineError::Config(format!(
            "no connection to worker {to:?}"
        )))?;
        outbox
            .send(frame)
            .map_err(|_hung_up| EngineError::PeerUnreachable { peer: to, epoch: 0 })
    }

    fn try_recv(&mut self) -> Result<Option<(WorkerIndex, WireFrame)>> {
        match self.inbox.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Ok(None),
        }
    }
}

type Outboxes = HashMap<WorkerIndex, mpsc::UnboundedSender<WireFrame>>;

/// Runtime thread body.
fn run_mesh(
    addresses: Vec<String>,
    index: WorkerIndex,
    handshake_timeout: Duration,
    inbox_tx: mpsc::UnboundedSender<(WorkerIndex, WireFrame)>,
    ready_tx: std::sync::mpsc::Sender<Result<Outboxes>>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            let _ = ready_tx.send(Err(err.into()));
            return;
        }
    };

    rt.block_on(async move {
        match setup_mesh(&addresses, index, handshake_timeout, inbox_tx).await {
            Ok(outboxes) => {
                if ready_tx.send(Ok(outboxes)).is_err() {
                    return;
                }
                // Keep the reader and writer tasks alive until the
                // worker drops its TcpMesh.
                let _ = shutdown_rx.await;
            }
            Err(err) => {
                let _ = ready_tx.send(Err(err));
            }
        }
    });
}

async fn setup_mesh(
    addresses: &[String],
    index: WorkerIndex,
    handshake_timeout: Duration,
    inbox_tx: mpsc::UnboundedSender<(WorkerIndex, WireFrame)>,
) -> Result<Outboxes> {
    let listener = TcpListener::bind(&addresses[index.0]).await?;
    tracing::info!("Worker {index:?} listening on {}", addresses[index.0]);

    let peers: Vec<WorkerIndex> = (0..addresses.len())
        .map(WorkerIndex)
        .filter(|peer| *peer != index)
        .collect();

    // Accept inbound connections as they come; each reader reports
    // the peer it completed a handshake with.
    let (hello_tx, mut hello_rx) = mpsc::unbounded_channel();
    let accept_inbox_tx = inbox_tx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _addr)) => {
                    let inbox_tx = accept_inbox_tx.clone();
                    let hello_tx = hello_tx.clone();
                    tokio::spawn(read_peer(socket, inbox_tx, hello_tx));
                }
                Err(err) => {
                    tracing::warn!("Mesh accept error: {err}");
                    break;
                }
            }
        }
    });

    // Dial everyone else, retrying while they start up.
    let deadline = tokio::time::Instant::now() + handshake_timeout;
    let mut outboxes = HashMap::new();
    for peer in &peers {
        let stream = dial(&addresses[peer.0], deadline)
            .await
            .ok_or(EngineError::PeerUnreachable {
                peer: *peer,
                epoch: 0,
            })?;
        let (read_half, mut write_half) = stream.into_split();
        // We never read from connections we dialed; each direction
        // gets its own connection.
        drop(read_half);

        write_half
            .write_all(&WireFrame::Hello { index }.encode()?)
            .await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireFrame>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::error!("Dropping unencodable frame: {err}");
                        continue;
                    }
                };
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });
        outboxes.insert(*peer, out_tx);
    }

    // Wait for every peer to dial us too.
    let mut pending: HashSet<WorkerIndex> = peers.iter().copied().collect();
    while !pending.is_empty() {
        let hello = tokio::time::timeout_at(deadline, hello_rx.recv()).await;
        match hello {
            Ok(Some(peer)) => {
                pending.remove(&peer);
            }
            Ok(None) | Err(_) => {
                // The loop guard ensures there's a pending peer.
                let peer = pending.iter().copied().min().unwrap_or(index);
                return Err(EngineError::PeerUnreachable { peer, epoch: 0 });
            }
        }
    }

    tracing::info!("Worker {index:?} mesh of {} established", addresses.len());
    Ok(outboxes)
}

async fn dial(address: &str, deadline: tokio::time::Instant) -> Option<TcpStream> {
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => return Some(stream),
            Err(_not_up_yet) => {
                if tokio::time::Instant::now() + DIAL_RETRY_INTERVAL >= deadline {
                    return None;
                }
                tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
            }
        }
    }
}

/// Read frames off one inbound connection for its whole life.
async fn read_peer(
    socket: TcpStream,
    inbox_tx: mpsc::UnboundedSender<(WorkerIndex, WireFrame)>,
    hello_tx: mpsc::UnboundedSender<WorkerIndex>,
) {
    let (mut read_half, write_half) = socket.into_split();
    drop(write_half);

    let peer = match read_frame(&mut read_half).await {
        Ok(Some(WireFrame::Hello { index })) => index,
        Ok(other) => {
            tracing::warn!("Inbound connection did not start with Hello: {other:?}");
            return;
        }
        Err(err) => {
            tracing::warn!("Error reading handshake: {err}");
            return;
        }
    };
    if hello_tx.send(peer).is_err() {
        return;
    }

    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(frame)) => {
                if inbox_tx.send((peer, frame)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("Error reading from peer {peer:?}: {err}");
                return;
            }
        }
    }
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> Result<Option<WireFrame>> {
    let mut len_buf = [0u8; 4];
    match read_half.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let payload_len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; payload_len];
    read_half.read_exact(&mut payload).await?;
    Ok(Some(WireFrame::decode(&payload)?))
}
