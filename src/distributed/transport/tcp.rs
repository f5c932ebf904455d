use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::wire::{tensor_from_bytes, Frame};
use super::{check_peer, Inbox, StatsCounters, Transport, TransportStats};
use crate::distributed::buffer::owned_copy;
use crate::distributed::types::MessageTag;
use crate::utils::error::{CollectiveError, Result};
use crate::utils::retry::{retry_with_backoff, RetryPolicy};

/// A frame queued for a peer's writer task, with the slot its outcome is reported on.
struct Outgoing {
    frame: Frame,
    done: oneshot::Sender<Result<()>>,
}

type Writer = mpsc::UnboundedSender<Outgoing>;

/// A bound listener that has not yet joined its group.
pub struct TcpEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpEndpoint {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connect to every peer in `addrs` and return the live transport.
    ///
    /// Lower ranks accept, higher ranks connect. Both sides exchange a hello
    /// frame and drop peers that disagree on the world size.
    pub async fn establish(
        self,
        rank: usize,
        addrs: &[SocketAddr],
        policy: &RetryPolicy,
    ) -> Result<TcpTransport> {
        let world_size = addrs.len();
        check_peer(world_size, rank)?;
        info!(rank, world_size, addr = %self.local_addr, "Establishing TCP transport");

        // Accepting side waits as long as a connecting peer would keep retrying.
        let accept_window = policy.max_delay.saturating_mul(policy.max_retries + 1);

        let accept_all = async {
            let mut streams = Vec::new();
            for _ in rank + 1..world_size {
                let (stream, from) = tokio::time::timeout(accept_window, self.listener.accept())
                    .await
                    .map_err(|_| CollectiveError::Connectivity {
                        rank,
                        reason: "timed out waiting for higher ranks to connect".to_string(),
                    })??;
                stream.set_nodelay(true)?;
                let (mut read, mut write) = stream.into_split();
                let peer = match Frame::read_from(&mut read).await? {
                    Frame::Hello { rank: peer, world_size: theirs } => {
                        if theirs != world_size {
                            return Err(CollectiveError::Config(format!(
                                "peer at {} reports world size {} but this group has {}",
                                from, theirs, world_size
                            )));
                        }
                        check_peer(world_size, peer)?;
                        peer
                    }
                    other => {
                        return Err(CollectiveError::Io(format!(
                            "expected hello from {}, got {:?}",
                            from, other
                        )))
                    }
                };
                Frame::Hello { rank, world_size }.write_to(&mut write).await?;
                debug!(rank, peer, %from, "Accepted peer");
                streams.push((peer, read, write));
            }
            Ok::<_, CollectiveError>(streams)
        };

        let connect_all = async {
            let mut streams = Vec::new();
            for (peer, addr) in addrs.iter().enumerate().take(rank) {
                let stream = retry_with_backoff(
                    move || async move {
                        TcpStream::connect(addr).await.map_err(|e| CollectiveError::Connectivity {
                            rank: peer,
                            reason: e.to_string(),
                        })
                    },
                    policy,
                )
                .await?;
                stream.set_nodelay(true)?;
                let (mut read, mut write) = stream.into_split();
                Frame::Hello { rank, world_size }.write_to(&mut write).await?;
                match Frame::read_from(&mut read).await {
                    Ok(Frame::Hello { rank: theirs, world_size: their_world }) => {
                        if theirs != peer || their_world != world_size {
                            return Err(CollectiveError::Config(format!(
                                "{} answered as rank {} of {}, expected rank {} of {}",
                                addr, theirs, their_world, peer, world_size
                            )));
                        }
                    }
                    Ok(other) => {
                        return Err(CollectiveError::Io(format!("expected hello from {}, got {:?}", addr, other)))
                    }
                    Err(e) => {
                        return Err(CollectiveError::Connectivity {
                            rank: peer,
                            reason: format!("handshake rejected: {}", e),
                        })
                    }
                }
                debug!(rank, peer, %addr, "Connected to peer");
                streams.push((peer, read, write));
            }
            Ok::<_, CollectiveError>(streams)
        };

        let (accepted, connected) = tokio::try_join!(accept_all, connect_all)?;

        let inbox = Arc::new(Inbox::new());
        let mut writers = HashMap::new();
        let mut readers = Vec::new();
        for (peer, read, write) in accepted.into_iter().chain(connected) {
            let (tx, rx) = mpsc::unbounded_channel();
            writers.insert(peer, tx);
            tokio::spawn(write_loop(peer, write, rx, inbox.clone()));
            readers.push(tokio::spawn(read_loop(peer, read, inbox.clone())));
        }
        info!(rank, world_size, "TCP transport ready");

        Ok(TcpTransport {
            rank,
            world_size,
            inbox,
            writers: Mutex::new(writers),
            readers: Mutex::new(readers),
            stats: StatsCounters::default(),
        })
    }
}

async fn read_loop(peer: usize, mut read: OwnedReadHalf, inbox: Arc<Inbox>) {
    loop {
        match Frame::read_from(&mut read).await {
            Ok(Frame::Data { tag, dtype, payload }) => match tensor_from_bytes(&payload, dtype) {
                Ok(tensor) => inbox.deliver(peer, tag, tensor),
                Err(e) => {
                    warn!(peer, error = %e, "Dropping undecodable frame");
                    inbox.disconnect(peer, e.to_string());
                    return;
                }
            },
            Ok(Frame::Abort { seq, origin, reason }) => inbox.abort(seq, origin, reason),
            Ok(Frame::Hello { .. }) => {
                warn!(peer, "Ignoring hello on an established connection");
            }
            Err(e) => {
                debug!(peer, error = %e, "Peer connection closed");
                inbox.disconnect(peer, e.to_string());
                return;
            }
        }
    }
}

/// Owns the write half of one peer connection.
///
/// Frames are written whole even when the sender stops waiting, so dropping a
/// send future never leaves a partial frame on the stream. Exits when the
/// transport drops its sender, which closes the write half.
async fn write_loop(peer: usize, mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outgoing>, inbox: Arc<Inbox>) {
    while let Some(Outgoing { frame, done }) = rx.recv().await {
        if let Err(e) = frame.write_to(&mut write).await {
            let reason = e.to_string();
            debug!(peer, error = %reason, "Peer write failed");
            inbox.disconnect(peer, reason.clone());
            let _ = done.send(Err(CollectiveError::Connectivity { rank: peer, reason }));
            return;
        }
        let _ = done.send(Ok(()));
    }
}

/// Transport over one TCP connection per rank pair.
///
/// Payloads always travel through host memory.
pub struct TcpTransport {
    rank: usize,
    world_size: usize,
    inbox: Arc<Inbox>,
    writers: Mutex<HashMap<usize, Writer>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    stats: StatsCounters,
}

impl TcpTransport {
    /// Bind the listening socket for this rank. Use port 0 for an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> Result<TcpEndpoint> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(TcpEndpoint { listener, local_addr })
    }

    fn writers(&self) -> MutexGuard<'_, HashMap<usize, Writer>> {
        self.writers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self, peer: usize) -> Result<Writer> {
        if let Some(reason) = self.inbox.is_disconnected(peer) {
            return Err(CollectiveError::Connectivity { rank: peer, reason });
        }
        self.writers().get(&peer).cloned().ok_or_else(|| CollectiveError::Connectivity {
            rank: peer,
            reason: "no connection".to_string(),
        })
    }

    async fn write_frame(&self, peer: usize, frame: Frame) -> Result<()> {
        let writer = self.writer(peer)?;
        let closed = || CollectiveError::Connectivity { rank: peer, reason: "connection writer closed".to_string() };
        let (done, outcome) = oneshot::channel();
        if writer.send(Outgoing { frame, done }).is_err() {
            self.writers().remove(&peer);
            return Err(closed());
        }
        match outcome.await {
            Ok(result) => {
                if result.is_err() {
                    self.writers().remove(&peer);
                }
                result
            }
            Err(_) => Err(closed()),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for handle in self.readers.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn send(&self, dst: usize, tag: MessageTag, tensor: &Tensor) -> Result<()> {
        check_peer(self.world_size, dst)?;
        if dst == self.rank {
            self.inbox.deliver(self.rank, tag, owned_copy(tensor)?);
            self.stats.sent(tensor.elem_count() * tensor.dtype().size_in_bytes());
            return Ok(());
        }
        if !tensor.device().is_cpu() {
            self.stats.host_staged();
        }
        let frame = Frame::data(tag, tensor)?;
        let bytes = match &frame {
            Frame::Data { payload, .. } => payload.len(),
            _ => 0,
        };
        self.write_frame(dst, frame).await?;
        self.stats.sent(bytes);
        Ok(())
    }

    async fn recv(&self, src: usize, tag: MessageTag, capacity: usize, device: &Device) -> Result<Tensor> {
        check_peer(self.world_size, src)?;
        let tensor = self.inbox.recv(src, tag, capacity).await?;
        self.stats.received();
        if device.is_cpu() {
            Ok(tensor)
        } else {
            self.stats.host_staged();
            Ok(tensor.to_device(device)?)
        }
    }

    async fn abort(&self, seq: u64, reason: &str) {
        let frame = Frame::Abort { seq, origin: self.rank, reason: reason.to_string() };
        for peer in (0..self.world_size).filter(|&p| p != self.rank) {
            let sent = tokio::time::timeout(Duration::from_secs(5), self.write_frame(peer, frame.clone())).await;
            if !matches!(sent, Ok(Ok(()))) {
                debug!(rank = self.rank, peer, seq, "Could not deliver abort notice");
            }
        }
    }

    fn retire(&self, seq: u64) {
        self.inbox.retire(seq);
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}
