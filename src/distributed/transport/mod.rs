//! Rank-to-rank message movement.
//!
//! Both transports deliver into an [`Inbox`] keyed by `(source rank, tag)`,
//! so messages for different collectives or steps never cross. Delivery is
//! FIFO per key.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::types::MessageTag;
use crate::utils::error::{CollectiveError, Result};

pub mod local;
pub mod tcp;
pub mod wire;

pub use local::LocalTransport;
pub use tcp::{TcpEndpoint, TcpTransport};

/// Point-to-point contract the collective algorithms are written against.
#[async_trait]
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Hand `tensor` to `dst`. Completes once the payload has been copied or
    /// serialized; the caller may reuse its memory afterwards.
    async fn send(&self, dst: usize, tag: MessageTag, tensor: &Tensor) -> Result<()>;

    /// Receive the next message from `src` carrying `tag`, placed on `device`.
    /// Fails with `SizeMismatch` when it holds more than `capacity` elements.
    async fn recv(&self, src: usize, tag: MessageTag, capacity: usize, device: &Device) -> Result<Tensor>;

    /// Tell every peer that collective `seq` failed on this rank.
    async fn abort(&self, seq: u64, reason: &str);

    /// Forget buffered state for a finished collective.
    fn retire(&self, seq: u64);

    fn stats(&self) -> TransportStats;
}

/// Snapshot of transport activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub host_staged_copies: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    host_staged_copies: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        crate::utils::metrics::record_message_sent(bytes);
    }

    pub(crate) fn received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn host_staged(&self) {
        self.host_staged_copies.fetch_add(1, Ordering::Relaxed);
        crate::utils::metrics::record_host_staged_copy();
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            host_staged_copies: self.host_staged_copies.load(Ordering::Relaxed),
        }
    }
}

/// Sequence tags this rank has finished with. Every tag below `watermark` is
/// retired; `above` holds retired tags that finished out of order.
#[derive(Debug, Default)]
struct RetiredTags {
    watermark: u64,
    above: BTreeSet<u64>,
}

impl RetiredTags {
    fn contains(&self, seq: u64) -> bool {
        seq < self.watermark || self.above.contains(&seq)
    }

    fn insert(&mut self, seq: u64) {
        if seq < self.watermark {
            return;
        }
        self.above.insert(seq);
        while self.above.remove(&self.watermark) {
            self.watermark += 1;
        }
    }
}

#[derive(Default)]
struct InboxState {
    queues: HashMap<(usize, MessageTag), VecDeque<Tensor>>,
    aborted: HashMap<u64, (usize, String)>,
    disconnected: HashMap<usize, String>,
    retired: RetiredTags,
}

/// Receive side of one rank.
#[derive(Default)]
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    notify: Notify,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message. Steps of a collective this rank already retired are
    /// dropped, since nothing will ever receive them.
    pub(crate) fn deliver(&self, src: usize, tag: MessageTag, tensor: Tensor) {
        {
            let mut state = self.lock();
            if !tag.is_p2p() && state.retired.contains(tag.seq) {
                trace!(src, seq = tag.seq, step = tag.step, "Dropping message for retired collective");
                return;
            }
            state.queues.entry((src, tag)).or_default().push_back(tensor);
        }
        self.notify.notify_waiters();
    }

    /// Record that `origin` gave up on collective `seq`.
    pub(crate) fn abort(&self, seq: u64, origin: usize, reason: String) {
        {
            let mut state = self.lock();
            if state.retired.contains(seq) {
                trace!(seq, origin, "Ignoring abort notice for retired collective");
                return;
            }
            debug!(seq, origin, reason = %reason, "Abort notice received");
            state.aborted.entry(seq).or_insert((origin, reason));
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn disconnect(&self, peer: usize, reason: String) {
        self.lock().disconnected.entry(peer).or_insert(reason);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_disconnected(&self, peer: usize) -> Option<String> {
        self.lock().disconnected.get(&peer).cloned()
    }

    pub(crate) fn retire(&self, seq: u64) {
        let mut state = self.lock();
        state.retired.insert(seq);
        state.aborted.remove(&seq);
        state.queues.retain(|(_, tag), _| tag.is_p2p() || tag.seq != seq);
    }

    /// Wait for the next message from `src` with `tag`.
    pub(crate) async fn recv(&self, src: usize, tag: MessageTag, capacity: usize) -> Result<Tensor> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                let key = (src, tag);
                if let Some(tensor) = state.queues.get_mut(&key).and_then(VecDeque::pop_front) {
                    if state.queues.get(&key).is_some_and(VecDeque::is_empty) {
                        state.queues.remove(&key);
                    }
                    if tensor.elem_count() > capacity {
                        return Err(CollectiveError::SizeMismatch {
                            expected: capacity,
                            actual: tensor.elem_count(),
                        });
                    }
                    return Ok(tensor);
                }
                if !tag.is_p2p() {
                    if let Some((origin, reason)) = state.aborted.get(&tag.seq) {
                        return Err(CollectiveError::Aborted { rank: *origin, reason: reason.clone() });
                    }
                }
                if let Some(reason) = state.disconnected.get(&src) {
                    return Err(CollectiveError::Connectivity { rank: src, reason: reason.clone() });
                }
            }
            notified.await;
        }
    }
}

pub(crate) fn check_peer(world_size: usize, peer: usize) -> Result<()> {
    if peer >= world_size {
        return Err(CollectiveError::InvalidArgument(format!(
            "rank {} out of range for world size {}",
            peer, world_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn tensor(v: Vec<f32>) -> Tensor {
        let n = v.len();
        Tensor::from_vec(v, n, &Device::Cpu).unwrap()
    }

    #[tokio::test]
    async fn test_inbox_matches_source_and_tag() {
        let inbox = Inbox::new();
        inbox.deliver(1, MessageTag::new(0, 1), tensor(vec![1.0]));
        inbox.deliver(2, MessageTag::new(0, 0), tensor(vec![2.0]));
        inbox.deliver(1, MessageTag::new(0, 0), tensor(vec![3.0]));

        let got = inbox.recv(1, MessageTag::new(0, 0), 1).await.unwrap();
        assert_eq!(got.to_vec1::<f32>().unwrap(), vec![3.0]);
        let got = inbox.recv(2, MessageTag::new(0, 0), 1).await.unwrap();
        assert_eq!(got.to_vec1::<f32>().unwrap(), vec![2.0]);
    }

    #[tokio::test]
    async fn test_inbox_fifo_per_key() {
        let inbox = Inbox::new();
        let tag = MessageTag::p2p(4);
        inbox.deliver(0, tag, tensor(vec![1.0]));
        inbox.deliver(0, tag, tensor(vec![2.0]));
        assert_eq!(inbox.recv(0, tag, 1).await.unwrap().to_vec1::<f32>().unwrap(), vec![1.0]);
        assert_eq!(inbox.recv(0, tag, 1).await.unwrap().to_vec1::<f32>().unwrap(), vec![2.0]);
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let inbox = Inbox::new();
        inbox.deliver(0, MessageTag::new(1, 0), tensor(vec![1.0, 2.0, 3.0]));
        let err = inbox.recv(0, MessageTag::new(1, 0), 2).await.unwrap_err();
        assert_eq!(err, CollectiveError::SizeMismatch { expected: 2, actual: 3 });
    }

    #[tokio::test]
    async fn test_abort_wakes_blocked_recv() {
        let inbox = Arc::new(Inbox::new());
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.recv(3, MessageTag::new(8, 2), 4).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        inbox.abort(8, 3, "peer failed".to_string());
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CollectiveError::Aborted { rank: 3, .. }));

        inbox.retire(8);
        inbox.deliver(3, MessageTag::new(9, 2), tensor(vec![1.0]));
        assert!(inbox.recv(3, MessageTag::new(9, 2), 4).await.is_ok());
    }

    #[tokio::test]
    async fn test_late_traffic_for_retired_tags_is_dropped() {
        let inbox = Inbox::new();
        inbox.retire(2);
        inbox.retire(0);
        inbox.deliver(1, MessageTag::new(2, 3), tensor(vec![1.0]));
        inbox.deliver(1, MessageTag::new(0, 1), tensor(vec![1.0]));
        inbox.abort(0, 1, "late".to_string());
        inbox.deliver(1, MessageTag::p2p(0), tensor(vec![5.0]));
        {
            let state = inbox.lock();
            assert_eq!(state.queues.len(), 1);
            assert!(state.aborted.is_empty());
            assert_eq!(state.retired.watermark, 1);
            assert_eq!(state.retired.above.iter().copied().collect::<Vec<_>>(), vec![2]);
        }

        inbox.retire(1);
        let state = inbox.lock();
        assert_eq!(state.retired.watermark, 3);
        assert!(state.retired.above.is_empty());
        assert!(state.retired.contains(1));
        assert!(!state.retired.contains(3));
    }

    #[tokio::test]
    async fn test_disconnect_fails_recv() {
        let inbox = Inbox::new();
        inbox.disconnect(2, "connection reset".to_string());
        let err = inbox.recv(2, MessageTag::p2p(0), 1).await.unwrap_err();
        assert!(matches!(err, CollectiveError::Connectivity { rank: 2, .. }));
    }
}
