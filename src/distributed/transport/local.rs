use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use tracing::{debug, warn};

use super::{check_peer, Inbox, StatsCounters, Transport, TransportStats};
use crate::distributed::buffer::owned_copy;
use crate::distributed::types::MessageTag;
use crate::utils::error::{CollectiveError, Result};

struct SharedState {
    inboxes: Vec<Inbox>,
    severed: Mutex<HashSet<(usize, usize)>>,
}

/// In-process transport connecting the ranks of one simulated group.
///
/// Tensors move between ranks by copy. When sender and receiver share a
/// device no host round trip happens.
pub struct LocalTransport {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
    stats: StatsCounters,
}

impl LocalTransport {
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedState {
            inboxes: (0..world_size).map(|_| Inbox::new()).collect(),
            severed: Mutex::new(HashSet::new()),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
                stats: StatsCounters::default(),
            })
            .collect()
    }

    /// Cut the link between this rank and `peer` in both directions.
    pub fn sever(&self, peer: usize) {
        warn!(rank = self.rank, peer, "Severing local link");
        self.shared
            .severed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([(self.rank, peer), (peer, self.rank)]);
        let reason = format!("link {}<->{} severed", self.rank, peer);
        if let Some(inbox) = self.shared.inboxes.get(self.rank) {
            inbox.disconnect(peer, reason.clone());
        }
        if let Some(inbox) = self.shared.inboxes.get(peer) {
            inbox.disconnect(self.rank, reason);
        }
    }

    fn is_severed(&self, peer: usize) -> bool {
        self.shared
            .severed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(self.rank, peer))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn send(&self, dst: usize, tag: MessageTag, tensor: &Tensor) -> Result<()> {
        check_peer(self.world_size, dst)?;
        if self.is_severed(dst) {
            return Err(CollectiveError::Connectivity {
                rank: dst,
                reason: "link severed".to_string(),
            });
        }
        let payload = owned_copy(tensor)?;
        let bytes = payload.elem_count() * payload.dtype().size_in_bytes();
        self.shared.inboxes[dst].deliver(self.rank, tag, payload);
        self.stats.sent(bytes);
        Ok(())
    }

    async fn recv(&self, src: usize, tag: MessageTag, capacity: usize, device: &Device) -> Result<Tensor> {
        check_peer(self.world_size, src)?;
        let tensor = self.shared.inboxes[self.rank].recv(src, tag, capacity).await?;
        self.stats.received();
        if tensor.device().same_device(device) {
            Ok(tensor)
        } else {
            self.stats.host_staged();
            Ok(tensor.to_device(device)?)
        }
    }

    async fn abort(&self, seq: u64, reason: &str) {
        for peer in (0..self.world_size).filter(|&p| p != self.rank) {
            if self.is_severed(peer) {
                continue;
            }
            self.shared.inboxes[peer].abort(seq, self.rank, reason.to_string());
        }
        debug!(rank = self.rank, seq, "Abort notices delivered");
    }

    fn retire(&self, seq: u64) {
        self.shared.inboxes[self.rank].retire(seq);
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}
