use std::net::SocketAddr;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use super::{write_range, StepContext};
use crate::distributed::reduce::ReduceOp;
use crate::distributed::types::MessageTag;
use crate::distributed::switch::{
    f32_payload, i32_payload, payload_values, quantize, Packet, PacketHeader, PacketKind, CHUNK_ELEMENTS,
    PACKET_HEADER_LEN,
};
use crate::utils::config::SwitchConfig;
use crate::utils::error::{CollectiveError, Result};

/// Whether a call can be served by the aggregation switch.
pub fn eligible(dtype: DType, op: ReduceOp) -> bool {
    dtype == DType::F32 && matches!(op, ReduceOp::Sum | ReduceOp::Avg)
}

/// Tag rank 0 uses to hand out the session. No collective reaches this sequence number.
const SESSION_TAG: MessageTag = MessageTag { seq: u64::MAX, step: 0 };

/// Session id a group stamps on every switch packet.
///
/// Rank 0's random proposal wins. It is sent to the other ranks on a
/// reserved tag the first time the group goes in-network, so agreeing never
/// depends on which collective gets there first.
pub struct SwitchSession {
    proposed: u64,
    agreed: OnceCell<u64>,
}

impl Default for SwitchSession {
    fn default() -> Self {
        Self::new(rand::random())
    }
}

impl SwitchSession {
    pub fn new(proposed: u64) -> Self {
        Self { proposed, agreed: OnceCell::new() }
    }

    pub async fn agree(&self, ctx: &StepContext<'_>) -> Result<u64> {
        self.agreed.get_or_try_init(|| self.exchange(ctx)).await.copied()
    }

    async fn exchange(&self, ctx: &StepContext<'_>) -> Result<u64> {
        if ctx.rank() == 0 {
            let words = Tensor::new(&[self.proposed as u32, (self.proposed >> 32) as u32], &Device::Cpu)?;
            for peer in 1..ctx.world_size() {
                ctx.transport.send(peer, SESSION_TAG, &words).await?;
            }
            debug!(session = self.proposed, "Proposed switch session");
            return Ok(self.proposed);
        }
        let words = tokio::select! {
            r = ctx.transport.recv(0, SESSION_TAG, 2, &Device::Cpu) => r?,
            _ = ctx.work.canceled() => return Err(CollectiveError::Canceled),
        };
        match words.to_vec1::<u32>()?.as_slice() {
            [lo, hi] => Ok(u64::from(*lo) | (u64::from(*hi) << 32)),
            other => Err(CollectiveError::ShapeMismatch(format!(
                "switch session from rank 0 has {} words",
                other.len()
            ))),
        }
    }
}

/// All-reduce through an aggregation switch.
///
/// Chunks go out one at a time and each waits for its aggregated reply.
/// `Avg` divides by the contributor count the switch reports.
pub async fn all_reduce(
    ctx: &StepContext<'_>,
    config: &SwitchConfig,
    session: &SwitchSession,
    data: &Tensor,
    op: ReduceOp,
) -> Result<()> {
    if !eligible(data.dtype(), op) {
        return Err(CollectiveError::UnsupportedOperation { op, dtype: data.dtype() });
    }
    let session = session.agree(ctx).await?;
    let switch: SocketAddr = config
        .address
        .parse()
        .map_err(|e| CollectiveError::Config(format!("switch address '{}': {}", config.address, e)))?;
    let local: SocketAddr = if switch.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(switch).await?;
    let timeout = Duration::from_millis(config.timeout_ms);

    let values = data.to_vec1::<f32>()?;
    let mut result = Vec::with_capacity(values.len());
    let mut buf = vec![0u8; PACKET_HEADER_LEN + CHUNK_ELEMENTS * 4];

    for (offset, chunk) in values.chunks(CHUNK_ELEMENTS).enumerate() {
        ctx.checkpoint()?;
        let payload = if config.quantize {
            i32_payload(&quantize(chunk))
        } else {
            f32_payload(chunk)
        };
        let packet = Packet {
            header: PacketHeader {
                kind: PacketKind::Contribute,
                quantized: config.quantize,
                session,
                seq: ctx.seq,
                rank: ctx.rank() as u32,
                world_size: ctx.world_size() as u32,
                offset: offset as u32,
                data_length: chunk.len() as u32,
            },
            payload,
        };
        socket.send(&packet.encode()).await?;
        trace!(rank = ctx.rank(), offset, "Chunk sent to switch");

        let reply = loop {
            let received = tokio::select! {
                r = tokio::time::timeout(timeout, socket.recv(&mut buf)) => r,
                _ = ctx.work.canceled() => return Err(CollectiveError::Canceled),
            };
            let len = received
                .map_err(|_| CollectiveError::Connectivity {
                    rank: ctx.rank(),
                    reason: format!("aggregation switch {} did not answer chunk {} in {:?}", switch, offset, timeout),
                })??;
            match Packet::decode(&buf[..len]) {
                Ok(p) if p.header.kind == PacketKind::Result
                    && p.header.session == session
                    && p.header.seq == ctx.seq
                    && p.header.offset == offset as u32 =>
                {
                    break p
                }
                Ok(p) => debug!(seq = p.header.seq, offset = p.header.offset, "Ignoring stale switch reply"),
                Err(e) => debug!(error = %e, "Ignoring malformed switch reply"),
            }
        };

        if reply.header.data_length as usize != chunk.len() {
            return Err(CollectiveError::ShapeMismatch(format!(
                "switch returned {} elements for a chunk of {}",
                reply.header.data_length,
                chunk.len()
            )));
        }
        let mut aggregated = payload_values(&reply.header, &reply.payload);
        if op == ReduceOp::Avg {
            let contributors = reply.header.rank.max(1) as f32;
            aggregated.iter_mut().for_each(|v| *v /= contributors);
        }
        result.extend(aggregated);
    }

    let n = result.len();
    let reduced = Tensor::from_vec(result, n, data.device())?;
    write_range(data, 0, &reduced)
}
