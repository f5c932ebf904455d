//! In-network aggregation switch.
//!
//! Ranks send their all-reduce payload in fixed-size chunks over UDP. Once a
//! chunk has arrived from every rank the switch reduces it and answers every
//! contributor with the result and the number of contributions folded in.
//! Payloads are either raw `f32` or fixed-point `i32` (`value * 10000`).
//!
//! Chunks are keyed by `(session, seq, offset)`. Each process group picks a
//! random session, so groups sharing a switch, or a group restarted after a
//! failure, never fold into each other's chunks. Partial chunks are dropped
//! once they have waited longer than the switch's expiry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::{Device, Tensor};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::reduce::{ReduceOp, ReductionRegistry};
use crate::utils::error::{CollectiveError, Result};

/// Elements per UDP packet.
pub const CHUNK_ELEMENTS: usize = 128;
/// Fixed-point scale of quantized payloads.
pub const QUANTIZATION_SCALE: f32 = 10_000.0;
/// Port the switch listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 30000;
/// How long a partial chunk may wait for its remaining contributors.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(10);

const MAGIC: [u8; 4] = *b"INCS";
pub const PACKET_HEADER_LEN: usize = 40;
const MAX_PACKET: usize = PACKET_HEADER_LEN + CHUNK_ELEMENTS * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Contribute,
    Result,
}

/// Header of a switch packet. In results `rank` carries the contributor count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub quantized: bool,
    pub session: u64,
    pub seq: u64,
    pub rank: u32,
    pub world_size: u32,
    pub offset: u32,
    pub data_length: u32,
}

/// One switch datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    /// Raw little-endian element bytes (`f32` or `i32`).
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut buf = Vec::with_capacity(PACKET_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(match h.kind {
            PacketKind::Contribute => 0,
            PacketKind::Result => 1,
        });
        buf.push(u8::from(h.quantized));
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&h.seq.to_le_bytes());
        buf.extend_from_slice(&h.rank.to_le_bytes());
        buf.extend_from_slice(&h.world_size.to_le_bytes());
        buf.extend_from_slice(&h.offset.to_le_bytes());
        buf.extend_from_slice(&h.data_length.to_le_bytes());
        buf.extend_from_slice(&h.session.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PACKET_HEADER_LEN || buf[0..4] != MAGIC {
            return Err(CollectiveError::Io("malformed switch packet".to_string()));
        }
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let kind = match buf[4] {
            0 => PacketKind::Contribute,
            1 => PacketKind::Result,
            other => return Err(CollectiveError::Io(format!("unknown switch packet kind {}", other))),
        };
        let header = PacketHeader {
            kind,
            quantized: buf[5] != 0,
            session: u64_at(32),
            seq: u64_at(8),
            rank: u32_at(16),
            world_size: u32_at(20),
            offset: u32_at(24),
            data_length: u32_at(28),
        };
        let payload = buf[PACKET_HEADER_LEN..].to_vec();
        if payload.len() != header.data_length as usize * 4 {
            return Err(CollectiveError::ShapeMismatch(format!(
                "switch packet announces {} elements but carries {} bytes",
                header.data_length,
                payload.len()
            )));
        }
        Ok(Self { header, payload })
    }
}

pub fn quantize(values: &[f32]) -> Vec<i32> {
    values.iter().map(|v| (v * QUANTIZATION_SCALE).round() as i32).collect()
}

pub fn dequantize(values: &[i32]) -> Vec<f32> {
    values.iter().map(|&v| v as f32 / QUANTIZATION_SCALE).collect()
}

fn le_f32(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn le_i32(payload: &[u8]) -> Vec<i32> {
    payload
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn f32_payload(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i32_payload(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a payload into `f32` values, undoing quantization.
pub fn payload_values(header: &PacketHeader, payload: &[u8]) -> Vec<f32> {
    if header.quantized {
        dequantize(&le_i32(payload))
    } else {
        le_f32(payload)
    }
}

struct PendingChunk {
    world_size: u32,
    quantized: bool,
    data_length: u32,
    first_seen: Instant,
    contributors: Vec<(u32, SocketAddr)>,
    reduced: Option<Tensor>,
}

/// Counters exposed by a running switch.
#[derive(Debug, Default)]
pub struct SwitchStats {
    pub packets_received: AtomicU64,
    pub chunks_aggregated: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub chunks_expired: AtomicU64,
}

type ChunkKey = (u64, u64, u32);

/// UDP aggregation server.
pub struct AggregationSwitch {
    socket: UdpSocket,
    registry: ReductionRegistry,
    pending: HashMap<ChunkKey, PendingChunk>,
    stats: Arc<SwitchStats>,
    expiry: Duration,
    last_sweep: Instant,
}

impl AggregationSwitch {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            registry: ReductionRegistry::default(),
            pending: HashMap::new(),
            stats: Arc::new(SwitchStats::default()),
            expiry: DEFAULT_EXPIRY,
            last_sweep: Instant::now(),
        })
    }

    /// Drop partial chunks after they have waited `expiry`.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> Arc<SwitchStats> {
        self.stats.clone()
    }

    /// Serve until the task is dropped or the socket fails.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Aggregation switch listening");
        let mut buf = vec![0u8; MAX_PACKET * 2];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
            let packet = match Packet::decode(&buf[..len]) {
                Ok(p) if p.header.kind == PacketKind::Contribute => p,
                Ok(_) => {
                    self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => {
                    warn!(%from, error = %e, "Dropping packet");
                    self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if let Err(e) = self.handle(packet, from).await {
                warn!(%from, error = %e, "Failed to aggregate chunk");
            }
        }
    }

    /// Forget partial chunks older than the expiry. Runs at most a few times
    /// per expiry period.
    fn expire_stale(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < self.expiry / 4 {
            return;
        }
        self.last_sweep = now;
        let expiry = self.expiry;
        let before = self.pending.len();
        self.pending.retain(|_, chunk| now.duration_since(chunk.first_seen) < expiry);
        let expired = before - self.pending.len();
        if expired > 0 {
            self.stats.chunks_expired.fetch_add(expired as u64, Ordering::Relaxed);
            debug!(expired, "Expired partial chunks");
        }
    }

    async fn handle(&mut self, packet: Packet, from: SocketAddr) -> Result<()> {
        let now = Instant::now();
        self.expire_stale(now);

        let h = packet.header;
        let key = (h.session, h.seq, h.offset);
        let entry = self.pending.entry(key).or_insert_with(|| PendingChunk {
            world_size: h.world_size,
            quantized: h.quantized,
            data_length: h.data_length,
            first_seen: now,
            contributors: Vec::new(),
            reduced: None,
        });
        if entry.world_size != h.world_size || entry.quantized != h.quantized || entry.data_length != h.data_length {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(CollectiveError::ShapeMismatch(format!(
                "rank {} disagrees on chunk {} of collective {} in session {:x}",
                h.rank, h.offset, h.seq, h.session
            )));
        }
        if entry.contributors.iter().any(|(rank, _)| *rank == h.rank) {
            // Retransmission.
            return Ok(());
        }

        // Quantized chunks reduce as i64 to keep headroom over i32.
        let contribution = if h.quantized {
            let values: Vec<i64> = le_i32(&packet.payload).into_iter().map(i64::from).collect();
            let n = values.len();
            Tensor::from_vec(values, n, &Device::Cpu)?
        } else {
            let values = le_f32(&packet.payload);
            let n = values.len();
            Tensor::from_vec(values, n, &Device::Cpu)?
        };
        entry.reduced = Some(match entry.reduced.take() {
            Some(acc) => self.registry.combine(ReduceOp::Sum, &acc, &contribution)?,
            None => contribution,
        });
        entry.contributors.push((h.rank, from));

        if entry.contributors.len() < entry.world_size as usize {
            return Ok(());
        }

        let Some(done) = self.pending.remove(&key) else {
            return Ok(());
        };
        let reduced = done
            .reduced
            .ok_or_else(|| CollectiveError::Io("chunk completed without data".to_string()))?;
        let (payload, data_length) = if done.quantized {
            let values: Vec<i32> = reduced
                .to_vec1::<i64>()?
                .into_iter()
                .map(|v| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
                .collect();
            (i32_payload(&values), values.len())
        } else {
            let values = reduced.to_vec1::<f32>()?;
            (f32_payload(&values), values.len())
        };
        let reply = Packet {
            header: PacketHeader {
                kind: PacketKind::Result,
                quantized: done.quantized,
                session: h.session,
                seq: h.seq,
                rank: done.contributors.len() as u32,
                world_size: done.world_size,
                offset: h.offset,
                data_length: data_length as u32,
            },
            payload,
        }
        .encode();
        for (_, addr) in &done.contributors {
            self.socket.send_to(&reply, addr).await?;
        }
        self.stats.chunks_aggregated.fetch_add(1, Ordering::Relaxed);
        debug!(seq = h.seq, offset = h.offset, contributors = done.contributors.len(), "Chunk aggregated");
        Ok(())
    }
}
