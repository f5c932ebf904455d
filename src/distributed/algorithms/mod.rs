//! Collective algorithms and the strategy table that picks between them.
//!
//! Every algorithm works on a 1-D tensor on the compute device and talks to
//! peers only through a [`StepContext`], which tags messages with the
//! collective's sequence number and a per-algorithm step index.

use std::fmt;
use std::ops::Range;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use super::reduce::{ReduceOp, ReductionRegistry};
use super::transport::Transport;
use super::types::{MessageTag, OpCode};
use super::work::Work;
use crate::utils::config::CollectiveConfig;
use crate::utils::error::{CollectiveError, Result};

pub mod doubling;
pub mod ring;
pub mod switch;
pub mod tree;

/// Concrete algorithm a collective runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    BinomialTree,
    Ring,
    RecursiveDoubling,
    /// Reduce-scatter only: halve the owned range each round.
    RecursiveHalving,
    /// Reduction performed by an aggregation switch.
    InNetwork,
    /// Single-rank copy.
    Local,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::BinomialTree => "binomial_tree",
            Algorithm::Ring => "ring",
            Algorithm::RecursiveDoubling => "recursive_doubling",
            Algorithm::RecursiveHalving => "recursive_halving",
            Algorithm::InNetwork => "in_network",
            Algorithm::Local => "local",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the strategy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmEntry {
    pub opcode: OpCode,
    /// Message sizes in bytes this row applies to.
    pub bytes: Range<usize>,
    pub algorithm: Algorithm,
}

/// Ordered table mapping `(opcode, message size)` to an algorithm.
/// The first matching row wins.
#[derive(Debug, Clone, Default)]
pub struct AlgorithmTable {
    entries: Vec<AlgorithmEntry>,
}

impl AlgorithmTable {
    pub fn new(entries: Vec<AlgorithmEntry>) -> Self {
        Self { entries }
    }

    pub fn from_config(config: &CollectiveConfig) -> Self {
        let small = config.small_message_threshold_bytes;
        let ring_gather = config.all_gather_ring_threshold_bytes;
        let mut entries = Vec::new();
        if config.switch.is_some() {
            entries.push(AlgorithmEntry {
                opcode: OpCode::AllReduce,
                bytes: 0..usize::MAX,
                algorithm: Algorithm::InNetwork,
            });
        }
        entries.extend([
            AlgorithmEntry { opcode: OpCode::Broadcast, bytes: 0..usize::MAX, algorithm: Algorithm::BinomialTree },
            AlgorithmEntry { opcode: OpCode::AllReduce, bytes: 0..small, algorithm: Algorithm::RecursiveDoubling },
            AlgorithmEntry { opcode: OpCode::AllReduce, bytes: small..usize::MAX, algorithm: Algorithm::Ring },
            AlgorithmEntry { opcode: OpCode::ReduceScatter, bytes: 0..small, algorithm: Algorithm::RecursiveHalving },
            AlgorithmEntry { opcode: OpCode::ReduceScatter, bytes: small..usize::MAX, algorithm: Algorithm::Ring },
            AlgorithmEntry { opcode: OpCode::AllGather, bytes: 0..ring_gather, algorithm: Algorithm::RecursiveDoubling },
            AlgorithmEntry { opcode: OpCode::AllGather, bytes: ring_gather..usize::MAX, algorithm: Algorithm::Ring },
            AlgorithmEntry { opcode: OpCode::Barrier, bytes: 0..usize::MAX, algorithm: Algorithm::RecursiveDoubling },
        ]);
        Self { entries }
    }

    /// Put a row in front of every existing one.
    pub fn prepend(&mut self, entry: AlgorithmEntry) {
        self.entries.insert(0, entry);
    }

    pub fn entries(&self) -> &[AlgorithmEntry] {
        &self.entries
    }

    pub fn select(&self, opcode: OpCode, bytes: usize) -> Algorithm {
        self.select_where(opcode, bytes, |_| true)
    }

    /// First matching row whose algorithm passes `allowed`, falling back to
    /// the opcode's default.
    pub fn select_where(&self, opcode: OpCode, bytes: usize, allowed: impl Fn(Algorithm) -> bool) -> Algorithm {
        self.entries
            .iter()
            .find(|e| e.opcode == opcode && e.bytes.contains(&bytes) && allowed(e.algorithm))
            .map(|e| e.algorithm)
            .unwrap_or_else(|| Self::default_for(opcode))
    }

    pub fn default_for(opcode: OpCode) -> Algorithm {
        match opcode {
            OpCode::Broadcast => Algorithm::BinomialTree,
            OpCode::AllReduce | OpCode::ReduceScatter => Algorithm::Ring,
            OpCode::AllGather | OpCode::Barrier => Algorithm::RecursiveDoubling,
            OpCode::Send | OpCode::Recv => Algorithm::Local,
        }
    }
}

/// Per-collective view of the transport, registry and cancellation state.
pub struct StepContext<'a> {
    pub transport: &'a dyn Transport,
    pub registry: &'a ReductionRegistry,
    pub work: &'a Work,
    pub device: &'a Device,
    pub seq: u64,
}

impl<'a> StepContext<'a> {
    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    pub fn tag(&self, step: u32) -> MessageTag {
        MessageTag::new(self.seq, step)
    }

    /// Stop before the next step once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.work.cancel_requested() {
            Err(CollectiveError::Canceled)
        } else {
            Ok(())
        }
    }

    pub async fn send(&self, dst: usize, step: u32, tensor: &Tensor) -> Result<()> {
        self.checkpoint()?;
        tokio::select! {
            sent = self.transport.send(dst, self.tag(step), tensor) => sent,
            _ = self.work.canceled() => Err(CollectiveError::Canceled),
        }
    }

    /// Receive exactly `len` elements of `dtype` from `src`.
    pub async fn recv(&self, src: usize, step: u32, dtype: DType, len: usize) -> Result<Tensor> {
        self.checkpoint()?;
        let tensor = tokio::select! {
            received = self.transport.recv(src, self.tag(step), len, self.device) => match received {
                Err(CollectiveError::SizeMismatch { expected, actual }) => {
                    return Err(CollectiveError::ShapeMismatch(format!(
                        "rank {} step {} expected {} elements from rank {}, got {}",
                        self.rank(),
                        step,
                        expected,
                        src,
                        actual
                    )))
                }
                other => other?,
            },
            _ = self.work.canceled() => return Err(CollectiveError::Canceled),
        };
        if tensor.dtype() != dtype || tensor.elem_count() != len {
            return Err(CollectiveError::ShapeMismatch(format!(
                "rank {} step {} expected {} x {:?} from rank {}, got {} x {:?}",
                self.rank(),
                step,
                len,
                dtype,
                src,
                tensor.elem_count(),
                tensor.dtype()
            )));
        }
        Ok(tensor)
    }

    /// Send to and receive from `peer` concurrently.
    pub async fn exchange(&self, peer: usize, step: u32, outgoing: &Tensor, len: usize) -> Result<Tensor> {
        let (_, incoming) = tokio::try_join!(
            self.send(peer, step, outgoing),
            self.recv(peer, step, outgoing.dtype(), len)
        )?;
        Ok(incoming)
    }

    /// Send to one peer while receiving from another.
    pub async fn shift(
        &self,
        dst: usize,
        src: usize,
        step: u32,
        outgoing: Option<Tensor>,
        incoming: Option<(DType, usize)>,
    ) -> Result<Option<Tensor>> {
        let send = async {
            match &outgoing {
                Some(t) => self.send(dst, step, t).await,
                None => Ok(()),
            }
        };
        let recv = async {
            match incoming {
                Some((dtype, len)) => self.recv(src, step, dtype, len).await.map(Some),
                None => Ok(None),
            }
        };
        let (_, received) = tokio::try_join!(send, recv)?;
        Ok(received)
    }

    pub fn combine(&self, op: ReduceOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.registry.combine(op, a, b)
    }
}

/// Overwrite `range` of `target` with `values`.
pub(crate) fn write_range(target: &Tensor, start: usize, values: &Tensor) -> Result<()> {
    if values.elem_count() > 0 {
        target.slice_set(values, 0, start)?;
    }
    Ok(())
}
