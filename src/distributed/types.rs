//! Shared descriptors for collectives: opcodes, tags, backend selection and
//! chunk layout.

use std::fmt;
use std::ops::Range;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::buffer::DeviceBuffer;
use super::reduce::ReduceOp;
use crate::utils::config::BackendChoice;
use crate::utils::error::{CollectiveError, Result};

/// Kind of operation a `Work` tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    Broadcast,
    AllReduce,
    AllGather,
    ReduceScatter,
    Barrier,
    Send,
    Recv,
}

impl OpCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Broadcast => "broadcast",
            OpCode::AllReduce => "all_reduce",
            OpCode::AllGather => "all_gather",
            OpCode::ReduceScatter => "reduce_scatter",
            OpCode::Barrier => "barrier",
            OpCode::Send => "send",
            OpCode::Recv => "recv",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step value reserved for user point-to-point messages.
pub const P2P_STEP: u32 = u32::MAX;

/// Identifies one logical message: the collective's sequence tag plus the
/// algorithm step it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTag {
    pub seq: u64,
    pub step: u32,
}

impl MessageTag {
    pub fn new(seq: u64, step: u32) -> Self {
        Self { seq, step }
    }

    /// Tag for a user-level send/recv pair.
    pub fn p2p(tag: u64) -> Self {
        Self { seq: tag, step: P2P_STEP }
    }

    pub fn is_p2p(&self) -> bool {
        self.step == P2P_STEP
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_p2p() {
            write!(f, "{}/p2p", self.seq)
        } else {
            write!(f, "{}/{}", self.seq, self.step)
        }
    }
}

/// Everything the engine needs to run one collective.
#[derive(Debug, Clone)]
pub struct CollectiveDescriptor {
    pub opcode: OpCode,
    pub input: DeviceBuffer,
    pub output: DeviceBuffer,
    pub reduce_op: Option<ReduceOp>,
    pub root: Option<usize>,
    pub sequence_tag: u64,
}

impl CollectiveDescriptor {
    pub fn message_bytes(&self) -> usize {
        self.input.size_in_bytes()
    }

    /// Whether the output buffer aliases the input.
    pub fn is_in_place(&self) -> bool {
        self.input.aliases(&self.output)
    }
}

/// Compute path of a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    CpuReference,
    AcceleratorCompute,
}

impl BackendKind {
    /// Whether this build carries an accelerator device.
    pub fn accelerator_compiled() -> bool {
        candle_core::utils::cuda_is_available() || candle_core::utils::metal_is_available()
    }

    /// Resolve a configured choice into a backend and its compute device.
    pub fn resolve(choice: BackendChoice, ordinal: usize) -> Result<(Self, Device)> {
        let kind = match choice {
            BackendChoice::Cpu => BackendKind::CpuReference,
            BackendChoice::Accelerator if !Self::accelerator_compiled() => {
                return Err(CollectiveError::Config(
                    "accelerator backend requested but this build has neither the cuda nor the metal feature"
                        .to_string(),
                ))
            }
            BackendChoice::Accelerator => BackendKind::AcceleratorCompute,
            BackendChoice::Auto if Self::accelerator_compiled() => BackendKind::AcceleratorCompute,
            BackendChoice::Auto => BackendKind::CpuReference,
        };

        let device = match kind {
            BackendKind::CpuReference => Device::Cpu,
            BackendKind::AcceleratorCompute if candle_core::utils::cuda_is_available() => {
                Device::new_cuda(ordinal)?
            }
            BackendKind::AcceleratorCompute => Device::new_metal(ordinal)?,
        };
        info!(backend = ?kind, device = ?device.location(), "Resolved compute backend");
        Ok((kind, device))
    }
}

/// Split `count` elements into `parts` contiguous ranges. The first
/// `count % parts` ranges get one extra element.
pub fn chunk_ranges(count: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }
    let base = count / parts;
    let remainder = count % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let len = base + usize::from(i < remainder);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// Range of chunk `index` out of `parts`.
pub fn chunk_range(count: usize, parts: usize, index: usize) -> Range<usize> {
    let base = count / parts;
    let remainder = count % parts;
    let start = index * base + index.min(remainder);
    start..start + base + usize::from(index < remainder)
}
