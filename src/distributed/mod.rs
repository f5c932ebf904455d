//! Collective communication for groups of cooperating ranks.
//!
//! Provides:
//! - Broadcast (binomial tree)
//! - All-reduce (ring, recursive doubling, or an in-network aggregation switch)
//! - All-gather and reduce-scatter
//! - Barrier and tagged point-to-point send/recv
//!
//! Calls return a [`Work`] handle immediately. The ordering contract is the
//! usual one for collectives: every rank of a group issues the same
//! collectives in the same order.

use candle_core::{Device, Tensor};

use crate::utils::error::Result;

/// Blocking tensor-in, tensor-out view of a process group.
///
/// Implementations include:
/// - [`ProcessGroup`]: over any [`Transport`], in-process or TCP
pub trait CollectiveCommunicator: Send + Sync {
    /// Get the rank of this process
    fn rank(&self) -> usize;

    /// Get the total number of processes
    fn world_size(&self) -> usize;

    /// All-reduce: combine the tensor across all ranks with `op`.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// All-gather: gather tensors from all ranks, concatenating along dim 0.
    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Broadcast: send tensor from root rank to all others.
    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> Result<Tensor>;

    /// Reduce-scatter: reduce the flattened tensor and keep this rank's chunk.
    fn reduce_scatter(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    fn barrier(&self) -> Result<()>;
}

pub mod algorithms;
pub mod buffer;
pub mod engine;
pub mod groups;
pub mod reduce;
pub mod switch;
pub mod transport;
pub mod types;
pub mod work;

// Re-export commonly used items
pub use algorithms::{Algorithm, AlgorithmEntry, AlgorithmTable};
pub use buffer::{BufferManager, DeviceBuffer, Location, PoolStats, ScratchPool};
pub use groups::{GroupOptions, MemoryRendezvous, ProcessGroup, Rendezvous, StaticRendezvous};
pub use reduce::{ReduceOp, ReductionRegistry};
pub use switch::AggregationSwitch;
pub use transport::{LocalTransport, TcpEndpoint, TcpTransport, Transport, TransportStats};
pub use types::{BackendKind, CollectiveDescriptor, MessageTag, OpCode};
pub use work::{Work, WorkState};

/// Reduce a scalar value across all ranks.
pub fn all_reduce_scalar(value: f64, op: ReduceOp, communicator: &dyn CollectiveCommunicator) -> Result<f64> {
    if communicator.world_size() == 1 {
        return Ok(value);
    }

    let tensor = Tensor::new(&[value], &Device::Cpu)?;
    let reduced = communicator.all_reduce(&tensor, op)?;
    Ok(reduced.to_vec1::<f64>()?[0])
}
