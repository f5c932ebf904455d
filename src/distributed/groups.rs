//! Process group: one rank's handle on a communicating group.
//!
//! A group owns its rank identity, transport, scratch pool and the tokio
//! runtime collectives run on. There is no process-wide state; several groups
//! can live side by side in one process.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info};

use super::algorithms::{Algorithm, AlgorithmTable};
use super::buffer::{owned_copy, BufferManager, DeviceBuffer, PoolStats};
use super::engine::CollectiveEngine;
use super::reduce::{ReduceOp, ReductionRegistry};
use super::transport::{LocalTransport, TcpTransport, Transport, TransportStats};
use super::types::{chunk_range, BackendKind, CollectiveDescriptor, OpCode};
use super::work::Work;
use super::CollectiveCommunicator;
use crate::utils::config::CollectiveConfig;
use crate::utils::error::{CollectiveError, Result};
use crate::utils::metrics;
use crate::utils::retry::RetryPolicy;

/// Source of the address table for a TCP group.
pub trait Rendezvous: Send + Sync {
    /// Address this rank should listen on. Port 0 asks for an ephemeral port.
    fn bind_address(&self, rank: usize) -> Result<SocketAddr>;

    /// Record the address this rank actually listens on.
    fn publish(&self, rank: usize, addr: SocketAddr) -> Result<()>;

    /// Complete table indexed by rank. May block until every rank published.
    fn addresses(&self, world_size: usize) -> Result<Vec<SocketAddr>>;
}

/// Fixed address list known to every rank in advance.
#[derive(Debug, Clone)]
pub struct StaticRendezvous {
    addrs: Vec<SocketAddr>,
}

impl StaticRendezvous {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }
}

impl Rendezvous for StaticRendezvous {
    fn bind_address(&self, rank: usize) -> Result<SocketAddr> {
        self.addrs.get(rank).copied().ok_or_else(|| {
            CollectiveError::Config(format!("no address for rank {} in a table of {}", rank, self.addrs.len()))
        })
    }

    fn publish(&self, _rank: usize, _addr: SocketAddr) -> Result<()> {
        Ok(())
    }

    fn addresses(&self, world_size: usize) -> Result<Vec<SocketAddr>> {
        if self.addrs.len() != world_size {
            return Err(CollectiveError::Config(format!(
                "address table has {} entries for world size {}",
                self.addrs.len(),
                world_size
            )));
        }
        Ok(self.addrs.clone())
    }
}

/// In-process rendezvous where ranks publish ephemeral addresses.
#[derive(Debug)]
pub struct MemoryRendezvous {
    table: Mutex<Vec<Option<SocketAddr>>>,
    ready: Condvar,
    timeout: Duration,
}

impl MemoryRendezvous {
    pub fn new(world_size: usize) -> Self {
        Self {
            table: Mutex::new(vec![None; world_size]),
            ready: Condvar::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// How long `addresses` waits for the slowest rank.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Rendezvous for MemoryRendezvous {
    fn bind_address(&self, _rank: usize) -> Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    fn publish(&self, rank: usize, addr: SocketAddr) -> Result<()> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = table
            .get_mut(rank)
            .ok_or_else(|| CollectiveError::Config(format!("rank {} outside rendezvous table", rank)))?;
        *slot = Some(addr);
        self.ready.notify_all();
        Ok(())
    }

    fn addresses(&self, world_size: usize) -> Result<Vec<SocketAddr>> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.len() != world_size {
            return Err(CollectiveError::Config(format!(
                "rendezvous sized for {} ranks, asked for {}",
                table.len(),
                world_size
            )));
        }
        let wait = self.timeout;
        let (table, result) = self
            .ready
            .wait_timeout_while(table, wait, |t| t.iter().any(Option::is_none))
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            return Err(CollectiveError::TimedOut(wait));
        }
        Ok(table.iter().flatten().copied().collect())
    }
}

enum GroupRuntime {
    Owned(Arc<Runtime>),
    Shared(Handle),
}

impl GroupRuntime {
    fn handle(&self) -> &Handle {
        match self {
            GroupRuntime::Owned(rt) => rt.handle(),
            GroupRuntime::Shared(handle) => handle,
        }
    }
}

fn build_runtime(config: &CollectiveConfig) -> Result<Arc<Runtime>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("inc-collectives")
        .enable_all()
        .build()?;
    Ok(Arc::new(runtime))
}

/// Optional pieces of a group that otherwise come from the config.
#[derive(Default)]
pub struct GroupOptions {
    /// Run collectives on this runtime instead of building one.
    pub runtime: Option<Handle>,
    pub registry: Option<ReductionRegistry>,
    pub table: Option<AlgorithmTable>,
}

/// One rank's view of a group.
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    backend: BackendKind,
    transport: Arc<dyn Transport>,
    engine: Arc<CollectiveEngine>,
    buffers: Arc<BufferManager>,
    registry: Arc<ReductionRegistry>,
    runtime: GroupRuntime,
    next_seq: AtomicU64,
    config: CollectiveConfig,
}

impl ProcessGroup {
    /// Build every rank of an in-process group. The groups share one runtime.
    pub fn new_local_group(world_size: usize, config: CollectiveConfig) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(CollectiveError::InvalidArgument("world size must be at least 1".to_string()));
        }
        config.validate()?;
        let runtime = build_runtime(&config)?;
        LocalTransport::new_group(world_size)
            .into_iter()
            .map(|transport| {
                Self::build(
                    Arc::new(transport),
                    config.clone(),
                    GroupRuntime::Owned(runtime.clone()),
                    GroupOptions::default(),
                )
            })
            .collect()
    }

    /// Join a group over TCP using `rendezvous` to find the other ranks.
    pub fn connect_tcp(
        rank: usize,
        world_size: usize,
        rendezvous: &dyn Rendezvous,
        config: CollectiveConfig,
    ) -> Result<Self> {
        config.validate()?;
        if rank >= world_size {
            return Err(CollectiveError::InvalidArgument(format!(
                "rank {} out of range for world size {}",
                rank, world_size
            )));
        }
        let runtime = build_runtime(&config)?;
        let endpoint = runtime.block_on(TcpTransport::bind(rendezvous.bind_address(rank)?))?;
        rendezvous.publish(rank, endpoint.local_addr())?;
        let addrs = rendezvous.addresses(world_size)?;

        let policy = RetryPolicy {
            max_retries: config.connect_max_retries,
            initial_delay: Duration::from_millis(config.connect_initial_delay_ms),
            ..Default::default()
        };
        let transport = runtime.block_on(endpoint.establish(rank, &addrs, &policy))?;
        Self::build(Arc::new(transport), config, GroupRuntime::Owned(runtime), GroupOptions::default())
    }

    /// Wrap any transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: CollectiveConfig,
        mut options: GroupOptions,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = match options.runtime.take() {
            Some(handle) => GroupRuntime::Shared(handle),
            None => GroupRuntime::Owned(build_runtime(&config)?),
        };
        Self::build(transport, config, runtime, options)
    }

    fn build(
        transport: Arc<dyn Transport>,
        config: CollectiveConfig,
        runtime: GroupRuntime,
        options: GroupOptions,
    ) -> Result<Self> {
        let (backend, device) = BackendKind::resolve(config.backend, config.device_ordinal)?;
        let buffers = Arc::new(BufferManager::new(device, config.scratch_pool_max_bytes));
        let registry = Arc::new(options.registry.unwrap_or_default());
        let table = options.table.unwrap_or_else(|| AlgorithmTable::from_config(&config));
        let engine = Arc::new(CollectiveEngine::new(
            transport.clone(),
            registry.clone(),
            buffers.clone(),
            table,
            config.switch.clone(),
        ));
        let rank = transport.rank();
        let world_size = transport.world_size();
        info!(rank, world_size, backend = ?backend, "Process group ready");

        Ok(Self {
            rank,
            world_size,
            backend,
            transport,
            engine,
            buffers,
            registry,
            runtime,
            next_seq: AtomicU64::new(0),
            config,
        })
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn config(&self) -> &CollectiveConfig {
        &self.config
    }

    /// Device reductions run on.
    pub fn compute_device(&self) -> &Device {
        self.buffers.compute_device()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.buffers.pool_stats()
    }

    pub fn registry(&self) -> &ReductionRegistry {
        &self.registry
    }

    /// Algorithm a collective of this kind and size would run with.
    pub fn algorithm_for(&self, opcode: OpCode, input: &DeviceBuffer, op: Option<ReduceOp>) -> Algorithm {
        self.engine.select(&CollectiveDescriptor {
            opcode,
            input: input.clone(),
            output: input.clone(),
            reduce_op: op,
            root: None,
            sequence_tag: 0,
        })
    }

    fn check_pair(&self, input: &DeviceBuffer, output: &DeviceBuffer, expected_output: usize) -> Result<()> {
        if input.element_type() != output.element_type() {
            return Err(CollectiveError::ShapeMismatch(format!(
                "input is {:?} but output is {:?}",
                input.element_type(),
                output.element_type()
            )));
        }
        if output.element_count() != expected_output {
            return Err(CollectiveError::SizeMismatch {
                expected: expected_output,
                actual: output.element_count(),
            });
        }
        Ok(())
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.world_size {
            return Err(CollectiveError::InvalidArgument(format!(
                "rank {} out of range for world size {}",
                peer, self.world_size
            )));
        }
        Ok(())
    }

    /// Hand a validated call to the engine.
    fn issue(&self, desc: CollectiveDescriptor) -> Result<Work> {
        metrics::record_collective_issued(desc.opcode.as_str());
        if self.world_size == 1 || desc.input.element_count() == 0 {
            return self.complete_locally(desc);
        }
        let work = Work::new(desc.opcode, desc.sequence_tag);
        debug!(rank = self.rank, seq = desc.sequence_tag, op = %desc.opcode, "Issuing collective");
        let engine = self.engine.clone();
        let handle = work.clone();
        self.runtime.handle().spawn(async move {
            engine.execute(desc, handle).await;
        });
        Ok(work)
    }

    /// Single-rank groups and empty buffers: copy input to output and return
    /// an already completed Work without touching the transport.
    fn complete_locally(&self, desc: CollectiveDescriptor) -> Result<Work> {
        self.transport.retire(desc.sequence_tag);
        if desc.opcode != OpCode::Barrier && !desc.is_in_place() && desc.output.element_count() > 0 {
            let copy = owned_copy(desc.input.tensor())?;
            let copy = match desc.reduce_op {
                Some(op) => self.registry.finalize(op, copy, 1)?,
                None => copy,
            };
            desc.output.write_at(&copy, 0)?;
        }
        Ok(Work::completed(desc.opcode, desc.sequence_tag))
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Copy `input` from `root` into every rank's `output`.
    pub fn broadcast(&self, input: &DeviceBuffer, output: &DeviceBuffer, root: usize) -> Result<Work> {
        self.check_peer(root)?;
        self.check_pair(input, output, input.element_count())?;
        self.issue(CollectiveDescriptor {
            opcode: OpCode::Broadcast,
            input: input.clone(),
            output: output.clone(),
            reduce_op: None,
            root: Some(root),
            sequence_tag: self.next_seq(),
        })
    }

    pub fn all_reduce(&self, input: &DeviceBuffer, output: &DeviceBuffer, op: ReduceOp) -> Result<Work> {
        self.registry.check(op, input.element_type())?;
        self.check_pair(input, output, input.element_count())?;
        self.issue(CollectiveDescriptor {
            opcode: OpCode::AllReduce,
            input: input.clone(),
            output: output.clone(),
            reduce_op: Some(op),
            root: None,
            sequence_tag: self.next_seq(),
        })
    }

    /// Gather every rank's `input` into `output` in rank order. `output`
    /// holds `world_size * input.element_count()` elements.
    pub fn all_gather(&self, input: &DeviceBuffer, output: &DeviceBuffer) -> Result<Work> {
        self.check_pair(input, output, input.element_count() * self.world_size)?;
        self.issue(CollectiveDescriptor {
            opcode: OpCode::AllGather,
            input: input.clone(),
            output: output.clone(),
            reduce_op: None,
            root: None,
            sequence_tag: self.next_seq(),
        })
    }

    /// Reduce `input` across ranks and keep this rank's chunk in `output`.
    /// The first `count % world_size` ranks get one extra element.
    pub fn reduce_scatter(&self, input: &DeviceBuffer, output: &DeviceBuffer, op: ReduceOp) -> Result<Work> {
        self.registry.check(op, input.element_type())?;
        let mine = chunk_range(input.element_count(), self.world_size, self.rank);
        self.check_pair(input, output, mine.len())?;
        self.issue(CollectiveDescriptor {
            opcode: OpCode::ReduceScatter,
            input: input.clone(),
            output: output.clone(),
            reduce_op: Some(op),
            root: None,
            sequence_tag: self.next_seq(),
        })
    }

    pub fn barrier(&self) -> Result<Work> {
        let sentinel = DeviceBuffer::zeros(DType::U8, 1, self.buffers.compute_device())?;
        self.issue(CollectiveDescriptor {
            opcode: OpCode::Barrier,
            input: sentinel.clone(),
            output: sentinel,
            reduce_op: Some(ReduceOp::Nop),
            root: None,
            sequence_tag: self.next_seq(),
        })
    }

    /// Send `buffer` to `dst`. `tag` pairs it with the matching `recv`.
    pub fn send(&self, buffer: &DeviceBuffer, dst: usize, tag: u64) -> Result<Work> {
        self.check_peer(dst)?;
        Ok(self.issue_p2p(OpCode::Send, buffer, dst, tag))
    }

    /// Receive from `src` into `buffer`. Fails with `SizeMismatch` when the
    /// message is larger than the buffer.
    pub fn recv(&self, buffer: &DeviceBuffer, src: usize, tag: u64) -> Result<Work> {
        self.check_peer(src)?;
        Ok(self.issue_p2p(OpCode::Recv, buffer, src, tag))
    }

    fn issue_p2p(&self, opcode: OpCode, buffer: &DeviceBuffer, peer: usize, tag: u64) -> Work {
        metrics::record_collective_issued(opcode.as_str());
        let work = Work::new(opcode, tag);
        let engine = self.engine.clone();
        let handle = work.clone();
        let buffer = buffer.clone();
        self.runtime.handle().spawn(async move {
            engine.execute_p2p(opcode, buffer, peer, tag, handle).await;
        });
        work
    }

    fn wait_default(&self, work: &Work) -> Result<()> {
        work.wait(Some(self.config.default_timeout()))
    }
}

impl CollectiveCommunicator for ProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let input = DeviceBuffer::new(tensor)?;
        let output = DeviceBuffer::zeros(tensor.dtype(), tensor.elem_count(), tensor.device())?;
        self.wait_default(&ProcessGroup::all_reduce(self, &input, &output, op)?)?;
        Ok(output.tensor().reshape(tensor.shape())?)
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        let input = DeviceBuffer::new(tensor)?;
        let output = DeviceBuffer::zeros(tensor.dtype(), tensor.elem_count() * self.world_size, tensor.device())?;
        self.wait_default(&ProcessGroup::all_gather(self, &input, &output)?)?;
        let mut dims = tensor.dims().to_vec();
        match dims.first_mut() {
            Some(d0) => *d0 *= self.world_size,
            None => dims.push(self.world_size),
        }
        Ok(output.tensor().reshape(dims)?)
    }

    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> Result<Tensor> {
        let input = DeviceBuffer::new(tensor)?;
        let output = DeviceBuffer::zeros(tensor.dtype(), tensor.elem_count(), tensor.device())?;
        self.wait_default(&ProcessGroup::broadcast(self, &input, &output, root_rank)?)?;
        Ok(output.tensor().reshape(tensor.shape())?)
    }

    fn reduce_scatter(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let input = DeviceBuffer::new(tensor)?;
        let mine = chunk_range(tensor.elem_count(), self.world_size, self.rank);
        let output = DeviceBuffer::zeros(tensor.dtype(), mine.len(), tensor.device())?;
        self.wait_default(&ProcessGroup::reduce_scatter(self, &input, &output, op)?)?;
        Ok(output.tensor().clone())
    }

    fn barrier(&self) -> Result<()> {
        self.wait_default(&ProcessGroup::barrier(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::work::WorkState;
    use std::thread;

    fn cpu_config() -> CollectiveConfig {
        CollectiveConfig {
            backend: crate::utils::config::BackendChoice::Cpu,
            ..Default::default()
        }
    }

    #[test]
    fn test_all_reduce_via_communicator_trait() -> Result<()> {
        let groups = ProcessGroup::new_local_group(4, cpu_config())?;
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let t = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
                    let res = CollectiveCommunicator::all_reduce(&group, &t, ReduceOp::Sum).unwrap();
                    res.get(0).unwrap().to_scalar::<f32>().unwrap()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 4.0);
        }
        Ok(())
    }

    #[test]
    fn test_validation_is_synchronous() -> Result<()> {
        let groups = ProcessGroup::new_local_group(2, cpu_config())?;
        let g = &groups[0];
        let f32_buf = DeviceBuffer::zeros(DType::F32, 4, &Device::Cpu)?;
        let u8_buf = DeviceBuffer::zeros(DType::U8, 4, &Device::Cpu)?;
        let short = DeviceBuffer::zeros(DType::F32, 3, &Device::Cpu)?;

        assert!(matches!(
            g.all_reduce(&u8_buf, &u8_buf, ReduceOp::Avg),
            Err(CollectiveError::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            g.all_reduce(&f32_buf, &short, ReduceOp::Sum),
            Err(CollectiveError::SizeMismatch { expected: 4, actual: 3 })
        ));
        assert!(matches!(g.all_gather(&f32_buf, &f32_buf), Err(CollectiveError::SizeMismatch { .. })));
        assert!(matches!(g.broadcast(&f32_buf, &f32_buf, 2), Err(CollectiveError::InvalidArgument(_))));
        assert!(matches!(g.all_reduce(&f32_buf, &u8_buf, ReduceOp::Max), Err(CollectiveError::ShapeMismatch(_))));
        // Nothing was issued, so nothing went over the wire.
        assert_eq!(g.transport_stats().messages_sent, 0);
        Ok(())
    }

    #[test]
    fn test_single_rank_is_local_copy() -> Result<()> {
        let groups = ProcessGroup::new_local_group(1, cpu_config())?;
        let g = &groups[0];
        let input = DeviceBuffer::from_vec(vec![3.0f64, 4.0], &Device::Cpu)?;
        let output = DeviceBuffer::zeros(DType::F64, 2, &Device::Cpu)?;
        let work = g.all_reduce(&input, &output, ReduceOp::Avg)?;
        assert_eq!(work.poll(), WorkState::Completed);
        assert_eq!(output.to_vec::<f64>()?, vec![3.0, 4.0]);
        assert_eq!(g.transport_stats(), TransportStats::default());
        Ok(())
    }

    #[test]
    fn test_static_rendezvous_checks_size() {
        let rv = StaticRendezvous::new(vec![SocketAddr::from(([127, 0, 0, 1], 1))]);
        assert!(rv.addresses(1).is_ok());
        assert!(matches!(rv.addresses(2), Err(CollectiveError::Config(_))));
        assert!(matches!(rv.bind_address(3), Err(CollectiveError::Config(_))));
    }
}
