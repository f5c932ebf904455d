//! Drives one collective from descriptor to completed Work.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::algorithms::switch::SwitchSession;
use super::algorithms::{self, doubling, ring, tree, Algorithm, AlgorithmTable, StepContext};
use super::buffer::{land_on, BufferManager, DeviceBuffer, ScratchLease};
use super::reduce::{ReduceOp, ReductionRegistry};
use super::transport::Transport;
use super::types::{chunk_ranges, CollectiveDescriptor, MessageTag, OpCode};
use super::work::Work;
use crate::utils::config::SwitchConfig;
use crate::utils::error::{CollectiveError, Result};
use crate::utils::metrics;

pub struct CollectiveEngine {
    transport: Arc<dyn Transport>,
    registry: Arc<ReductionRegistry>,
    buffers: Arc<BufferManager>,
    table: AlgorithmTable,
    switch: Option<SwitchConfig>,
    switch_session: SwitchSession,
}

impl CollectiveEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ReductionRegistry>,
        buffers: Arc<BufferManager>,
        table: AlgorithmTable,
        switch: Option<SwitchConfig>,
    ) -> Self {
        Self { transport, registry, buffers, table, switch, switch_session: SwitchSession::default() }
    }

    /// Algorithm the table assigns to this call.
    pub fn select(&self, desc: &CollectiveDescriptor) -> Algorithm {
        if self.transport.world_size() == 1 {
            return Algorithm::Local;
        }
        let dtype = desc.input.element_type();
        let op = desc.reduce_op.unwrap_or(ReduceOp::Nop);
        let switch_ok = self.switch.is_some() && algorithms::switch::eligible(dtype, op);
        self.table
            .select_where(desc.opcode, desc.message_bytes(), |a| a != Algorithm::InNetwork || switch_ok)
    }

    /// Run a collective to its terminal state.
    ///
    /// On any failure the other ranks are told to abandon the same sequence
    /// tag, so no peer is left blocked on this rank.
    pub async fn execute(&self, desc: CollectiveDescriptor, work: Work) {
        let started = Instant::now();
        let seq = desc.sequence_tag;
        let algorithm = self.select(&desc);
        debug!(
            rank = self.transport.rank(),
            seq,
            op = %desc.opcode,
            algorithm = %algorithm,
            bytes = desc.message_bytes(),
            "Collective started"
        );

        let result = if work.mark_running() {
            self.run(&desc, &work, algorithm).await
        } else {
            Err(CollectiveError::Canceled)
        };

        if let Err(e) = &result {
            if !matches!(e, CollectiveError::Canceled) {
                warn!(rank = self.transport.rank(), seq, op = %desc.opcode, error = %e, "Collective failed");
            }
            self.transport
                .abort(seq, &format!("{} failed on rank {}: {}", desc.opcode, self.transport.rank(), e))
                .await;
        }
        self.transport.retire(seq);

        let canceled = matches!(result, Err(CollectiveError::Canceled));
        metrics::record_collective_outcome(
            desc.opcode.as_str(),
            algorithm.as_str(),
            started.elapsed().as_secs_f64(),
            result.is_err(),
            canceled,
        );
        work.finish(result);
    }

    /// Scratch leases live until this returns, so they go back to the pool
    /// before the Work is marked terminal.
    async fn run(&self, desc: &CollectiveDescriptor, work: &Work, algorithm: Algorithm) -> Result<()> {
        let n = self.transport.world_size();
        let rank = self.transport.rank();
        let device = self.buffers.compute_device().clone();
        let location = self.buffers.compute_location();
        let dtype = desc.input.element_type();
        let ctx = StepContext {
            transport: self.transport.as_ref(),
            registry: self.registry.as_ref(),
            work,
            device: &device,
            seq: desc.sequence_tag,
        };

        match desc.opcode {
            OpCode::Broadcast => {
                let root = desc.root.unwrap_or(0);
                let count = desc.output.element_count();
                let scratch = self.buffers.allocate_scratch(dtype, count, location)?;
                if rank == root {
                    algorithms::write_range(scratch.tensor(), 0, &land_on(desc.input.tensor(), &device)?)?;
                }
                tree::broadcast(&ctx, scratch.tensor(), root).await?;
                desc.output.write_at(scratch.tensor(), 0)
            }
            OpCode::AllReduce => {
                let op = required_op(desc)?;
                let scratch = self.staged_input(&desc.input)?;
                let data = scratch.tensor();
                match algorithm {
                    Algorithm::InNetwork => {
                        let config = self.switch.as_ref().ok_or_else(|| {
                            CollectiveError::Config("in-network all-reduce without a switch".to_string())
                        })?;
                        algorithms::switch::all_reduce(&ctx, config, &self.switch_session, data, op).await?;
                        return desc.output.write_at(data, 0);
                    }
                    Algorithm::RecursiveDoubling => doubling::all_reduce(&ctx, data, op).await?,
                    _ => ring::all_reduce(&ctx, data, op).await?,
                }
                let reduced = self.registry.finalize(op, data.clone(), n)?;
                desc.output.write_at(&reduced, 0)
            }
            OpCode::ReduceScatter => {
                let op = required_op(desc)?;
                let scratch = self.staged_input(&desc.input)?;
                let data = scratch.tensor();
                let ranges = chunk_ranges(data.elem_count(), n);
                match algorithm {
                    Algorithm::RecursiveHalving => doubling::reduce_scatter(&ctx, data, &ranges, op).await?,
                    _ => ring::reduce_scatter(&ctx, data, &ranges, op, 0).await?,
                }
                let mine = ranges[rank].clone();
                let chunk = data.narrow(0, mine.start, mine.len())?;
                let reduced = self.registry.finalize(op, chunk, n)?;
                desc.output.write_at(&reduced, 0)
            }
            OpCode::AllGather => {
                let block = desc.input.element_count();
                let scratch = self.buffers.allocate_scratch(dtype, n * block, location)?;
                let data = scratch.tensor();
                algorithms::write_range(data, rank * block, &land_on(desc.input.tensor(), &device)?)?;
                match algorithm {
                    Algorithm::Ring => {
                        let blocks: Vec<_> = (0..n).map(|r| r * block..(r + 1) * block).collect();
                        ring::all_gather(&ctx, data, &blocks, 0).await?
                    }
                    _ => doubling::all_gather(&ctx, data, block).await?,
                }
                desc.output.write_at(data, 0)
            }
            OpCode::Barrier => {
                let scratch = self.staged_input(&desc.input)?;
                doubling::all_reduce(&ctx, scratch.tensor(), ReduceOp::Nop).await
            }
            OpCode::Send | OpCode::Recv => Err(CollectiveError::InvalidArgument(format!(
                "{} is not a collective",
                desc.opcode
            ))),
        }
    }

    /// Lease scratch on the compute device and copy `input` into it.
    fn staged_input(&self, input: &DeviceBuffer) -> Result<ScratchLease> {
        let device = self.buffers.compute_device();
        let scratch = self.buffers.allocate_scratch(
            input.element_type(),
            input.element_count(),
            self.buffers.compute_location(),
        )?;
        algorithms::write_range(scratch.tensor(), 0, &land_on(input.tensor(), device)?)?;
        Ok(scratch)
    }

    /// Run a user point-to-point transfer to its terminal state.
    pub async fn execute_p2p(&self, opcode: OpCode, buffer: DeviceBuffer, peer: usize, tag: u64, work: Work) {
        let started = Instant::now();
        let result = if work.mark_running() {
            let tag = MessageTag::p2p(tag);
            match opcode {
                OpCode::Send => tokio::select! {
                    sent = self.transport.send(peer, tag, buffer.tensor()) => sent,
                    _ = work.canceled() => Err(CollectiveError::Canceled),
                },
                _ => {
                    let received = tokio::select! {
                        r = self.transport.recv(peer, tag, buffer.element_count(), buffer.device()) => r,
                        _ = work.canceled() => Err(CollectiveError::Canceled),
                    };
                    received.and_then(|t| {
                        if t.dtype() != buffer.element_type() {
                            return Err(CollectiveError::ShapeMismatch(format!(
                                "expected {:?} from rank {}, got {:?}",
                                buffer.element_type(),
                                peer,
                                t.dtype()
                            )));
                        }
                        buffer.write_at(&t, 0)
                    })
                }
            }
        } else {
            Err(CollectiveError::Canceled)
        };
        metrics::record_collective_outcome(
            opcode.as_str(),
            Algorithm::Local.as_str(),
            started.elapsed().as_secs_f64(),
            result.is_err(),
            matches!(result, Err(CollectiveError::Canceled)),
        );
        work.finish(result);
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

fn required_op(desc: &CollectiveDescriptor) -> Result<ReduceOp> {
    desc.reduce_op.ok_or_else(|| {
        CollectiveError::InvalidArgument(format!("{} needs a reduction operator", desc.opcode))
    })
}
