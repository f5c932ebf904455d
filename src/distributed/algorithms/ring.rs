//! Bandwidth-optimal ring algorithms.
//!
//! Rank `r` always sends to `r + 1` and receives from `r - 1`. Chunks of
//! zero length are skipped on both ends of a hop, which keeps the ring
//! consistent when there are fewer elements than ranks.

use std::ops::Range;

use candle_core::{DType, Tensor};
use tracing::trace;

use super::{write_range, StepContext};
use crate::distributed::reduce::ReduceOp;
use crate::distributed::types::chunk_ranges;
use crate::utils::error::Result;

fn chunk(data: &Tensor, range: &Range<usize>) -> Result<Option<Tensor>> {
    if range.is_empty() {
        Ok(None)
    } else {
        Ok(Some(data.narrow(0, range.start, range.len())?))
    }
}

fn incoming_shape(data: &Tensor, range: &Range<usize>) -> Option<(DType, usize)> {
    (!range.is_empty()).then(|| (data.dtype(), range.len()))
}

/// Scatter-reduce phase. On return chunk `rank` of `ranges` holds the
/// reduction of that chunk over all ranks. Other chunks hold partial sums.
/// Uses steps `first_step .. first_step + N - 1`.
pub async fn reduce_scatter(
    ctx: &StepContext<'_>,
    data: &Tensor,
    ranges: &[Range<usize>],
    op: ReduceOp,
    first_step: u32,
) -> Result<()> {
    let n = ctx.world_size();
    let rank = ctx.rank();
    let next = (rank + 1) % n;
    let prev = (rank + n - 1) % n;

    for s in 0..n.saturating_sub(1) {
        let send_idx = (rank + 2 * n - 1 - s) % n;
        let recv_idx = (rank + 2 * n - 2 - s) % n;
        let step = first_step + s as u32;
        trace!(rank, step, send_idx, recv_idx, "Ring reduce-scatter step");

        let incoming = ctx
            .shift(
                next,
                prev,
                step,
                chunk(data, &ranges[send_idx])?,
                incoming_shape(data, &ranges[recv_idx]),
            )
            .await?;
        if let Some(incoming) = incoming {
            let range = &ranges[recv_idx];
            let local = data.narrow(0, range.start, range.len())?;
            let reduced = ctx.combine(op, &local, &incoming)?;
            write_range(data, range.start, &reduced)?;
        }
    }
    Ok(())
}

/// Circulate chunks until every rank holds all of them. On entry rank `r`
/// must hold chunk `r`. Uses steps `first_step .. first_step + N - 1`.
pub async fn all_gather(
    ctx: &StepContext<'_>,
    data: &Tensor,
    ranges: &[Range<usize>],
    first_step: u32,
) -> Result<()> {
    let n = ctx.world_size();
    let rank = ctx.rank();
    let next = (rank + 1) % n;
    let prev = (rank + n - 1) % n;

    for s in 0..n.saturating_sub(1) {
        let send_idx = (rank + n - s) % n;
        let recv_idx = (rank + 2 * n - 1 - s) % n;
        let step = first_step + s as u32;
        trace!(rank, step, send_idx, recv_idx, "Ring all-gather step");

        let incoming = ctx
            .shift(
                next,
                prev,
                step,
                chunk(data, &ranges[send_idx])?,
                incoming_shape(data, &ranges[recv_idx]),
            )
            .await?;
        if let Some(incoming) = incoming {
            write_range(data, ranges[recv_idx].start, &incoming)?;
        }
    }
    Ok(())
}

/// Ring all-reduce: scatter-reduce followed by all-gather, `2(N - 1)` steps.
pub async fn all_reduce(ctx: &StepContext<'_>, data: &Tensor, op: ReduceOp) -> Result<()> {
    let n = ctx.world_size();
    let ranges = chunk_ranges(data.elem_count(), n);
    reduce_scatter(ctx, data, &ranges, op, 0).await?;
    all_gather(ctx, data, &ranges, n.saturating_sub(1) as u32).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::algorithms::test_support::{context, run_ranks, running_work};
    use crate::distributed::reduce::ReductionRegistry;
    use candle_core::Device;

    async fn ring_sum(n: usize, len: usize) -> Vec<Vec<i64>> {
        run_ranks(n, move |rank, transport| async move {
            let registry = ReductionRegistry::default();
            let work = running_work();
            let device = Device::Cpu;
            let ctx = context(transport.as_ref(), &registry, &work, &device);
            let values: Vec<i64> = (0..len as i64).map(|i| i * 10 + rank as i64).collect();
            let data = Tensor::from_vec(values, len, &device)?;
            all_reduce(&ctx, &data, ReduceOp::Sum).await?;
            Ok(data.to_vec1::<i64>()?)
        })
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
    }

    #[tokio::test]
    async fn test_ring_all_reduce_matches_sum() {
        for (n, len) in [(2, 4), (3, 10), (4, 4), (5, 13), (6, 3)] {
            let rank_sum: i64 = (0..n as i64).sum();
            let expected: Vec<i64> = (0..len as i64).map(|i| i * 10 * n as i64 + rank_sum).collect();
            for got in ring_sum(n, len).await {
                assert_eq!(got, expected, "n={} len={}", n, len);
            }
        }
    }

    #[tokio::test]
    async fn test_reduce_scatter_owns_own_chunk() {
        let n = 4;
        let len = 10;
        let results = run_ranks(n, move |rank, transport| async move {
            let registry = ReductionRegistry::default();
            let work = running_work();
            let device = Device::Cpu;
            let ctx = context(transport.as_ref(), &registry, &work, &device);
            let data = Tensor::from_vec(vec![rank as f32 + 1.0; len], len, &device)?;
            let ranges = chunk_ranges(len, n);
            reduce_scatter(&ctx, &data, &ranges, ReduceOp::Max, 0).await?;
            let mine = &ranges[rank];
            Ok(data.narrow(0, mine.start, mine.len())?.to_vec1::<f32>()?)
        })
        .await;
        let ranges = chunk_ranges(len, n);
        for (rank, r) in results.into_iter().enumerate() {
            assert_eq!(r.unwrap(), vec![4.0; ranges[rank].len()]);
        }
    }
}
