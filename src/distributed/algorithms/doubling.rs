//! Recursive doubling and halving for latency-bound messages.
//!
//! For a group whose size `N` is not a power of two, `p` is the largest power
//! of two below `N` and the `N - p` extra ranks are folded into partners
//! before the doubling rounds and given the result afterwards.

use std::ops::Range;

use candle_core::Tensor;
use tracing::trace;

use super::{write_range, StepContext};
use crate::distributed::reduce::ReduceOp;
use crate::utils::error::Result;

/// Largest power of two not above `n`, and how many ranks are left over.
pub fn split_power_of_two(n: usize) -> (usize, usize) {
    if n == 0 {
        return (0, 0);
    }
    let p = 1usize << (usize::BITS - 1 - n.leading_zeros());
    (p, n - p)
}

fn rounds(p: usize) -> u32 {
    p.trailing_zeros()
}

/// Combine so that the lower rank's contribution is always on the left.
fn ordered_combine(
    ctx: &StepContext<'_>,
    op: ReduceOp,
    local: &Tensor,
    incoming: &Tensor,
    incoming_is_lower: bool,
) -> Result<Tensor> {
    if incoming_is_lower {
        ctx.combine(op, incoming, local)
    } else {
        ctx.combine(op, local, incoming)
    }
}

/// All-reduce `data` in place.
///
/// Ranks below `2 * extra` pair up: even ranks hand their vector to the odd
/// neighbour (step 0) and get the result back at the end. The remaining `p`
/// ranks exchange full vectors with the partner `2^k` away in round `k + 1`.
pub async fn all_reduce(ctx: &StepContext<'_>, data: &Tensor, op: ReduceOp) -> Result<()> {
    let n = ctx.world_size();
    let rank = ctx.rank();
    let len = data.elem_count();
    let dtype = data.dtype();
    let (p, extra) = split_power_of_two(n);
    let last_step = rounds(p) + 1;

    let folded = rank < 2 * extra;
    if folded && rank % 2 == 0 {
        trace!(rank, partner = rank + 1, "Folding into partner");
        ctx.send(rank + 1, 0, data).await?;
        let result = ctx.recv(rank + 1, last_step, dtype, len).await?;
        write_range(data, 0, &result)?;
        return Ok(());
    }
    if folded {
        let incoming = ctx.recv(rank - 1, 0, dtype, len).await?;
        let reduced = ctx.combine(op, &incoming, data)?;
        write_range(data, 0, &reduced)?;
    }

    let virtual_rank = if folded { rank / 2 } else { rank - extra };
    let real_rank = |v: usize| if v < extra { v * 2 + 1 } else { v + extra };

    let mut mask = 1usize;
    let mut step = 1u32;
    while mask < p {
        let partner = real_rank(virtual_rank ^ mask);
        trace!(rank, partner, step, "Recursive doubling exchange");
        let incoming = ctx.exchange(partner, step, data, len).await?;
        let reduced = ordered_combine(ctx, op, data, &incoming, partner < rank)?;
        write_range(data, 0, &reduced)?;
        mask <<= 1;
        step += 1;
    }

    if folded {
        ctx.send(rank - 1, last_step, data).await?;
    }
    Ok(())
}

/// Reduce-scatter `data` by recursive halving. On return chunk `rank` of
/// `ranges` holds the reduction of that chunk over all ranks; the rest of
/// `data` holds partial results.
///
/// Extra ranks fold into their odd neighbour as in [`all_reduce`]. The `p`
/// core ranks then halve the range they are responsible for each round,
/// sending the half they give up to the partner `p / 2^k` away. A folded
/// pair's core rank finally hands the even rank its chunk.
pub async fn reduce_scatter(ctx: &StepContext<'_>, data: &Tensor, ranges: &[Range<usize>], op: ReduceOp) -> Result<()> {
    let n = ctx.world_size();
    let rank = ctx.rank();
    let len = data.elem_count();
    let dtype = data.dtype();
    let (p, extra) = split_power_of_two(n);
    let last_step = rounds(p) + 1;

    let folded = rank < 2 * extra;
    if folded && rank % 2 == 0 {
        trace!(rank, partner = rank + 1, "Folding into partner");
        ctx.send(rank + 1, 0, data).await?;
        let own = &ranges[rank];
        if !own.is_empty() {
            let result = ctx.recv(rank + 1, last_step, dtype, own.len()).await?;
            write_range(data, own.start, &result)?;
        }
        return Ok(());
    }
    if folded {
        let incoming = ctx.recv(rank - 1, 0, dtype, len).await?;
        let reduced = ctx.combine(op, &incoming, data)?;
        write_range(data, 0, &reduced)?;
    }

    let virtual_rank = if folded { rank / 2 } else { rank - extra };
    let real_rank = |v: usize| if v < extra { v * 2 + 1 } else { v + extra };
    // First real rank whose chunk belongs to virtual rank `v`.
    let first_real = |v: usize| if v < extra { v * 2 } else { v + extra };
    // Elements owned by virtual ranks `lo..hi`, which is always contiguous.
    let span = |lo: usize, hi: usize| {
        let start = ranges[first_real(lo)].start;
        let end = if hi < p { ranges[first_real(hi)].start } else { len };
        start..end
    };

    let (mut lo, mut hi) = (0, p);
    let mut mask = p / 2;
    let mut step = 1u32;
    while mask > 0 {
        let partner = real_rank(virtual_rank ^ mask);
        let mid = lo + mask;
        let (keep, give) = if virtual_rank < mid { ((lo, mid), (mid, hi)) } else { ((mid, hi), (lo, mid)) };
        let keep_range = span(keep.0, keep.1);
        let give_range = span(give.0, give.1);
        trace!(rank, partner, step, keep = ?keep_range, "Recursive halving exchange");

        let outgoing = (!give_range.is_empty()).then(|| data.narrow(0, give_range.start, give_range.len())).transpose()?;
        let expected = (!keep_range.is_empty()).then(|| (dtype, keep_range.len()));
        if let Some(incoming) = ctx.shift(partner, partner, step, outgoing, expected).await? {
            let local = data.narrow(0, keep_range.start, keep_range.len())?;
            let reduced = if partner < rank {
                ctx.combine(op, &incoming, &local)?
            } else {
                ctx.combine(op, &local, &incoming)?
            };
            write_range(data, keep_range.start, &reduced)?;
        }

        (lo, hi) = keep;
        mask >>= 1;
        step += 1;
    }

    if folded {
        let theirs = &ranges[rank - 1];
        if !theirs.is_empty() {
            ctx.send(rank - 1, last_step, &data.narrow(0, theirs.start, theirs.len())?).await?;
        }
    }
    Ok(())
}

/// Element range of the extra ranks attached to core ranks `base..base + size`.
fn extras_range(base: usize, size: usize, p: usize, n: usize, block: usize) -> (usize, usize) {
    let first = base + p;
    let end = (base + size + p).min(n);
    (first * block, end.saturating_sub(first) * block)
}

/// All-gather into `data`, which holds `N` blocks of `block` elements with
/// this rank's block already in place.
///
/// Extra ranks `e >= p` hand their block to `e - p` first. Each doubling round
/// then swaps everything the group has gathered so far, which is one
/// contiguous run of core blocks plus one contiguous run of extra blocks.
/// Finally the full result goes back to the extras.
pub async fn all_gather(ctx: &StepContext<'_>, data: &Tensor, block: usize) -> Result<()> {
    let n = ctx.world_size();
    let rank = ctx.rank();
    let dtype = data.dtype();
    let (p, extra) = split_power_of_two(n);
    let last_step = rounds(p) + 1;

    if rank >= p {
        let own = data.narrow(0, rank * block, block)?;
        ctx.send(rank - p, 0, &own).await?;
        let full = ctx.recv(rank - p, last_step, dtype, n * block).await?;
        write_range(data, 0, &full)?;
        return Ok(());
    }
    if rank < extra {
        let incoming = ctx.recv(rank + p, 0, dtype, block).await?;
        write_range(data, (rank + p) * block, &incoming)?;
    }

    let mut mask = 1usize;
    let mut step = 1u32;
    while mask < p {
        let base = rank & !(mask - 1);
        let partner = rank ^ mask;
        let partner_base = base ^ mask;

        let core = data.narrow(0, base * block, mask * block)?;
        let (extra_start, extra_len) = extras_range(base, mask, p, n, block);
        let outgoing = if extra_len > 0 {
            Tensor::cat(&[&core, &data.narrow(0, extra_start, extra_len)?], 0)?
        } else {
            core
        };

        let (their_extra_start, their_extra_len) = extras_range(partner_base, mask, p, n, block);
        trace!(rank, partner, step, "Recursive doubling gather");
        let incoming = ctx.exchange(partner, step, &outgoing, mask * block + their_extra_len).await?;

        write_range(data, partner_base * block, &incoming.narrow(0, 0, mask * block)?)?;
        if their_extra_len > 0 {
            write_range(data, their_extra_start, &incoming.narrow(0, mask * block, their_extra_len)?)?;
        }
        mask <<= 1;
        step += 1;
    }

    if rank < extra {
        ctx.send(rank + p, last_step, data).await?;
    }
    Ok(())
}
