use candle_core::Tensor;
use tracing::trace;

use super::{write_range, StepContext};
use crate::utils::error::Result;

/// Binomial-tree broadcast from `root`.
///
/// Ranks are renumbered relative to the root. In round `k` every rank that
/// already holds the data sends it `2^k` positions further, so the tree
/// finishes in `ceil(log2 N)` rounds. `data` holds the root's payload on
/// entry at the root and the broadcast result on exit everywhere.
pub async fn broadcast(ctx: &StepContext<'_>, data: &Tensor, root: usize) -> Result<()> {
    let n = ctx.world_size();
    let rank = ctx.rank();
    let relative = (rank + n - root) % n;
    let len = data.elem_count();

    let mut mask = 1usize;
    let mut round = 0u32;
    while mask < n {
        if relative & mask != 0 {
            let src = (relative - mask + root) % n;
            trace!(rank, src, round, "Broadcast receive");
            let incoming = ctx.recv(src, round, data.dtype(), len).await?;
            write_range(data, 0, &incoming)?;
            break;
        }
        mask <<= 1;
        round += 1;
    }

    // Forward to the subtree below this rank, largest span first.
    while mask > 1 {
        mask >>= 1;
        round -= 1;
        if relative + mask < n {
            let dst = (relative + mask + root) % n;
            trace!(rank, dst, round, "Broadcast send");
            ctx.send(dst, round, data).await?;
        }
    }
    Ok(())
}
