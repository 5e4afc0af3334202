use itertools::Itertools;

use crate::kernel::{Kernel, KernelArena, KernelId};

/// Index of the first call in the subgraph that is not its last inner kernel.
///
/// Returns `None` for tail-safe subgraphs: those without calls, or whose only call
/// is the last instruction. The first call is always the one to split at.
#[inline]
pub fn first_non_tail_call(arena: &KernelArena, id: KernelId) -> Option<usize> {
    let nodes = arena.get(id).map(Kernel::nodes).unwrap_or_default();
    nodes
        .iter()
        .position(|&node| arena.get(node).is_some_and(Kernel::is_call))
        .filter(|&index| index + 1 < nodes.len())
}

#[inline]
pub fn is_non_tail_call_subgraph(arena: &KernelArena, id: KernelId) -> bool {
    first_non_tail_call(arena, id).is_some()
}

/// Scans the kernel list once and collects non-tail-call subgraphs in list order.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub fn non_tail_call_subgraphs(arena: &KernelArena, kernels: &[KernelId]) -> Vec<KernelId> {
    kernels
        .iter()
        .copied()
        .filter(|&id| is_non_tail_call_subgraph(arena, id))
        .unique()
        .collect()
}
