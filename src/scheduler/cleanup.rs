use itertools::Itertools;
use rustc_hash::FxHashSet as HashSet;

use crate::{
    kernel::{KernelArena, KernelId, KernelKind},
    tensor::TensorId,
};

/// Top-level partials binding the same subgraph with the same captures as an earlier one.
fn duplicate_partials(arena: &KernelArena, kernels: &[KernelId]) -> Vec<KernelId> {
    let mut seen = HashSet::default();
    kernels
        .iter()
        .copied()
        .filter(|&id| match &arena[id].kind {
            KernelKind::Partial { subgraph } => !seen.insert((*subgraph, arena[id].inputs.clone())),
            _ => false,
        })
        .collect()
}

/// Checks whether a surviving kernel still depends on `candidate`.
///
/// A surviving kernel depends on it if it reads one of its outputs that no surviving
/// kernel produces, or if a surviving partial binds it.
fn is_referenced(arena: &KernelArena, survivors: &[KernelId], candidate: KernelId) -> bool {
    let survivors = arena.walk(survivors);
    let mut read: HashSet<TensorId> = HashSet::default();
    let mut produced: HashSet<TensorId> = HashSet::default();
    for &id in &survivors {
        let kernel = &arena[id];
        read.extend(kernel.inputs.iter().copied());
        produced.extend(kernel.outputs.iter().copied());
        if let KernelKind::Partial { subgraph } = kernel.kind {
            if subgraph == candidate {
                return true;
            }
        }
    }
    arena[candidate]
        .outputs
        .iter()
        .any(|id| read.contains(id) && !produced.contains(id))
}

/// Removes kernels superseded by splitting, and redundant partials, from the kernel list.
///
/// Best effort: a candidate that is still referenced is kept and reported.
/// Returns the removed kernels.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub(crate) fn remove_useless_kernels(
    arena: &KernelArena,
    kernels: &mut Vec<KernelId>,
    useless: &HashSet<KernelId>,
) -> Vec<KernelId> {
    let candidates = kernels
        .iter()
        .copied()
        .filter(|id| useless.contains(id))
        .chain(duplicate_partials(arena, kernels))
        .unique()
        .collect_vec();

    let mut removed = vec![];
    for candidate in candidates {
        let survivors = kernels
            .iter()
            .copied()
            .filter(|&id| id != candidate)
            .collect_vec();
        if is_referenced(arena, &survivors, candidate) {
            log::warn!(
                "kernel {} ({candidate}) is redundant but still referenced, keeping it",
                arena[candidate].name
            );
            continue;
        }
        *kernels = survivors;
        removed.push(candidate);
    }
    removed
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashSet as HashSet;

    use super::remove_useless_kernels;
    use crate::{
        kernel::{Kernel, KernelArena},
        tensor::TensorTable,
    };

    #[test]
    fn test_remove() {
        let mut tensors = TensorTable::new();
        let x = tensors.push::<f32>("x", [4]);
        let y = tensors.push::<f32>("y", [4]);
        let z = tensors.push::<f32>("z", [4]);
        let f = tensors.push::<u32>("f", [1]);
        let g = tensors.push::<u32>("g", [1]);

        let mut arena = KernelArena::new();
        let op = arena.push(Kernel::op("op", [x], [y]));
        let source = arena.push(Kernel::subgraph("source", [op], [x], [y]));
        let piece = arena.push(Kernel::subgraph("piece", [op], [x], [y]));
        let consumer = arena.push(Kernel::op("consumer", [y], [z]));
        let partial = arena.push(Kernel::partial("partial", piece, [x], f));
        let duplicate = arena.push(Kernel::partial("duplicate", piece, [x], g));

        // `piece` reproduces every output of `source`
        let mut kernels = vec![source, piece, partial, duplicate, consumer];
        let useless = HashSet::from_iter([source]);
        let removed = remove_useless_kernels(&arena, &mut kernels, &useless);
        assert_eq!(removed, vec![source, duplicate]);
        assert_eq!(kernels, vec![piece, partial, consumer]);
    }

    #[test]
    fn test_keep_referenced() {
        let mut tensors = TensorTable::new();
        let x = tensors.push::<f32>("x", [4]);
        let y = tensors.push::<f32>("y", [4]);
        let z = tensors.push::<f32>("z", [4]);
        let f = tensors.push::<u32>("f", [1]);
        let g = tensors.push::<u32>("g", [1]);

        let mut arena = KernelArena::new();
        let op = arena.push(Kernel::op("op", [x], [y]));
        let source = arena.push(Kernel::subgraph("source", [op], [x], [y]));
        let consumer = arena.push(Kernel::op("consumer", [y], [z]));
        let partial = arena.push(Kernel::partial("partial", source, [x], f));
        let duplicate = arena.push(Kernel::partial("duplicate", source, [x], g));
        let call = arena.push(Kernel::call("call", g, [], [z]));

        // `y` has no other producer, and `source` is still bound by a partial
        let mut kernels = vec![source, partial, duplicate, call, consumer];
        let useless = HashSet::from_iter([source]);
        let removed = remove_useless_kernels(&arena, &mut kernels, &useless);
        assert!(removed.is_empty());
        assert_eq!(kernels, vec![source, partial, duplicate, call, consumer]);
    }
}
