use itertools::Itertools;
use rustc_hash::FxHashSet as HashSet;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{ControlFlowError, PartialIndex, classify::first_non_tail_call};
use crate::{
    kernel::{Kernel, KernelArena, KernelId, KernelKind},
    tensor::TensorId,
};

/// Record of one subgraph split at a non-tail call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Split {
    /// The subgraph that was split. Superseded by `head` and `tail`.
    pub source: KernelId,
    /// The call the split was made at. Last kernel of `head`.
    pub call: KernelId,
    pub head: KernelId,
    pub tail: KernelId,
}

/// Tensors read by `nodes` that are not produced by an earlier kernel of `nodes`.
fn external_inputs(arena: &KernelArena, nodes: &[KernelId]) -> Vec<TensorId> {
    let mut produced = HashSet::default();
    let mut inputs = vec![];
    for &node in nodes {
        let kernel = &arena[node];
        inputs.extend(
            kernel
                .inputs
                .iter()
                .filter(|&id| !produced.contains(id))
                .copied(),
        );
        produced.extend(kernel.outputs.iter().copied());
    }
    inputs.into_iter().unique().collect()
}

/// Splits a non-tail-call subgraph at its first non-tail call.
///
/// The head runs up to and including the call and returns exactly the call's outputs.
/// The tail receives the call's outputs first, then every other tensor it reads but
/// does not produce, then the source outputs it passes through without producing. Both pieces are pushed to the arena and inserted right after the
/// source in `kernels`; the source itself is left for cleanup.
///
/// Returns `Ok(None)` if the subgraph is tail-safe.
pub(crate) fn split_single_non_tail_call_subgraph(
    arena: &mut KernelArena,
    kernels: &mut Vec<KernelId>,
    partials: &mut PartialIndex,
    id: KernelId,
) -> Result<Option<Split>, ControlFlowError> {
    let Some(index) = first_non_tail_call(arena, id) else {
        return Ok(None);
    };
    let source = arena[id].clone();
    let nodes = source.nodes();
    let call = nodes[index];

    let function = arena[call]
        .function()
        .ok_or_else(|| ControlFlowError::MissingFunction(arena[call].name.clone()))?;
    if partials.producer(function).is_none() {
        return Err(ControlFlowError::MissingPartial {
            call: arena[call].name.clone(),
            function,
        });
    }

    let (head_nodes, tail_nodes) = nodes.split_at(index + 1);
    let tail_produced: HashSet<TensorId> = tail_nodes
        .iter()
        .flat_map(|&node| arena[node].outputs.iter().copied())
        .collect();

    let head = Kernel {
        name: format!("{}/head", source.name),
        kind: KernelKind::SubGraph {
            nodes: head_nodes.to_vec(),
            next: None,
        },
        inputs: external_inputs(arena, head_nodes),
        outputs: arena[call].outputs.clone(),
    };
    let tail = Kernel {
        name: format!("{}/tail", source.name),
        kind: KernelKind::SubGraph {
            nodes: tail_nodes.to_vec(),
            next: source.next(),
        },
        inputs: arena[call]
            .outputs
            .iter()
            .copied()
            .chain(external_inputs(arena, tail_nodes))
            .chain(
                source
                    .outputs
                    .iter()
                    .filter(|&id| !tail_produced.contains(id))
                    .copied(),
            )
            .unique()
            .collect(),
        outputs: source.outputs.clone(),
    };

    let tail = arena.push(tail);
    let head = arena.push(head);
    if let KernelKind::SubGraph { next, .. } = &mut arena[head].kind {
        *next = Some(tail);
    }

    // whoever bound or continued into the source now enters through the head
    partials.retarget(arena, id, head);
    for &x in kernels.iter() {
        if let KernelKind::SubGraph { next, .. } = &mut arena[x].kind {
            if *next == Some(id) {
                *next = Some(head);
            }
        }
    }

    match kernels.iter().position(|&x| x == id) {
        Some(position) => {
            kernels.insert(position + 1, tail);
            kernels.insert(position + 1, head);
        }
        None => kernels.extend([head, tail]),
    }

    log::debug!(
        "split subgraph {} at call {} into {} ({head}) and {} ({tail})",
        source.name,
        arena[call].name,
        arena[head].name,
        arena[tail].name,
    );

    Ok(Some(Split {
        source: id,
        call,
        head,
        tail,
    }))
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{external_inputs, split_single_non_tail_call_subgraph};
    use crate::{
        kernel::{Kernel, KernelArena, KernelKind},
        scheduler::{ControlFlowError, PartialIndex, classify::is_non_tail_call_subgraph},
        tensor::TensorTable,
    };

    #[test]
    fn test_split() -> Result<(), Box<dyn Error>> {
        let mut tensors = TensorTable::new();
        let x = tensors.push::<f32>("x", [4]);
        let a = tensors.push::<f32>("a", [4]);
        let f = tensors.push::<u32>("f", [1]);
        let r = tensors.push::<f32>("r", [4]);
        let c = tensors.push::<f32>("c", [4]);
        let y = tensors.push::<f32>("y", [4]);
        let g = tensors.push::<u32>("g", [1]);

        let mut arena = KernelArena::new();
        let neg = arena.push(Kernel::op("neg", [a], [r]));
        let callee = arena.push(Kernel::subgraph("callee", [neg], [a], [r]));
        let op_a = arena.push(Kernel::op("op_a", [x], [a]));
        let partial = arena.push(Kernel::partial("partial", callee, [a], f));
        let call = arena.push(Kernel::call("call", f, [], [c]));
        // reads both the call result and a head-local tensor
        let op_c = arena.push(Kernel::op("op_c", [c, a, x], [y]));
        let main = arena.push(Kernel::subgraph(
            "main",
            [op_a, partial, call, op_c],
            [x],
            [y],
        ));
        let entry = arena.push(Kernel::partial("entry", main, [x], g));

        let mut kernels = vec![callee, main];
        let mut partials = PartialIndex::build(&arena, &[callee, main, entry]);

        let split = split_single_non_tail_call_subgraph(&mut arena, &mut kernels, &mut partials, main)?
            .ok_or("main must be split")?;
        assert_eq!(split.source, main);
        assert_eq!(split.call, call);
        assert_eq!(kernels, vec![callee, main, split.head, split.tail]);

        let head = &arena[split.head];
        assert_eq!(head.nodes(), &[op_a, partial, call]);
        assert_eq!(head.inputs, vec![x]);
        assert_eq!(head.outputs, vec![c]);
        assert_eq!(head.next(), Some(split.tail));
        assert_eq!(head.name, "main/head");

        let tail = &arena[split.tail];
        assert_eq!(tail.nodes(), &[op_c]);
        assert_eq!(tail.inputs, vec![c, a, x]);
        assert_eq!(tail.outputs, vec![y]);
        assert_eq!(tail.next(), None);

        // the triggering call is resolved in both pieces
        assert!(!is_non_tail_call_subgraph(&arena, split.head));
        assert!(!is_non_tail_call_subgraph(&arena, split.tail));

        // the source is untouched, its binders are retargeted
        assert_eq!(arena[main].nodes(), &[op_a, partial, call, op_c]);
        assert_eq!(arena[entry].kind, KernelKind::Partial { subgraph: split.head });
        Ok(())
    }

    #[test]
    fn test_split_pass_through() -> Result<(), Box<dyn Error>> {
        let mut tensors = TensorTable::new();
        let x = tensors.push::<f32>("x", [4]);
        let a = tensors.push::<f32>("a", [4]);
        let f = tensors.push::<u32>("f", [1]);
        let r = tensors.push::<f32>("r", [4]);
        let c = tensors.push::<f32>("c", [4]);
        let y = tensors.push::<f32>("y", [4]);

        let mut arena = KernelArena::new();
        let neg = arena.push(Kernel::op("neg", [a], [r]));
        let callee = arena.push(Kernel::subgraph("callee", [neg], [a], [r]));
        let op_a = arena.push(Kernel::op("op_a", [x], [a]));
        let partial = arena.push(Kernel::partial("partial", callee, [a], f));
        let call = arena.push(Kernel::call("call", f, [], [c]));
        let op_c = arena.push(Kernel::op("op_c", [c], [y]));
        // `a` is made by the head and `x` is forwarded untouched
        let main = arena.push(Kernel::subgraph(
            "main",
            [op_a, partial, call, op_c],
            [x],
            [a, y, x],
        ));

        let mut kernels = vec![callee, main];
        let mut partials = PartialIndex::build(&arena, &kernels);
        let split = split_single_non_tail_call_subgraph(&mut arena, &mut kernels, &mut partials, main)?
            .ok_or("main must be split")?;

        let tail = &arena[split.tail];
        assert_eq!(tail.inputs, vec![c, a, x]);
        assert_eq!(tail.outputs, vec![a, y, x]);
        for output in &tail.outputs {
            let produced = tail
                .nodes()
                .iter()
                .any(|&node| arena[node].outputs.contains(output));
            assert!(produced || tail.inputs.contains(output));
        }
        Ok(())
    }

    #[test]
    fn test_split_tail_safe() -> Result<(), Box<dyn Error>> {
        let mut tensors = TensorTable::new();
        let x = tensors.push::<f32>("x", [4]);
        let y = tensors.push::<f32>("y", [4]);

        let mut arena = KernelArena::new();
        let op = arena.push(Kernel::op("op", [x], [y]));
        let main = arena.push(Kernel::subgraph("main", [op], [x], [y]));

        let mut kernels = vec![main];
        let mut partials = PartialIndex::build(&arena, &kernels);
        let split = split_single_non_tail_call_subgraph(&mut arena, &mut kernels, &mut partials, main)?;
        assert!(split.is_none());
        assert_eq!(kernels, vec![main]);
        assert_eq!(arena.len(), 2);
        Ok(())
    }

    #[test]
    fn test_split_missing_partial() {
        let mut tensors = TensorTable::new();
        let f = tensors.push::<u32>("f", [1]);
        let c = tensors.push::<f32>("c", [4]);
        let y = tensors.push::<f32>("y", [4]);

        let mut arena = KernelArena::new();
        let call = arena.push(Kernel::call("call", f, [], [c]));
        let op = arena.push(Kernel::op("op", [c], [y]));
        let main = arena.push(Kernel::subgraph("main", [call, op], [f], [y]));

        let mut kernels = vec![main];
        let mut partials = PartialIndex::build(&arena, &kernels);
        let result =
            split_single_non_tail_call_subgraph(&mut arena, &mut kernels, &mut partials, main);
        assert!(matches!(result, Err(ControlFlowError::MissingPartial { .. })));
        assert_eq!(kernels, vec![main]);
    }

    #[test]
    fn test_external_inputs() {
        let mut tensors = TensorTable::new();
        let x = tensors.push::<f32>("x", [4]);
        let y = tensors.push::<f32>("y", [4]);
        let z = tensors.push::<f32>("z", [4]);
        let w = tensors.push::<f32>("w", [4]);

        let mut arena = KernelArena::new();
        let first = arena.push(Kernel::op("first", [x, w], [y]));
        let second = arena.push(Kernel::op("second", [y, x, w], [z]));
        assert_eq!(external_inputs(&arena, &[first, second]), vec![x, w]);
        assert_eq!(external_inputs(&arena, &[second]), vec![y, x, w]);
    }
}
