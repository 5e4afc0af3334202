use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use thiserror::Error;

use super::{ControlFlowError, Schedule, classify};
use crate::{
    kernel::{KernelArena, KernelId, KernelKind},
    tensor::{TensorId, TensorTable},
};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("subgraph {0} still contains a non-tail call")]
    NonTailCall(String),
    #[error("call {0} has no complete output binding")]
    Unlinked(String),
    #[error("kernel {kernel} reads {tensor}, which only removed kernel {removed} produces")]
    Dangling {
        kernel: String,
        tensor: TensorId,
        removed: String,
    },
    #[error("tail of {0} is scheduled before its head")]
    Order(String),
}

/// Checks handles, tensor references and call/partial pairing before the pass mutates anything.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub fn validate(
    arena: &KernelArena,
    kernels: &[KernelId],
    tensors: &TensorTable,
) -> Result<(), ControlFlowError> {
    if let Some(&id) = kernels.iter().find(|&&id| !arena.contains(id)) {
        return Err(ControlFlowError::Dangling(id));
    }

    let reachable = arena.walk(kernels);
    let mut producers: HashMap<TensorId, KernelId> = HashMap::default();

    for &id in &reachable {
        let kernel = &arena[id];
        let name = || kernel.name.clone();

        if let Some(&tensor) = kernel
            .inputs
            .iter()
            .chain(&kernel.outputs)
            .find(|&&tensor| !tensors.contains(tensor))
        {
            return Err(ControlFlowError::Tensor {
                kernel: name(),
                tensor,
            });
        }

        match &kernel.kind {
            KernelKind::Op => {}
            KernelKind::SubGraph { nodes, next } => {
                if nodes.is_empty() {
                    return Err(ControlFlowError::EmptySubGraph(name()));
                }
                if let Some(&node) = nodes.iter().chain(next).find(|&&x| !arena.contains(x)) {
                    return Err(ControlFlowError::Dangling(node));
                }
                // only list entries are split
                if let Some(&node) = nodes
                    .iter()
                    .find(|&&x| classify::is_non_tail_call_subgraph(arena, x))
                {
                    return Err(ControlFlowError::NestedNonTailCall {
                        subgraph: name(),
                        nested: arena[node].name.clone(),
                    });
                }
            }
            KernelKind::Partial { subgraph } => {
                if kernel.outputs.len() != 1 {
                    return Err(ControlFlowError::PartialOutput {
                        partial: name(),
                        count: kernel.outputs.len(),
                    });
                }
                match arena.get(*subgraph) {
                    None => return Err(ControlFlowError::Dangling(*subgraph)),
                    Some(target) if !target.is_subgraph() => {
                        return Err(ControlFlowError::PartialTarget {
                            partial: name(),
                            target: *subgraph,
                        });
                    }
                    Some(_) => {}
                }
                let function = kernel.outputs[0];
                if let Some(&other) = producers.get(&function) {
                    return Err(ControlFlowError::AmbiguousPartial {
                        function,
                        first: arena[other].name.clone(),
                        second: name(),
                    });
                }
                producers.insert(function, id);
            }
            KernelKind::Call => {
                if kernel.inputs.is_empty() {
                    return Err(ControlFlowError::MissingFunction(name()));
                }
            }
        }
    }

    for &id in &reachable {
        let kernel = &arena[id];
        if let Some(function) = kernel.function() {
            if !producers.contains_key(&function) {
                return Err(ControlFlowError::MissingPartial {
                    call: kernel.name.clone(),
                    function,
                });
            }
        }
    }
    Ok(())
}

/// Re-checks a scheduled kernel list:
/// no non-tail calls remain, heads precede tails, every call is bound,
/// and nothing reads a tensor only a removed kernel produced.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub fn verify(
    arena: &KernelArena,
    kernels: &[KernelId],
    schedule: &Schedule,
) -> Result<(), VerifyError> {
    if let Some(&id) = classify::non_tail_call_subgraphs(arena, kernels).first() {
        return Err(VerifyError::NonTailCall(arena[id].name.clone()));
    }

    let position = |id: KernelId| kernels.iter().position(|&x| x == id);
    for split in &schedule.splits {
        if let (Some(head), Some(tail)) = (position(split.head), position(split.tail)) {
            if head >= tail {
                return Err(VerifyError::Order(arena[split.source].name.clone()));
            }
        }
    }

    let survivors = arena.walk(kernels);
    for &id in &survivors {
        let kernel = &arena[id];
        if !kernel.is_call() {
            continue;
        }
        match schedule.link(id) {
            Some(link) if link.outputs.len() == kernel.outputs.len() => {}
            _ => return Err(VerifyError::Unlinked(kernel.name.clone())),
        }
    }

    let produced: HashSet<TensorId> = survivors
        .iter()
        .flat_map(|&id| arena[id].outputs.iter().copied())
        .collect();
    for &removed in &schedule.removed {
        for tensor in arena[removed]
            .outputs
            .iter()
            .filter(|&id| !produced.contains(id))
        {
            if let Some(&reader) = survivors
                .iter()
                .find(|&&id| arena[id].inputs.contains(tensor))
            {
                return Err(VerifyError::Dangling {
                    kernel: arena[reader].name.clone(),
                    tensor: *tensor,
                    removed: arena[removed].name.clone(),
                });
            }
        }
    }
    Ok(())
}
