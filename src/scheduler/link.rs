use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{AliasError, PartialIndex};
use crate::{
    kernel::{KernelArena, KernelId, KernelKind},
    tensor::{TensorId, TensorTable},
};

/// Output bindings between call results and the tensors their callees produce.
///
/// Each call output is bound to the callee output it receives on return. Bindings are
/// directed and recorded per call: two calls into one callee bind to the same target but
/// never to each other, so their results keep separate buffers. Bindings chain when a
/// callee tail-calls further. A binding that would close a loop is dropped, since both
/// ends already resolve to one buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AliasTable {
    alias: HashMap<TensorId, TensorId>,
}

impl AliasTable {
    /// The tensor `id` is directly bound to, if any.
    #[inline]
    pub fn target(&self, id: TensorId) -> Option<TensorId> {
        self.alias.get(&id).copied()
    }

    /// Follows bindings from `id` to the tensor that finally produces its value.
    pub fn resolve(&self, id: TensorId) -> TensorId {
        let mut root = id;
        while let Some(parent) = self.target(root) {
            root = parent;
        }
        root
    }

    /// Checks whether the binding chain starting at `from` passes through `to`.
    fn reaches(&self, from: TensorId, to: TensorId) -> bool {
        let mut current = from;
        loop {
            if current == to {
                return true;
            }
            match self.target(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Binds call output `x` to callee output `y`. Rebinding `x` replaces its target.
    ///
    /// Returns `false` if the binding was dropped because `y` already reads from `x`.
    pub fn link(&mut self, x: TensorId, y: TensorId) -> bool {
        if self.reaches(y, x) {
            return false;
        }
        self.alias.insert(x, y);
        true
    }

    /// Checks whether one of `x` and `y` receives its value from the other.
    #[inline]
    pub fn is_aliased(&self, x: TensorId, y: TensorId) -> bool {
        self.reaches(x, y) || self.reaches(y, x)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.alias.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.alias.is_empty()
    }

    /// Every bound tensor paired with its direct target, ordered by tensor.
    pub fn iter(&self) -> impl Iterator<Item = (TensorId, TensorId)> + '_ {
        self.alias
            .iter()
            .map(|(&id, &target)| (id, target))
            .sorted()
    }

    /// Prints the alias table in a human-readable format.
    pub fn print_pretty(&self, tensors: &TensorTable) -> String {
        self.iter()
            .map(|(id, target)| {
                format!("{id}\t{}\t→ {target}\t{}", tensors.name(id), tensors.name(target))
            })
            .join("\n")
    }
}

impl std::fmt::Display for AliasTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self
            .iter()
            .map(|(id, target)| format!("{id}\t→ {target}"))
            .join("\n");
        write!(f, "{s}")
    }
}

/// How a call's outputs were bound to its callee.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CallLink {
    pub call: KernelId,
    /// The partial producing the function value the call invokes.
    pub partial: KernelId,
    /// The entry subgraph bound by the partial.
    pub entry: KernelId,
    /// The last piece of the entry's continuation chain; produces the results.
    pub exit: KernelId,
    /// Pairs of (call output, callee output).
    pub outputs: Vec<(TensorId, TensorId)>,
}

/// Follows the continuation chain of a split subgraph to the piece that returns.
fn exit_of(arena: &KernelArena, entry: KernelId) -> Option<KernelId> {
    let mut visited = HashSet::default();
    let mut current = entry;
    while let Some(next) = arena.get(current)?.next() {
        if !visited.insert(current) {
            return None;
        }
        current = next;
    }
    Some(current)
}

/// Links every call of the kernel list to the outputs of the subgraph its partial binds.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub(crate) fn record_non_tail_call_link_info(
    arena: &KernelArena,
    kernels: &[KernelId],
    tensors: &TensorTable,
    partials: &PartialIndex,
) -> Result<(AliasTable, Vec<CallLink>), AliasError> {
    let mut aliases = AliasTable::default();
    let mut links = vec![];

    for call in arena.walk(kernels) {
        let kernel = &arena[call];
        if !kernel.is_call() {
            continue;
        }
        let name = || kernel.name.clone();

        let partial = kernel
            .function()
            .and_then(|function| partials.producer(function))
            .ok_or_else(|| AliasError::Unbound(name()))?;
        let entry = match arena[partial].kind {
            KernelKind::Partial { subgraph } => subgraph,
            _ => return Err(AliasError::Unbound(name())),
        };
        let exit = exit_of(arena, entry)
            .filter(|&exit| arena[exit].is_subgraph())
            .ok_or_else(|| AliasError::Target {
                call: name(),
                target: entry,
            })?;

        let targets = &arena[exit].outputs;
        if kernel.outputs.len() != targets.len() {
            return Err(AliasError::Count {
                call: name(),
                subgraph: arena[exit].name.clone(),
                expected: targets.len(),
                actual: kernel.outputs.len(),
            });
        }

        let outputs = kernel.outputs.iter().copied().zip_eq(targets.iter().copied()).collect_vec();
        for &(output, target) in &outputs {
            let compatible = match (tensors.info(output), tensors.info(target)) {
                (Some(x), Some(y)) => x.is_compatible(y),
                _ => false,
            };
            if !compatible {
                return Err(AliasError::Incompatible {
                    call: name(),
                    output: tensors.name(output),
                    target: tensors.name(target),
                });
            }
            if !aliases.link(output, target) {
                log::trace!("{target} already reads from {output}, binding dropped");
            }
        }

        log::debug!(
            "linked call {} to subgraph {} through partial {}",
            kernel.name,
            arena[exit].name,
            arena[partial].name
        );
        links.push(CallLink {
            call,
            partial,
            entry,
            exit,
            outputs,
        });
    }

    Ok((aliases, links))
}
