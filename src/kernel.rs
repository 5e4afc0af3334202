use std::ops::{Index, IndexMut};

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::tensor::{TensorId, TensorTable};

/// Stable handle of a kernel in a [`KernelArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("#{_0}")]
pub struct KernelId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum KernelKind {
    /// A plain kernel. Opaque to the scheduler.
    #[display("Op")]
    Op,
    /// Binds `subgraph` with the captured argument tensors, without invoking it.
    /// The only output is the function value consumed by a [`KernelKind::Call`].
    #[display("Partial({subgraph})")]
    Partial { subgraph: KernelId },
    /// Invokes the function value in `inputs[0]`; the rest of the inputs are extra arguments.
    #[display("Call")]
    Call,
    /// An ordered sequence of inner kernels.
    /// `next` is the continuation that runs after this piece if it was split.
    #[display("SubGraph")]
    SubGraph {
        nodes: Vec<KernelId>,
        next: Option<KernelId>,
    },
}

/// An executable unit of the compiled graph.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Kernel {
    pub name: String,
    pub kind: KernelKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl Kernel {
    #[inline]
    pub fn op(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = TensorId>,
        outputs: impl IntoIterator<Item = TensorId>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: KernelKind::Op,
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
        }
    }

    #[inline]
    pub fn partial(
        name: impl Into<String>,
        subgraph: KernelId,
        captures: impl IntoIterator<Item = TensorId>,
        function: TensorId,
    ) -> Self {
        Self {
            name: name.into(),
            kind: KernelKind::Partial { subgraph },
            inputs: captures.into_iter().collect(),
            outputs: vec![function],
        }
    }

    #[inline]
    pub fn call(
        name: impl Into<String>,
        function: TensorId,
        args: impl IntoIterator<Item = TensorId>,
        outputs: impl IntoIterator<Item = TensorId>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: KernelKind::Call,
            inputs: std::iter::once(function).chain(args).collect(),
            outputs: outputs.into_iter().collect(),
        }
    }

    #[inline]
    pub fn subgraph(
        name: impl Into<String>,
        nodes: impl IntoIterator<Item = KernelId>,
        inputs: impl IntoIterator<Item = TensorId>,
        outputs: impl IntoIterator<Item = TensorId>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: KernelKind::SubGraph {
                nodes: nodes.into_iter().collect(),
                next: None,
            },
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
        }
    }

    #[inline]
    pub fn is_call(&self) -> bool {
        matches!(self.kind, KernelKind::Call)
    }

    #[inline]
    pub fn is_partial(&self) -> bool {
        matches!(self.kind, KernelKind::Partial { .. })
    }

    #[inline]
    pub fn is_subgraph(&self) -> bool {
        matches!(self.kind, KernelKind::SubGraph { .. })
    }

    /// Inner kernels of a subgraph. Empty for other kinds.
    #[inline]
    pub fn nodes(&self) -> &[KernelId] {
        match &self.kind {
            KernelKind::SubGraph { nodes, .. } => nodes,
            _ => &[],
        }
    }

    /// The continuation of a split subgraph.
    #[inline]
    pub fn next(&self) -> Option<KernelId> {
        match self.kind {
            KernelKind::SubGraph { next, .. } => next,
            _ => None,
        }
    }

    /// The function value a call invokes.
    #[inline]
    pub fn function(&self) -> Option<TensorId> {
        match self.kind {
            KernelKind::Call => self.inputs.first().copied(),
            _ => None,
        }
    }
}

/// Owns every kernel of a model. Kernel lists, queues and sets refer to kernels by [`KernelId`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KernelArena(Vec<Kernel>);

impl Index<KernelId> for KernelArena {
    type Output = Kernel;

    #[inline]
    fn index(&self, index: KernelId) -> &Self::Output {
        &self.0[index.0]
    }
}

impl IndexMut<KernelId> for KernelArena {
    #[inline]
    fn index_mut(&mut self, index: KernelId) -> &mut Self::Output {
        &mut self.0[index.0]
    }
}

impl KernelArena {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, kernel: Kernel) -> KernelId {
        let id = KernelId(self.0.len());
        self.0.push(kernel);
        id
    }

    #[inline]
    pub fn get(&self, id: KernelId) -> Option<&Kernel> {
        self.0.get(id.0)
    }

    #[inline]
    pub fn contains(&self, id: KernelId) -> bool {
        id.0 < self.0.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (KernelId, &Kernel)> {
        self.0.iter().enumerate().map(|(index, kernel)| (KernelId(index), kernel))
    }

    /// Visits `kernels` and all their inner kernels, parents before children.
    /// Each kernel is yielded once even if it is shared by several subgraphs.
    pub fn walk(&self, kernels: &[KernelId]) -> Vec<KernelId> {
        let mut visited = rustc_hash::FxHashSet::default();
        let mut output = vec![];
        let mut stack = kernels.iter().rev().copied().collect_vec();
        while let Some(id) = stack.pop() {
            if !self.contains(id) || !visited.insert(id) {
                continue;
            }
            output.push(id);
            stack.extend(self[id].nodes().iter().rev().copied());
        }
        output
    }

    /// Renders a kernel list as a Mermaid flowchart.
    pub fn mermaid(&self, kernels: &[KernelId], tensors: &TensorTable) -> Mermaid {
        let mut s = "graph TD\n".to_string();

        let node = |id: KernelId| format!("kernel_{}", id.0);
        let label = |id: KernelId| {
            let kernel = &self[id];
            let outputs = kernel
                .outputs
                .iter()
                .map(|&id| tensors.name(id))
                .join(", ");
            format!("{}: {} → {outputs}", kernel.name, kernel.kind)
        };

        for &id in kernels.iter().filter(|&&id| self.contains(id)) {
            match &self[id].kind {
                KernelKind::SubGraph { nodes, next } => {
                    s.push_str(&format!("    subgraph {}[\"{}\"]\n", node(id), label(id)));
                    for &inner in nodes.iter().filter(|&&id| self.contains(id)) {
                        s.push_str(&format!("        {}[\"{}\"]\n", node(inner), label(inner)));
                    }
                    s.push_str("    end\n");
                    for (x, y) in nodes.iter().tuple_windows() {
                        s.push_str(&format!("    {} --> {}\n", node(*x), node(*y)));
                    }
                    if let Some(next) = next {
                        s.push_str(&format!("    {} ==> |next| {}\n", node(id), node(*next)));
                    }
                }
                _ => s.push_str(&format!("    {}[\"{}\"]\n", node(id), label(id))),
            }
        }

        for id in self.walk(kernels) {
            if let KernelKind::Partial { subgraph } = self[id].kind {
                s.push_str(&format!("    {} -.-> |bind| {}\n", node(id), node(subgraph)));
            }
        }
        Mermaid(s)
    }
}

/// A Mermaid flowchart source.
#[derive(Debug, Clone, PartialEq, Eq, Display, Deref)]
pub struct Mermaid(pub String);

#[cfg(test)]
mod tests {
    use super::{Kernel, KernelArena, KernelId, KernelKind};
    use crate::tensor::TensorTable;

    #[test]
    fn test_walk() {
        let mut tensors = TensorTable::new();
        let x = tensors.push::<f32>("x", [4]);
        let y = tensors.push::<f32>("y", [4]);
        let f = tensors.push::<u32>("f", [1]);
        let z = tensors.push::<f32>("z", [4]);

        let mut arena = KernelArena::new();
        let relu = arena.push(Kernel::op("relu", [x], [y]));
        let callee = arena.push(Kernel::subgraph("callee", [relu], [x], [y]));
        let partial = arena.push(Kernel::partial("partial", callee, [x], f));
        let call = arena.push(Kernel::call("call", f, [], [z]));
        let main = arena.push(Kernel::subgraph("main", [partial, call], [x], [z]));

        let order = arena.walk(&[main, callee, KernelId(42)]);
        assert_eq!(order, vec![main, partial, call, callee, relu]);

        assert_eq!(arena[call].function(), Some(f));
        assert_eq!(arena[main].nodes(), &[partial, call]);
        assert_eq!(arena[partial].kind, KernelKind::Partial { subgraph: callee });
        assert!(arena[relu].nodes().is_empty());

        let mermaid = arena.mermaid(&[main, callee], &tensors);
        println!("{mermaid}");
        assert!(mermaid.starts_with("graph TD\n"));
        assert!(mermaid.contains("kernel_2 -.-> |bind| kernel_1"));
        assert!(mermaid.contains("kernel_2 --> kernel_3"));
    }
}
