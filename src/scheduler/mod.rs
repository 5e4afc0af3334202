//! Restructures a kernel list so that no subgraph contains a call in non-tail position.
//!
//! The pass runs in four phases:
//! 1. **Classify**: collect subgraphs where a `Call` is followed by more work.
//! 2. **Split**: drain a FIFO queue of such subgraphs, cutting each one right after its
//!    first non-tail call into a head and a tail. Pieces that still contain non-tail calls
//!    are pushed back to the queue.
//! 3. **Link**: bind every call's outputs to the outputs of the subgraph its partial binds.
//! 4. **Cleanup**: drop the superseded subgraphs and redundant partials from the list.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use link::{AliasTable, CallLink};
pub use split::Split;

use crate::{
    kernel::{KernelArena, KernelId, KernelKind},
    tensor::{TensorId, TensorTable},
};

pub mod classify;
pub mod cleanup;
pub mod link;
pub mod split;
pub mod verify;

#[derive(Debug, Error)]
pub enum ControlFlowError {
    #[error("kernel handle {0} is out of range")]
    Dangling(KernelId),
    #[error("kernel {kernel} references tensor {tensor} out of range")]
    Tensor { kernel: String, tensor: TensorId },
    #[error("subgraph {0} has no inner kernels")]
    EmptySubGraph(String),
    #[error("call {0} has no function input")]
    MissingFunction(String),
    #[error("call {call} has no matching partial producing {function}")]
    MissingPartial { call: String, function: TensorId },
    #[error("function value {function} is produced by more than one partial: {first} and {second}")]
    AmbiguousPartial {
        function: TensorId,
        first: String,
        second: String,
    },
    #[error("partial {partial} must produce exactly one function value, found {count}")]
    PartialOutput { partial: String, count: usize },
    #[error("partial {partial} binds {target}, which is not a subgraph")]
    PartialTarget { partial: String, target: KernelId },
    #[error("subgraph {nested} nested in {subgraph} has a non-tail call and cannot be split in place")]
    NestedNonTailCall { subgraph: String, nested: String },
}

#[derive(Debug, Error)]
pub enum AliasError {
    #[error("call {0} has no partial to bind its outputs to")]
    Unbound(String),
    #[error("call {call} binds {target}, which does not continue into a subgraph")]
    Target { call: String, target: KernelId },
    #[error("call {call} returns {actual} values but subgraph {subgraph} produces {expected}")]
    Count {
        call: String,
        subgraph: String,
        expected: usize,
        actual: usize,
    },
    #[error("call {call}: output {output} cannot share a buffer with {target}")]
    Incompatible {
        call: String,
        output: String,
        target: String,
    },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("malformed control flow: {0}")]
    MalformedControlFlow(#[from] ControlFlowError),
    #[error("unresolved alias: {0}")]
    UnresolvedAlias(#[from] AliasError),
    #[error("more than {0} splits requested")]
    SplitLimit(usize),
    #[error("verification failed: {0}")]
    Verify(#[from] verify::VerifyError),
}

/// Partials reachable from a kernel list, indexed by the function value they produce
/// and by the subgraph they bind.
#[derive(Debug, Default, Clone)]
pub(crate) struct PartialIndex {
    producers: HashMap<TensorId, KernelId>,
    binders: HashMap<KernelId, Vec<KernelId>>,
}

impl PartialIndex {
    pub fn build(arena: &KernelArena, kernels: &[KernelId]) -> Self {
        let mut index = Self::default();
        for id in arena.walk(kernels) {
            let kernel = &arena[id];
            if let KernelKind::Partial { subgraph } = kernel.kind {
                for &function in &kernel.outputs {
                    index.producers.entry(function).or_insert(id);
                }
                index.binders.entry(subgraph).or_default().push(id);
            }
        }
        index
    }

    #[inline]
    pub fn producer(&self, function: TensorId) -> Option<KernelId> {
        self.producers.get(&function).copied()
    }

    /// Makes every partial binding `from` bind `to` instead.
    pub fn retarget(&mut self, arena: &mut KernelArena, from: KernelId, to: KernelId) {
        let Some(binders) = self.binders.remove(&from) else {
            return;
        };
        for &partial in &binders {
            arena[partial].kind = KernelKind::Partial { subgraph: to };
        }
        self.binders.entry(to).or_default().extend(binders);
    }
}

/// Options of a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SchedulerConfig {
    /// Aborts the pass with [`SchedulerError::SplitLimit`] after this many splits.
    pub max_splits: Option<usize>,
    /// Removes superseded subgraphs and redundant partials after splitting.
    pub prune: bool,
    /// Re-checks the scheduled list before returning.
    pub verify: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_splits: None,
            prune: true,
            verify: cfg!(feature = "strict"),
        }
    }
}

/// Outcome of a successful scheduling pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Schedule {
    /// Output bindings the executor uses to avoid copying call results.
    pub aliases: AliasTable,
    /// One entry per call in the scheduled list.
    pub links: Vec<CallLink>,
    /// Splits in the order they were made.
    pub splits: Vec<Split>,
    /// Kernels dropped from the list by cleanup.
    pub removed: Vec<KernelId>,
}

impl Schedule {
    /// The link recorded for `call`, if it survived into the scheduled list.
    #[inline]
    pub fn link(&self, call: KernelId) -> Option<&CallLink> {
        self.links.iter().find(|link| link.call == call)
    }
}

#[derive(Debug, Clone)]
pub struct ControlFlowSchedulerBuilder<'a> {
    pub tensors: &'a TensorTable,
    pub config: SchedulerConfig,
}

impl<'a> ControlFlowSchedulerBuilder<'a> {
    pub fn new(tensors: &'a TensorTable) -> Self {
        let config = Default::default();
        Self { tensors, config }
    }

    pub fn max_splits(mut self, max_splits: usize) -> Self {
        self.config.max_splits = Some(max_splits);
        self
    }

    pub fn prune(mut self, prune: bool) -> Self {
        self.config.prune = prune;
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.config.verify = verify;
        self
    }

    pub fn build(self) -> ControlFlowScheduler<'a> {
        let Self { tensors, config } = self;
        ControlFlowScheduler {
            tensors,
            config,
            to_process_q: VecDeque::new(),
            non_tail_calls: HashSet::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlFlowScheduler<'a> {
    /// The runtime's tensor table. Read only.
    tensors: &'a TensorTable,
    config: SchedulerConfig,
    /// Subgraphs waiting to be split.
    to_process_q: VecDeque<KernelId>,
    /// Every subgraph ever enqueued during the current pass.
    non_tail_calls: HashSet<KernelId>,
}

impl<'a> ControlFlowScheduler<'a> {
    #[inline]
    pub fn new(tensors: &'a TensorTable) -> Self {
        ControlFlowSchedulerBuilder::new(tensors).build()
    }

    #[inline]
    pub fn builder(tensors: &'a TensorTable) -> ControlFlowSchedulerBuilder<'a> {
        ControlFlowSchedulerBuilder::new(tensors)
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Splits every non-tail-call subgraph in `kernels`, links calls to their callees
    /// and removes the kernels made useless by splitting.
    ///
    /// New kernels are appended to `arena`. The pass is all-or-nothing: on error,
    /// both `arena` and `kernels` are left exactly as they were passed in.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn split_non_tail_call_subgraphs(
        &mut self,
        arena: &mut KernelArena,
        kernels: &mut Vec<KernelId>,
    ) -> Result<Schedule, SchedulerError> {
        let mut work_arena = arena.clone();
        let mut work_kernels = kernels.clone();

        match self.schedule(&mut work_arena, &mut work_kernels) {
            Ok(schedule) => {
                *arena = work_arena;
                *kernels = work_kernels;
                Ok(schedule)
            }
            Err(err) => {
                log::error!("control flow scheduling aborted: {err}");
                Err(err)
            }
        }
    }

    fn schedule(
        &mut self,
        arena: &mut KernelArena,
        kernels: &mut Vec<KernelId>,
    ) -> Result<Schedule, SchedulerError> {
        self.to_process_q.clear();
        self.non_tail_calls.clear();

        verify::validate(arena, kernels, self.tensors)?;

        let mut partials = PartialIndex::build(arena, kernels);
        let initial = classify::non_tail_call_subgraphs(arena, kernels);
        self.append_to_process_q(arena, &initial);

        let mut splits = vec![];
        while let Some(id) = self.to_process_q.pop_front() {
            if let Some(max_splits) = self.config.max_splits {
                if splits.len() >= max_splits {
                    return Err(SchedulerError::SplitLimit(max_splits));
                }
            }
            let split =
                split::split_single_non_tail_call_subgraph(arena, kernels, &mut partials, id)?;
            if let Some(split) = split {
                self.append_to_process_q(arena, &[split.head, split.tail]);
                splits.push(split);
            }
        }

        let (aliases, links) =
            link::record_non_tail_call_link_info(arena, kernels, self.tensors, &partials)?;

        let removed = match self.config.prune {
            true => cleanup::remove_useless_kernels(arena, kernels, &self.non_tail_calls),
            false => vec![],
        };

        let schedule = Schedule {
            aliases,
            links,
            splits,
            removed,
        };
        if self.config.verify {
            verify::verify(arena, kernels, &schedule)?;
        }

        log::info!(
            "scheduled {} kernels: {} splits, {} calls linked, {} kernels removed",
            kernels.len(),
            schedule.splits.len(),
            schedule.links.len(),
            schedule.removed.len(),
        );
        Ok(schedule)
    }

    /// Enqueues the non-tail-call subgraphs among `subgraphs` that were not seen before.
    fn append_to_process_q(&mut self, arena: &KernelArena, subgraphs: &[KernelId]) {
        for &id in subgraphs {
            if classify::is_non_tail_call_subgraph(arena, id) && self.non_tail_calls.insert(id) {
                self.to_process_q.push_back(id);
            }
        }
    }
}
