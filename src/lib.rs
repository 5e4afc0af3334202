//! `mia-flow` schedules the control flow of a compiled model before it is run.
//!
//! A compiled model is a flat list of subgraph kernels. Control flow is expressed with two
//! kernel kinds: a `Partial` binds a subgraph to captured arguments, and a `Call` invokes the
//! bound subgraph and receives its outputs. An executor without a call stack can only run a
//! call in tail position, where the callee's results are the caller's results.
//!
//! ## Key Components
//! 1. **Kernel Model**:
//!    - Kernels live in a [`KernelArena`](kernel::KernelArena) and are addressed by stable handles.
//!    - Kernel kinds (`Op`, `Partial`, `Call`, `SubGraph`) form a closed sum type.
//!
//! 2. **Tensor Table**:
//!    - Externally owned tensor metadata, referenced by position.
//!
//! 3. **Control Flow Scheduler**:
//!    - Splits every subgraph with a non-tail call into a head ending in the call and a tail.
//!    - Binds call outputs to the tensors their callees produce, without copies.
//!    - Prunes kernels made redundant by splitting.
//!
//! ## Example
//! ```
//! use mia_flow::{
//!     kernel::{Kernel, KernelArena},
//!     scheduler::ControlFlowScheduler,
//!     tensor::TensorTable,
//! };
//!
//! let mut tensors = TensorTable::new();
//! let x = tensors.push::<f32>("x", [4]);
//! let f = tensors.push::<u32>("f", [1]);
//! let c = tensors.push::<f32>("c", [4]);
//! let y = tensors.push::<f32>("y", [4]);
//!
//! let mut arena = KernelArena::new();
//! let relu = arena.push(Kernel::op("relu", [x], [x]));
//! let callee = arena.push(Kernel::subgraph("callee", [relu], [x], [x]));
//! let partial = arena.push(Kernel::partial("partial", callee, [x], f));
//! let call = arena.push(Kernel::call("call", f, [], [c]));
//! let exp = arena.push(Kernel::op("exp", [c], [y]));
//! let main = arena.push(Kernel::subgraph("main", [partial, call, exp], [x], [y]));
//!
//! let mut kernels = vec![callee, main];
//! let schedule = ControlFlowScheduler::new(&tensors)
//!     .split_non_tail_call_subgraphs(&mut arena, &mut kernels)
//!     .unwrap();
//! assert_eq!(schedule.splits.len(), 1);
//! assert_eq!(kernels.len(), 3);
//! assert!(schedule.aliases.is_aliased(c, x));
//! ```

pub mod kernel;
pub mod num;
pub mod scheduler;
pub mod tensor;
#[cfg(feature = "trace")]
pub mod trace;

pub use kernel::{Kernel, KernelArena, KernelId, KernelKind};
pub use scheduler::{ControlFlowScheduler, ControlFlowSchedulerBuilder, Schedule, SchedulerError};
pub use tensor::{TensorId, TensorTable};
