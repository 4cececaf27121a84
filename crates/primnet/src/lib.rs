//! # primnet
//!
//! Layout negotiation and primitive-graph assembly for 2-D convolution and
//! pooling.
//!
//! Callers describe an operator logically ([`ConvDesc`], [`PoolDesc`]) and may
//! hint the layout their buffers use. The [`Assembler`] asks the engine which
//! layout it prefers for every operand, inserts a reorder wherever the two
//! disagree and returns a [`KernelGraph`]: an ordered, replayable list of
//! steps that owns every engine object and scratch buffer it needs.
//!
//! ## Usage
//!
//! ```rust
//! use primnet::prelude::*;
//!
//! # fn main() -> primnet::Result<()> {
//! let assembler = Assembler::new(CpuEngine::default());
//! let desc = ConvDesc::new((1, 8, 4, 4), (8, 8, 3, 3), (1, 1), (1, 1))?;
//! let mut graph = assembler.conv_forward(&desc, None, None)?;
//!
//! let src = vec![1.0; graph.input_size(0).unwrap_or(0)];
//! let weights = vec![0.5; graph.input_size(1).unwrap_or(0)];
//! let mut dst = vec![0.0; graph.output_size()];
//! graph.run_conv_fprop(&src, &weights, &mut dst)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `primnet-core` | Shape, operator descriptors, the `Engine` trait, errors |
//! | `primnet-cpu` | Reference CPU engine: layouts, reorders, conv and pooling kernels |
//! | `primnet` | Binding, reorder planning, graph assembly and the kernel runner |

/// Re-export core types.
pub use primnet_core::{
    Convention, ConvDesc, ConvDirection, Engine, Error, ExecArgs, OpDesc, OpKind,
    OperandRole, PoolAlgorithm, PoolDesc, Propagation, Result, Shape, WorkspaceArg,
};

/// Re-export the CPU engine.
pub use primnet_cpu::{CpuEngine, CpuEngineConfig, CpuLayout, Format, StatsSnapshot};

/// Graph assembly for every operator variant.
pub mod assemble;

/// Operands: a role, a shape, a layout and a storage slot.
pub mod binding;

pub mod config;
pub mod context;

/// The assembled step list and its queries.
pub mod graph;

pub mod profile;
pub mod registry;
pub mod reorder;
pub mod resolve;

/// Kernel runner: replays a graph on caller buffers.
mod run;

pub mod workspace;

pub use assemble::Assembler;
pub use binding::{Operand, OperandId, Port, Storage};
pub use config::AssemblyConfig;
pub use context::PoolingContext;
pub use graph::{ComputeStep, KernelGraph, Step, WorkspaceAccess};
pub use profile::{RunProfile, StepTiming};
pub use registry::Registry;
pub use reorder::{Direction, ReorderStep};
pub use workspace::Workspace;

/// Convenience prelude: `use primnet::prelude::*;`
pub mod prelude {
    pub use crate::{
        Assembler, AssemblyConfig, ConvDesc, CpuEngine, CpuEngineConfig, CpuLayout, Engine, Error,
        Format, KernelGraph, OpKind, OperandRole, PoolAlgorithm, PoolDesc, PoolingContext,
        Result, Shape,
    };
}
