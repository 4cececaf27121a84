//! # primnet-core
//!
//! Shared vocabulary for assembling primitive graphs.
//!
//! This crate provides:
//! - [`Shape`]: logical extents
//! - [`OpDesc`], [`ConvDesc`], [`PoolDesc`]: validated operator descriptions
//! - [`Engine`]: the execution-engine capability (layouts, primitives, execution)
//! - [`Error`] / [`Result`]: the error type used by every primnet crate

pub mod engine;
pub mod error;
pub mod op;
pub mod shape;

pub use engine::{Convention, Engine, ExecArgs, WorkspaceArg};
pub use error::{Error, Result};
pub use op::{
    ConvDesc, ConvDirection, OpDesc, OpKind, OperandRole, PoolAlgorithm, PoolDesc, Propagation,
};
pub use shape::Shape;
