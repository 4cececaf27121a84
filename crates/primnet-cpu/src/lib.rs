//! # primnet-cpu
//!
//! Reference CPU engine for primnet.
//!
//! [`CpuEngine`] implements [`primnet_core::Engine`]: it describes operand
//! layouts with [`CpuLayout`], prefers channel-blocked feature maps and OIHW
//! weights, converts between layouts with reorder primitives and runs
//! convolution (im2col + GEMM) and pooling kernels on any supported layout.

pub mod config;
mod conv;
pub mod engine;
pub mod format;
mod gemm;
mod pool;
mod reorder;
pub mod stats;

pub use config::CpuEngineConfig;
pub use engine::{CpuEngine, CpuPrimitive, CpuPrimitiveDesc};
pub use format::{CpuLayout, Format};
pub use stats::StatsSnapshot;
