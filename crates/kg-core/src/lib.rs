//! `kg-core` - Symbolic tensor graphs with generated native kernels.
//!
//! This crate provides:
//! - A graph of results and operators with shape and dtype inference
//!   and declared aliasing (destroy and view maps)
//! - Elementwise operators whose C kernels carry a contiguous fast path
//!   and a general strided path
//! - A content-addressed on-disk cache of compiled kernels
//! - Reverse-mode gradients and scalar/tensor dispatch families

pub mod cache;
pub mod codegen;
pub mod config;
pub mod dispatch;
pub mod elemwise;
pub mod error;
pub mod grad;
pub mod graph;
pub mod op;
pub mod ops;

// Re-export primary types at the crate root for convenience.
pub use cache::{CacheStats, CompiledModule, KernelCache, Thunk, ThunkStatus};
pub use codegen::{KernelUnit, LoopPath};
pub use config::Config;
pub use dispatch::{Family, FamilyBuilder, Variant};
pub use elemwise::{Elemwise, Param};
pub use error::{KernelError, Result};
pub use grad::{backprop, grad, Grad, GradMap, GradOutput};
pub use graph::{Arg, Context, HostValue, Mode, OpId, Policy, ResultId, Spec, Value};
pub use op::{Capabilities, DestroyMap, NativeCode, Operator, ViewMap};

pub use kg_tensor::{DType, Shape, SliceArg, Tensor};
