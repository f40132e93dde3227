//! `kg-tensor` - Strided n-d arrays with shared storage for kernelgraph.
//!
//! This crate provides:
//! - A `Tensor` handle over reference-counted CPU storage, with views
//!   (transpose, slicing) that alias their source
//! - Row-major and column-major layout queries used to pick kernel paths
//! - Data type definitions and the dtype promotion join

pub mod dtype;
pub mod error;
pub mod index;
pub mod shape;
pub mod storage;
pub mod tensor;

// Re-export primary types at the crate root for convenience.
pub use dtype::{DType, Scalar};
pub use error::{Result, TensorError};
pub use index::{slice_shape, SliceArg};
pub use shape::Shape;
pub use storage::CpuStorage;
pub use tensor::Tensor;
