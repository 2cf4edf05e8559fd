//! Recur: core types for recurrent-model inference.
//!
//! This crate provides the tensor handle, element types, devices and the
//! kernel-dispatch surface shared by every backend. Concrete kernel sets
//! (eager CPU, graph-export) live in separate crates and are looked up
//! through a [`KernelRegistry`] keyed by [`Device`].

#![allow(clippy::module_name_repetitions)]

pub mod device;
pub mod dtype;
pub mod error;
#[allow(clippy::missing_errors_doc)]
pub mod kernels;
pub mod registry;
pub mod session;
pub mod shape;
pub mod tensor;

pub use device::Device;
pub use dtype::{DType, TensorDType};
pub use error::{Error, Result};
pub use kernels::{BinaryOp, Dispatcher, KernelContext, Kernels, ScalarOp, UnaryOp};
pub use registry::KernelRegistry;
pub use session::{ExportConfig, ExportSession, ExportSummary};
pub use tensor::Tensor;
