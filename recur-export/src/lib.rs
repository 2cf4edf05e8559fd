//! Graph export for Recur.
//!
//! [`NcnnKernels`] is the kernel set for [`recur::Device::NcnnMeta`]: instead
//! of computing, every op appends ncnn layers to the active
//! [`recur::ExportSession`]. Matmul weights are quantized on the way out
//! by the routines in [`quant`].

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]

pub mod ncnn;
pub mod quant;

pub use ncnn::NcnnKernels;
