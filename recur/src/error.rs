//! Error types for Recur

use thiserror::Error;

use crate::device::Device;

/// Result type alias using Recur's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Recur operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to load {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("Unsupported model version: {0}")]
    UnsupportedVersion(String),

    #[error("No kernel for op `{op}` on device {device}")]
    Dispatch { op: String, device: Device },

    #[error("A kernel set is already registered for device {0}")]
    DuplicateKernel(Device),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("Device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: Device, got: Device },

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Quantization out of range: {0}")]
    QuantizationRange(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Invalid strategy: {0}")]
    Strategy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Msgpack error: {0}")]
    Msgpack(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a missing `(op, device)` kernel.
    #[must_use]
    pub fn dispatch(op: &str, device: Device) -> Self {
        Self::Dispatch {
            op: op.to_string(),
            device,
        }
    }
}
