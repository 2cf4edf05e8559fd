//! Data types for tensor elements

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Supported data types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// 8-bit quantized weights
    Int8,
    /// 4-bit quantized weights, two codes per byte
    Int4,
}

impl DType {
    /// Width of one element in bits
    #[must_use]
    pub const fn bits(self) -> usize {
        match self {
            Self::F32 => 32,
            Self::F16 => 16,
            Self::Int8 => 8,
            Self::Int4 => 4,
        }
    }

    /// Bytes needed to store `numel` packed elements.
    #[must_use]
    pub const fn storage_bytes(self, numel: usize) -> usize {
        (numel * self.bits() + 7) / 8
    }

    /// True for dtypes activations can be computed in.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16)
    }

    /// Parse a PyTorch-style dtype name such as `torch.float16`.
    ///
    /// # Errors
    /// Returns `UnsupportedDtype` for names other than fp32, fp16 and int8.
    pub fn from_torch(name: &str) -> Result<Self> {
        match name.strip_prefix("torch.").unwrap_or(name) {
            "float32" | "float" => Ok(Self::F32),
            "float16" | "half" => Ok(Self::F16),
            "int8" => Ok(Self::Int8),
            other => Err(Error::UnsupportedDtype(format!(
                "unsupported serialized dtype {other:?}"
            ))),
        }
    }

    /// PyTorch-style dtype name used in state and weight files.
    ///
    /// # Errors
    /// Packed 4-bit data has no serialized form.
    pub fn to_torch(self) -> Result<&'static str> {
        match self {
            Self::F32 => Ok("torch.float32"),
            Self::F16 => Ok("torch.float16"),
            Self::Int8 => Ok("torch.int8"),
            other => Err(Error::UnsupportedDtype(format!(
                "{other} tensors cannot be serialized"
            ))),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "fp32"),
            Self::F16 => write!(f, "fp16"),
            Self::Int8 => write!(f, "int8"),
            Self::Int4 => write!(f, "int4"),
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp32" | "f32" => Ok(Self::F32),
            "fp16" | "f16" => Ok(Self::F16),
            "int8" => Ok(Self::Int8),
            "int4" => Ok(Self::Int4),
            other => Err(Error::UnsupportedDtype(format!("unknown dtype {other:?}"))),
        }
    }
}

/// Trait for types that can be used as tensor elements
pub trait TensorDType: bytemuck::Pod + Default + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;
}

impl TensorDType for f32 {
    const DTYPE: DType = DType::F32;
}

impl TensorDType for half::f16 {
    const DTYPE: DType = DType::F16;
}
