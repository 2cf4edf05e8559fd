//! Execution devices.
//!
//! Devices fall into three families. Real devices compute on data, meta
//! devices only record a computation graph, and accelerator devices hand
//! the whole model to an external runtime session.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Where kernels execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
    NcnnMeta,
    OnnxMeta,
    Ncnn,
    Onnx,
    Qnn,
    Mtk,
}

impl Device {
    /// Devices that execute kernels on real data.
    #[must_use]
    pub const fn is_real(self) -> bool {
        matches!(self, Self::Cpu | Self::Cuda)
    }

    /// Devices that trace kernels into an export graph.
    #[must_use]
    pub const fn is_meta(self) -> bool {
        matches!(self, Self::NcnnMeta | Self::OnnxMeta)
    }

    /// Devices that run the whole model inside an external session.
    #[must_use]
    pub const fn is_accelerator(self) -> bool {
        matches!(self, Self::Ncnn | Self::Onnx | Self::Qnn | Self::Mtk)
    }

    /// Devices whose tensors already live in host memory.
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Cpu)
    }

    /// Name used in strategy strings.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::NcnnMeta => "export-ncnn",
            Self::OnnxMeta => "export-onnx",
            Self::Ncnn => "ncnn",
            Self::Onnx => "onnx",
            Self::Qnn => "qnn",
            Self::Mtk => "mtk",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "export-ncnn" => Ok(Self::NcnnMeta),
            "export-onnx" => Ok(Self::OnnxMeta),
            "ncnn" => Ok(Self::Ncnn),
            "onnx" => Ok(Self::Onnx),
            "qnn" | "qualcomm" => Ok(Self::Qnn),
            "mtk" => Ok(Self::Mtk),
            other => Err(Error::Strategy(format!("unknown device {other:?}"))),
        }
    }
}
