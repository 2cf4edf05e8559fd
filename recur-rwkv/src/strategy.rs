//! `"<device> <precision>"` strategy strings.

use std::fmt;
use std::str::FromStr;

use recur::{DType, Device, Error, Result};

/// Activation and weight precision requested by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Fp32,
    Fp16,
    Int8,
    Int4,
    /// Left to the backend to decide.
    Auto,
}

impl Precision {
    /// `(activation, weight)` dtypes, `None` for [`Precision::Auto`].
    #[must_use]
    pub const fn dtypes(self) -> Option<(DType, DType)> {
        match self {
            Self::Fp32 => Some((DType::F32, DType::F32)),
            Self::Fp16 => Some((DType::F16, DType::F16)),
            Self::Int8 => Some((DType::F32, DType::Int8)),
            Self::Int4 => Some((DType::F32, DType::Int4)),
            Self::Auto => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Int8 => "int8",
            Self::Int4 => "int4",
            Self::Auto => "auto",
        }
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp32" => Ok(Self::Fp32),
            "fp16" => Ok(Self::Fp16),
            "int8" => Ok(Self::Int8),
            "int4" => Ok(Self::Int4),
            "auto" => Ok(Self::Auto),
            other => Err(Error::Strategy(format!("unknown precision {other:?}"))),
        }
    }
}

/// Where to run and at what precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub device: Device,
    pub precision: Precision,
}

impl Strategy {
    #[must_use]
    pub const fn new(device: Device, precision: Precision) -> Self {
        Self { device, precision }
    }

    /// `(activation, weight)` dtypes with `auto` resolved to fp32.
    #[must_use]
    pub fn resolved_dtypes(&self) -> (DType, DType) {
        self.precision.dtypes().unwrap_or((DType::F32, DType::F32))
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.device, self.precision.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let (Some(device), Some(precision), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Strategy(format!(
                "expected \"<device> <precision>\", got {s:?}"
            )));
        };
        Ok(Self::new(device.parse()?, precision.parse()?))
    }
}
