//! Msgpack weight files.
//!
//! A weight file is one msgpack map holding the model dimensions, a
//! `weights` map from dotted parameter names to tensors, and the embedding
//! table as a list of per-token rows. Tensors are `{dtype, shape, data}`
//! maps with raw little-endian bytes.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use recur::{DType, Error, Result, Tensor};

pub const DEFAULT_VERSION: &str = "4";
pub const DEFAULT_RESCALE_LAYER: usize = 999;

/// One serialized tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedTensor {
    pub dtype: String,
    pub shape: Vec<usize>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl PackedTensor {
    /// Serialize a host tensor.
    ///
    /// # Errors
    /// Fails for placeholders and 4-bit tensors.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            dtype: tensor.dtype().to_torch()?.to_string(),
            shape: tensor.shape().to_vec(),
            data: tensor.as_bytes()?.to_vec(),
        })
    }

    /// Convenience constructor for f32 data.
    #[must_use]
    pub fn from_f32(shape: &[usize], values: &[f32]) -> Self {
        Self {
            dtype: "torch.float32".into(),
            shape: shape.to_vec(),
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// # Errors
    /// Fails for unknown dtype tags or when the byte count does not match
    /// the shape.
    pub fn to_tensor(&self) -> Result<Tensor> {
        let dtype = DType::from_torch(&self.dtype)?;
        Tensor::from_raw(&self.shape, dtype, self.data.clone())
    }
}

/// Contents of a weight file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightFile {
    pub n_layer: usize,
    pub n_embd: usize,
    /// Number of attention heads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_head: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_att: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_ffn: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rescale_layer: Option<usize>,
    pub weights: BTreeMap<String, PackedTensor>,
    pub embd_weights: Vec<PackedTensor>,
}

impl WeightFile {
    /// Memory-map and decode a weight file.
    ///
    /// # Errors
    /// Returns `Load` when the file cannot be opened or decoded.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let load_err = |reason: String| Error::Load {
            path: path.display().to_string(),
            reason,
        };
        let file = File::open(path).map_err(|e| load_err(e.to_string()))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| load_err(e.to_string()))?;
        rmp_serde::from_slice(&mmap).map_err(|e| load_err(e.to_string()))
    }

    /// Encode as a msgpack map.
    ///
    /// # Errors
    /// Propagates encoding and IO errors.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(self).map_err(|e| Error::Msgpack(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Version string, defaulting to v4 when absent.
    #[must_use]
    pub fn version_str(&self) -> &str {
        self.version.as_deref().unwrap_or(DEFAULT_VERSION)
    }

    #[must_use]
    pub fn rescale_layer(&self) -> usize {
        self.rescale_layer.unwrap_or(DEFAULT_RESCALE_LAYER)
    }

    /// Decode the named parameter.
    ///
    /// # Errors
    /// Returns `Load` when the name is missing or its tensor is malformed.
    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        let packed = self.weights.get(name).ok_or_else(|| Error::Load {
            path: name.to_string(),
            reason: "parameter missing from weight file".into(),
        })?;
        packed.to_tensor().map_err(|e| Error::Load {
            path: name.to_string(),
            reason: e.to_string(),
        })
    }
}
