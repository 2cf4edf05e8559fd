//! RWKV model dimensions.

use recur::{Error, Result};

use crate::version::Version;
use crate::weights::WeightFile;

/// Dimensions and architecture metadata shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwkvConfig {
    pub version: Version,
    pub n_layer: usize,
    pub n_embd: usize,
    pub n_att: usize,
    pub n_ffn: usize,
    /// Number of attention heads, 0 for v4.
    pub n_head: usize,
    pub vocab_size: usize,
    /// Halve fp16 activations after every `rescale_layer` layers.
    pub rescale_layer: usize,
}

fn load_error(reason: String) -> Error {
    Error::Load {
        path: "weight file".into(),
        reason,
    }
}

impl RwkvConfig {
    /// Read the dimensions of a weight file.
    ///
    /// # Errors
    /// Returns `UnsupportedVersion` for unknown versions and `Load` when a
    /// required dimension is missing or inconsistent.
    pub fn from_weight_file(file: &WeightFile) -> Result<Self> {
        let version: Version = file.version_str().parse()?;
        if file.n_layer == 0 || file.n_embd == 0 {
            return Err(load_error("n_layer and n_embd must be positive".into()));
        }
        let (n_att, n_ffn, n_head) = if version == Version::V4 {
            let n_ffn = file
                .weights
                .get("blocks.0.ffn.key.weight")
                .and_then(|t| t.shape.last().copied())
                .unwrap_or(0);
            (file.n_embd, n_ffn, 0)
        } else {
            let required = |value: Option<usize>, key: &str| {
                value
                    .filter(|&v| v > 0)
                    .ok_or_else(|| load_error(format!("version {version} requires {key}")))
            };
            let n_head = required(file.n_head, "n_head")?;
            let n_att = required(file.n_att, "n_att")?;
            let n_ffn = required(file.n_ffn, "n_ffn")?;
            if n_att % n_head != 0 {
                return Err(load_error(format!(
                    "n_att {n_att} is not divisible by n_head {n_head}"
                )));
            }
            (n_att, n_ffn, n_head)
        };
        if file.embd_weights.is_empty() {
            return Err(load_error("embedding table is empty".into()));
        }
        Ok(Self {
            version,
            n_layer: file.n_layer,
            n_embd: file.n_embd,
            n_att,
            n_ffn,
            n_head,
            vocab_size: file.embd_weights.len(),
            rescale_layer: file.rescale_layer(),
        })
    }

    /// Channels per head, 0 for v4.
    #[must_use]
    pub fn head_size(&self) -> usize {
        self.n_att.checked_div(self.n_head).unwrap_or(0)
    }

    /// Shape of each layer's state slots.
    #[must_use]
    pub fn state_shapes(&self) -> Vec<Vec<usize>> {
        if self.version == Version::V4 {
            vec![
                vec![self.n_embd],
                vec![self.n_att],
                vec![self.n_att],
                vec![self.n_att],
                vec![self.n_embd],
            ]
        } else {
            let s = self.head_size();
            vec![vec![self.n_embd], vec![self.n_head, s, s], vec![self.n_embd]]
        }
    }

    /// Dimension entries of an exported `.config` file. `head_size` holds
    /// the head count, which is what existing readers expect.
    #[must_use]
    pub fn config_entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("version", self.version.to_string()),
            ("head_size", self.n_head.to_string()),
            ("n_layer", self.n_layer.to_string()),
            ("n_embd", self.n_embd.to_string()),
            ("n_att", self.n_att.to_string()),
            ("n_ffn", self.n_ffn.to_string()),
        ]
    }

    /// Parse the `key: value` lines of an exported `.config` file.
    ///
    /// The vocabulary size is not recorded there and is left at 0.
    ///
    /// # Errors
    /// Returns `Load` when a key is missing or a value is malformed.
    pub fn from_config_text(text: &str) -> Result<Self> {
        let get = |key: &str| {
            text.lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(k, _)| k.trim() == key)
                .map(|(_, v)| v.trim())
                .ok_or_else(|| load_error(format!("config is missing {key}")))
        };
        let number = |key: &str| -> Result<usize> {
            get(key)?
                .parse()
                .map_err(|_| load_error(format!("config value {key} is not a number")))
        };
        let version: Version = get("version")?.parse()?;
        Ok(Self {
            version,
            n_layer: number("n_layer")?,
            n_embd: number("n_embd")?,
            n_att: number("n_att")?,
            n_ffn: number("n_ffn")?,
            n_head: number("head_size")?,
            vocab_size: 0,
            rescale_layer: crate::weights::DEFAULT_RESCALE_LAYER,
        })
    }
}
