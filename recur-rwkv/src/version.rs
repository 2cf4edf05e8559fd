//! Architecture versions and their parameter layouts.

use std::fmt;
use std::str::FromStr;

use recur::{Error, Result};

/// RWKV architecture revision, fixed at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    V4,
    V5,
    V5_1,
    V5_2,
    V6,
    V7,
}

impl Version {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V4 => "4",
            Self::V5 => "5",
            Self::V5_1 => "5.1",
            Self::V5_2 => "5.2",
            Self::V6 => "6",
            Self::V7 => "7",
        }
    }

    /// 5.1, 5.2 and 6 gate the attention output.
    #[must_use]
    pub const fn has_gate(self) -> bool {
        matches!(self, Self::V5_1 | Self::V5_2 | Self::V6)
    }

    /// Recurrent state tensors per layer.
    #[must_use]
    pub const fn state_slots(self) -> usize {
        match self {
            Self::V4 => 5,
            _ => 3,
        }
    }

    /// Slot holding the channel-mix token shift.
    #[must_use]
    pub const fn ffn_slot(self) -> usize {
        self.state_slots() - 1
    }

    /// Parameters consumed by the time-mix block of layer `layer`.
    #[must_use]
    pub const fn att_param_count(self, layer: usize) -> usize {
        match self {
            Self::V4 => 11,
            Self::V5 => 13,
            Self::V5_1 | Self::V5_2 => 15,
            Self::V6 => 21,
            Self::V7 if layer == 0 => 25,
            Self::V7 => 28,
        }
    }

    /// Parameters consumed by the channel-mix block.
    #[must_use]
    pub const fn ffn_param_count(self) -> usize {
        match self {
            Self::V7 => 5,
            _ => 7,
        }
    }

    /// Weight-file names for layer `layer`, in the order the forward pass
    /// consumes them.
    #[must_use]
    pub fn layer_param_names(self, layer: usize) -> Vec<String> {
        let block = format!("blocks.{layer}.");
        let att = format!("blocks.{layer}.att.");
        let ffn = format!("blocks.{layer}.ffn.");
        let mut names = vec![format!("{block}ln1.weight"), format!("{block}ln1.bias")];
        let push_att = |names: &mut Vec<String>, keys: &[&str]| {
            names.extend(keys.iter().map(|key| format!("{att}{key}")));
        };

        if self != Self::V4 {
            push_att(&mut names, &["ln_x.weight", "ln_x.bias"]);
        }
        if self == Self::V7 {
            push_att(&mut names, &["x_r", "x_w", "x_k", "x_v", "x_a", "x_g", "a0", "a1", "a2"]);
            if layer > 0 {
                push_att(&mut names, &["v0", "v1", "v2"]);
            }
            push_att(
                &mut names,
                &["w0", "w1", "w2", "g1", "g2", "k_k", "k_a", "r_k"],
            );
        } else {
            if self == Self::V6 {
                push_att(&mut names, &["time_mix_x", "time_mix_w"]);
            }
            push_att(&mut names, &["time_mix_k", "time_mix_v", "time_mix_r"]);
            if self.has_gate() {
                push_att(&mut names, &["time_mix_g"]);
            }
            if self == Self::V6 {
                push_att(
                    &mut names,
                    &["time_mix_w1", "time_mix_w2", "time_decay_w1", "time_decay_w2"],
                );
            }
            push_att(&mut names, &["time_decay", "time_first"]);
        }
        push_att(&mut names, &["key.weight", "value.weight", "receptance.weight"]);
        if self.has_gate() {
            push_att(&mut names, &["gate.weight"]);
        }
        push_att(&mut names, &["output.weight"]);

        names.push(format!("{block}ln2.weight"));
        names.push(format!("{block}ln2.bias"));
        if self == Self::V7 {
            names.push(format!("{ffn}x_k"));
        } else {
            names.push(format!("{ffn}time_mix_k"));
            names.push(format!("{ffn}time_mix_r"));
        }
        names.push(format!("{ffn}key.weight"));
        names.push(format!("{ffn}value.weight"));
        if self != Self::V7 {
            names.push(format!("{ffn}receptance.weight"));
        }
        names
    }

    /// Every parameter name of an `n_layer` model, head last.
    #[must_use]
    pub fn param_names(self, n_layer: usize) -> Vec<String> {
        let mut names: Vec<String> = (0..n_layer)
            .flat_map(|layer| self.layer_param_names(layer))
            .collect();
        names.extend(["ln_out.weight", "ln_out.bias", "head.weight"].map(String::from));
        names
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "4" => Ok(Self::V4),
            "5" => Ok(Self::V5),
            "5.1" => Ok(Self::V5_1),
            "5.2" => Ok(Self::V5_2),
            "6" => Ok(Self::V6),
            "7" => Ok(Self::V7),
            other => Err(Error::UnsupportedVersion(other.to_string())),
        }
    }
}
