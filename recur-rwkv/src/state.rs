//! Recurrent state layout and snapshot files.
//!
//! A snapshot is a msgpack list (one entry per layer) of lists of
//! `{dtype, shape, data}` maps, the same tensor encoding the weight file
//! uses.

use std::path::Path;

use tracing::debug;

use recur::{DType, Error, Result, Tensor};

use crate::config::RwkvConfig;
use crate::version::Version;
use crate::weights::PackedTensor;

/// Per-layer state slots.
pub type States = Vec<Vec<Tensor>>;

/// Stand-in for negative infinity in the v4 running maximum. Finite so
/// that `exp(pp - p)` is 0 rather than NaN.
pub const NEG_INF: f32 = -1e30;

/// Freshly reset states.
///
/// v4 slots are `[att_shift, aa, bb, pp, ffn_shift]` with the three
/// running aggregates in f32; later versions use
/// `[att_shift, wkv, ffn_shift]` with an f32 `[H, S, S]` matrix indexed
/// `[head, key, value]`.
///
/// # Errors
/// Fails when `act_dtype` is not a float type.
pub fn fresh_states(config: &RwkvConfig, act_dtype: DType) -> Result<States> {
    let shapes = config.state_shapes();
    (0..config.n_layer)
        .map(|_| {
            shapes
                .iter()
                .enumerate()
                .map(|(slot, shape)| {
                    let shift = slot == 0 || slot == shapes.len() - 1;
                    let dtype = if shift { act_dtype } else { DType::F32 };
                    let fill = if config.version == Version::V4 && slot == 3 {
                        NEG_INF
                    } else {
                        0.0
                    };
                    Tensor::full(shape, fill, dtype)
                })
                .collect()
        })
        .collect()
}

/// Check that `candidate` has the layer count, slot count and shapes of
/// `current`.
///
/// # Errors
/// Returns `ShapeMismatch` on the first difference.
pub fn check_layout(current: &States, candidate: &States) -> Result<()> {
    if current.len() != candidate.len() {
        return Err(Error::ShapeMismatch {
            expected: vec![current.len()],
            got: vec![candidate.len()],
        });
    }
    for (layer, (ours, theirs)) in current.iter().zip(candidate).enumerate() {
        if ours.len() != theirs.len() {
            return Err(Error::InvalidShape(format!(
                "layer {layer} has {} state slots, expected {}",
                theirs.len(),
                ours.len()
            )));
        }
        for (a, b) in ours.iter().zip(theirs) {
            if a.shape() != b.shape() {
                return Err(Error::ShapeMismatch {
                    expected: a.shape().to_vec(),
                    got: b.shape().to_vec(),
                });
            }
        }
    }
    Ok(())
}

/// Write `states` as a snapshot file.
///
/// # Errors
/// Fails for placeholder states and on IO errors.
pub fn write_state_file(path: impl AsRef<Path>, states: &States) -> Result<()> {
    let packed = states
        .iter()
        .map(|layer| layer.iter().map(PackedTensor::from_tensor).collect())
        .collect::<Result<Vec<Vec<PackedTensor>>>>()?;
    let bytes = rmp_serde::to_vec_named(&packed).map_err(|e| Error::Msgpack(e.to_string()))?;
    std::fs::write(path.as_ref(), bytes)?;
    debug!(path = %path.as_ref().display(), layers = states.len(), "state saved");
    Ok(())
}

/// Read a snapshot file.
///
/// # Errors
/// Fails on IO errors, malformed msgpack and malformed tensors.
pub fn read_state_file(path: impl AsRef<Path>) -> Result<States> {
    let bytes = std::fs::read(path.as_ref())?;
    let packed: Vec<Vec<PackedTensor>> =
        rmp_serde::from_slice(&bytes).map_err(|e| Error::Msgpack(e.to_string()))?;
    let states = packed
        .iter()
        .map(|layer| layer.iter().map(PackedTensor::to_tensor).collect())
        .collect::<Result<States>>()?;
    debug!(path = %path.as_ref().display(), layers = states.len(), "state read");
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(version: Version) -> RwkvConfig {
        RwkvConfig {
            version,
            n_layer: 2,
            n_embd: 8,
            n_att: 8,
            n_ffn: 16,
            n_head: if version == Version::V4 { 0 } else { 2 },
            vocab_size: 4,
            rescale_layer: 999,
        }
    }

    #[test]
    fn test_v4_layout() {
        let states = fresh_states(&config(Version::V4), DType::F16).unwrap();
        assert_eq!(states.len(), 2);
        let layer = &states[0];
        assert_eq!(layer.len(), 5);
        assert_eq!(layer[0].dtype(), DType::F16);
        assert_eq!(layer[1].dtype(), DType::F32);
        assert!(layer[3].to_f32().unwrap().iter().all(|&v| v == NEG_INF));
        assert_eq!(layer[4].dtype(), DType::F16);
    }

    #[test]
    fn test_matrix_layout() {
        let states = fresh_states(&config(Version::V7), DType::F32).unwrap();
        assert_eq!(states[1].len(), 3);
        assert_eq!(states[1][1].shape(), &[2, 4, 4]);
        assert!(states[1][1].to_f32().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_layout_check() {
        let a = fresh_states(&config(Version::V5), DType::F32).unwrap();
        let b = fresh_states(&config(Version::V4), DType::F32).unwrap();
        assert!(check_layout(&a, &a).is_ok());
        assert!(check_layout(&a, &b).is_err());
        assert!(check_layout(&a, &a[..1].to_vec()).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let mut states = fresh_states(&config(Version::V4), DType::F16).unwrap();
        states[1][2] = Tensor::from_f32(&[8], &[0.5, 1.5, -2.0, 3.0, 0.0, 1.0, 2.0, 4.0]);
        let path = std::env::temp_dir().join(format!("recur-state-{}.msgpack", std::process::id()));
        write_state_file(&path, &states).unwrap();
        let back = read_state_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        check_layout(&states, &back).unwrap();
        for (a, b) in states.iter().flatten().zip(back.iter().flatten()) {
            assert_eq!(a.dtype(), b.dtype());
            assert_eq!(a.as_bytes().unwrap(), b.as_bytes().unwrap());
        }
    }
}
