//! Shared helpers for RWKV integration tests.
//!
//! Builds synthetic weight files with seeded random values so every
//! version can be loaded, run and exported without real checkpoints.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use recur_rwkv::{PackedTensor, Version, WeightFile};

/// Model dimensions for a synthetic weight file.
#[derive(Debug, Clone, Copy)]
pub struct Dims {
    pub n_layer: usize,
    pub n_embd: usize,
    pub n_att: usize,
    pub n_ffn: usize,
    pub n_head: usize,
    pub vocab: usize,
    /// Rank of the v6 and v7 low-rank projections.
    pub lora: usize,
}

/// Small enough to run in milliseconds, large enough to tile into the
/// export quantizer's blocks.
pub const SMALL: Dims = Dims {
    n_layer: 2,
    n_embd: 64,
    n_att: 64,
    n_ffn: 128,
    n_head: 2,
    vocab: 64,
    lora: 16,
};

pub const ALL_VERSIONS: [Version; 6] = [
    Version::V4,
    Version::V5,
    Version::V5_1,
    Version::V5_2,
    Version::V6,
    Version::V7,
];

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A per-process, per-test path under the temp directory.
pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("recur-rwkv-{}-{name}", std::process::id()))
}

struct Filler {
    rng: StdRng,
}

impl Filler {
    fn uniform(&mut self, shape: &[usize], lo: f32, hi: f32) -> PackedTensor {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|_| self.rng.gen_range(lo..hi)).collect();
        PackedTensor::from_f32(shape, &values)
    }

    fn matrix(&mut self, rows: usize, cols: usize) -> PackedTensor {
        let bound = 1.0 / (rows as f32).sqrt();
        self.uniform(&[rows, cols], -bound, bound)
    }

    /// Stored as `[1, 1, n]`, the way checkpoints keep mix vectors.
    fn mix(&mut self, n: usize) -> PackedTensor {
        self.uniform(&[1, 1, n], 0.1, 0.9)
    }
}

fn param(version: Version, dims: &Dims, key: &str, f: &mut Filler) -> PackedTensor {
    let (c, a, ffn, h, r) = (dims.n_embd, dims.n_att, dims.n_ffn, dims.n_head, dims.lora);
    let s = if h == 0 { a } else { a / h };
    if let Some(ffn_key) = key.strip_prefix("ffn.") {
        return match ffn_key {
            "key.weight" => f.matrix(c, ffn),
            "value.weight" => f.matrix(ffn, c),
            "receptance.weight" => f.matrix(c, c),
            _ => f.mix(c),
        };
    }
    match key {
        "ln1.weight" | "ln2.weight" => f.uniform(&[c], 0.8, 1.2),
        "ln1.bias" | "ln2.bias" => f.uniform(&[c], -0.1, 0.1),
        "att.ln_x.weight" => f.uniform(&[a], 0.8, 1.2),
        "att.ln_x.bias" => f.uniform(&[a], -0.1, 0.1),
        "att.key.weight" | "att.value.weight" | "att.receptance.weight" | "att.gate.weight" => {
            f.matrix(c, a)
        }
        "att.output.weight" => f.matrix(a, c),
        "att.time_decay" => match version {
            // Stored already as -exp(w) for v4 and exp(-exp(w)) for v5.
            Version::V4 => f.uniform(&[a], -2.0, -0.1),
            Version::V5 | Version::V5_1 | Version::V5_2 => f.uniform(&[h, s], 0.5, 0.99),
            _ => f.uniform(&[1, 1, a], -2.0, 0.5),
        },
        "att.time_first" => match version {
            Version::V4 => f.uniform(&[a], -0.5, 0.5),
            _ => f.uniform(&[h, s], -0.5, 0.5),
        },
        "att.time_mix_w1" => f.uniform(&[c, 5 * r], -0.1, 0.1),
        "att.time_mix_w2" => f.uniform(&[5, r, c], -0.1, 0.1),
        "att.time_decay_w1" => f.uniform(&[c, r], -0.1, 0.1),
        "att.time_decay_w2" => f.uniform(&[r, a], -0.1, 0.1),
        "att.a1" | "att.v1" | "att.w1" | "att.g1" => f.uniform(&[c, r], -0.1, 0.1),
        "att.a2" | "att.v2" | "att.w2" | "att.g2" => f.uniform(&[r, c], -0.1, 0.1),
        "att.w0" => f.uniform(&[1, 1, c], -1.0, 0.0),
        "att.r_k" => f.uniform(&[h, s], -0.2, 0.2),
        // time_mix_*, x_*, a0, v0, k_k, k_a
        _ => f.mix(c),
    }
}

/// A complete weight file for `version` with random parameters.
pub fn weight_file(version: Version, dims: &Dims, seed: u64) -> WeightFile {
    init_tracing();
    let mut f = Filler {
        rng: StdRng::seed_from_u64(seed),
    };
    let mut file = WeightFile {
        n_layer: dims.n_layer,
        n_embd: dims.n_embd,
        version: (version != Version::V4).then(|| version.to_string()),
        ..WeightFile::default()
    };
    if version != Version::V4 {
        file.n_head = Some(dims.n_head);
        file.n_att = Some(dims.n_att);
        file.n_ffn = Some(dims.n_ffn);
    }

    for name in version.param_names(dims.n_layer) {
        let tensor = match name.as_str() {
            "ln_out.weight" => f.uniform(&[dims.n_embd], 0.8, 1.2),
            "ln_out.bias" => f.uniform(&[dims.n_embd], -0.1, 0.1),
            "head.weight" => f.matrix(dims.n_embd, dims.vocab),
            _ => {
                let key = name
                    .splitn(3, '.')
                    .nth(2)
                    .expect("layer parameter names have a block prefix");
                param(version, dims, key, &mut f)
            }
        };
        file.weights.insert(name, tensor);
    }
    file.embd_weights = (0..dims.vocab)
        .map(|_| f.uniform(&[dims.n_embd], -1.0, 1.0))
        .collect();
    file
}

/// Largest absolute elementwise difference.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
