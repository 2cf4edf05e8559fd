//! Weight quantizers used by the export kernels.
//!
//! Byte layouts match what the ncnn runtime kernels read:
//!
//! - **Affine int8** stores a `[K, N]` matrix as `[K/64][N/4][64][4]` bytes,
//!   with one f32 scale and zero point per 64-row column slice.
//! - **NF4** packs `[K, N]` as `[K/64][N/8][256]` bytes, two 4-bit codes per
//!   byte. Every 8-row column slice has its own scale, itself stored as an
//!   int8 multiple of a per-column fp16 scale shared by 16 slices.
//! - **Embedding int8** is symmetric with one fp16 scale per 64 values.

use half::f16;
use recur::{Error, Result};

pub const AFFINE_BLOCK_ROWS: usize = 64;
pub const AFFINE_BLOCK_COLS: usize = 4;

pub const NF4_BLOCK_ROWS: usize = 64;
pub const NF4_BLOCK_COLS: usize = 8;
pub const NF4_GROUP_ROWS: usize = 8;
const NF4_GROUPS: usize = NF4_BLOCK_ROWS / NF4_GROUP_ROWS;
/// Slice scales sharing one fp16 second-level scale.
pub const NF4_SCALE_GROUP: usize = 16;
/// Codes in each packed half of a 32-code run.
const NF4_PACK_RUN: usize = 16;

pub const EMBED_GROUP: usize = 64;

/// Dequantized value of each NF4 code.
pub const NF4_LEVELS: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

fn check_len(what: &str, w: &[f32], k: usize, n: usize) -> Result<()> {
    if w.len() != k * n {
        return Err(Error::ShapeMismatch {
            expected: vec![k, n],
            got: vec![w.len()],
        });
    }
    if k == 0 || n == 0 {
        return Err(Error::InvalidShape(format!("{what}: empty matrix")));
    }
    Ok(())
}

/// Affine int8 weights: `w ≈ q * scale + zero_point`.
#[derive(Debug, Clone)]
pub struct AffineInt8 {
    pub data: Vec<u8>,
    pub scales: Vec<f32>,
    pub zero_points: Vec<f32>,
}

#[must_use]
pub fn affine_int8_fits(k: usize, n: usize) -> bool {
    k > 0 && n > 0 && k % AFFINE_BLOCK_ROWS == 0 && n % AFFINE_BLOCK_COLS == 0
}

/// Quantize a row-major `[k, n]` matrix to affine int8.
///
/// # Errors
/// Fails when the shape does not tile into 64×4 blocks.
pub fn quantize_affine_int8(w: &[f32], k: usize, n: usize) -> Result<AffineInt8> {
    check_len("affine int8", w, k, n)?;
    if !affine_int8_fits(k, n) {
        return Err(Error::InvalidShape(format!(
            "affine int8 needs K % 64 == 0 and N % 4 == 0, got [{k}, {n}]"
        )));
    }
    let blocks = (k / AFFINE_BLOCK_ROWS) * (n / AFFINE_BLOCK_COLS);
    let mut out = AffineInt8 {
        data: Vec::with_capacity(k * n),
        scales: Vec::with_capacity(blocks * AFFINE_BLOCK_COLS),
        zero_points: Vec::with_capacity(blocks * AFFINE_BLOCK_COLS),
    };
    for a in 0..k / AFFINE_BLOCK_ROWS {
        for b in 0..n / AFFINE_BLOCK_COLS {
            let at = |row: usize, col: usize| {
                w[(a * AFFINE_BLOCK_ROWS + row) * n + b * AFFINE_BLOCK_COLS + col]
            };
            let mut scales = [0.0f32; AFFINE_BLOCK_COLS];
            let mut zps = [0.0f32; AFFINE_BLOCK_COLS];
            for col in 0..AFFINE_BLOCK_COLS {
                let (min, max) = (0..AFFINE_BLOCK_ROWS)
                    .map(|row| at(row, col))
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                        (lo.min(v), hi.max(v))
                    });
                #[allow(clippy::float_cmp)]
                let scale = if max == min { 1.0 } else { (max - min) / 255.0 };
                scales[col] = scale;
                zps[col] = min;
            }
            out.scales.extend_from_slice(&scales);
            out.zero_points.extend_from_slice(&zps);
            for row in 0..AFFINE_BLOCK_ROWS {
                for col in 0..AFFINE_BLOCK_COLS {
                    let q = ((at(row, col) - zps[col]) / scales[col]).round();
                    out.data.push(q.clamp(0.0, 255.0) as u8);
                }
            }
        }
    }
    Ok(out)
}

/// Row-major `[k, n]` reconstruction of affine int8 weights.
#[must_use]
pub fn dequantize_affine_int8(q: &AffineInt8, k: usize, n: usize) -> Vec<f32> {
    let mut w = vec![0.0f32; k * n];
    let per_row = n / AFFINE_BLOCK_COLS;
    for (i, &byte) in q.data.iter().enumerate() {
        let block = i / (AFFINE_BLOCK_ROWS * AFFINE_BLOCK_COLS);
        let within = i % (AFFINE_BLOCK_ROWS * AFFINE_BLOCK_COLS);
        let (a, b) = (block / per_row, block % per_row);
        let (row, col) = (within / AFFINE_BLOCK_COLS, within % AFFINE_BLOCK_COLS);
        let slot = block * AFFINE_BLOCK_COLS + col;
        w[(a * AFFINE_BLOCK_ROWS + row) * n + b * AFFINE_BLOCK_COLS + col] =
            f32::from(byte) * q.scales[slot] + q.zero_points[slot];
    }
    w
}

/// NF4 weights with double-quantized scales.
#[derive(Debug, Clone)]
pub struct Nf4 {
    pub data: Vec<u8>,
    pub scales: Vec<i8>,
    /// Per-column second-level scales, pre-divided by 127.
    pub dq_scales: Vec<f16>,
}

/// True when `[k, n]` tiles into an even number of 64×8 superblocks.
#[must_use]
pub fn nf4_fits(k: usize, n: usize) -> bool {
    k > 0
        && n > 0
        && k % NF4_BLOCK_ROWS == 0
        && n % NF4_BLOCK_COLS == 0
        && ((k / NF4_BLOCK_ROWS) * (n / NF4_BLOCK_COLS)) % 2 == 0
}

/// 4-bit code of a value normalized to `[-1, 1]`.
///
/// # Errors
/// Returns `QuantizationRange` outside `[-1, 1]` (and for NaN).
#[allow(clippy::collapsible_else_if)]
pub fn nf4_code(x: f32) -> Result<u8> {
    if !(-1.0..=1.0).contains(&x) {
        return Err(Error::QuantizationRange(format!(
            "nf4 input {x} outside [-1, 1]"
        )));
    }
    let code = if x > 0.039_790_15 {
        if x > 0.389_312_54 {
            if x > 0.642_786_9 {
                if x > 0.861_478_4 { 0b1111 } else { 0b1110 }
            } else {
                if x > 0.501_663_4 { 0b1101 } else { 0b1100 }
            }
        } else {
            if x > 0.203_521_25 {
                if x > 0.292_013_78 { 0b1011 } else { 0b1010 }
            } else {
                if x > 0.120_255_25 { 0b1001 } else { 0b1000 }
            }
        }
    } else {
        if x > -0.339_679_43 {
            if x > -0.137_911_74 {
                if x > -0.045_525_018 { 0b0111 } else { 0b0110 }
            } else {
                if x > -0.234_607_4 { 0b0101 } else { 0b0100 }
            }
        } else {
            if x > -0.610_632_9 {
                if x > -0.459_995_27 { 0b0011 } else { 0b0010 }
            } else {
                if x > -0.848_096_4 { 0b0001 } else { 0b0000 }
            }
        }
    };
    Ok(code)
}

fn flush_scale_group(buffer: &mut Vec<[f32; NF4_BLOCK_COLS]>, out: &mut Nf4) -> Result<()> {
    let mut dq = [0.0f32; NF4_BLOCK_COLS];
    for (col, slot) in dq.iter_mut().enumerate() {
        let max = buffer.iter().map(|s| s[col].abs()).fold(0.0f32, f32::max);
        let second = f16::from_f32(max / 127.0);
        out.dq_scales
            .push(f16::from_f32(second.to_f32() / 127.0));
        *slot = second.to_f32();
    }
    for scales in buffer.iter() {
        for (col, &scale) in scales.iter().enumerate() {
            let q = (scale / dq[col]).round();
            if !(-127.0..=127.0).contains(&q) {
                return Err(Error::QuantizationRange(format!(
                    "nf4 slice scale {scale} is {q} steps of {}",
                    dq[col]
                )));
            }
            out.scales.push(q as i8);
        }
    }
    buffer.clear();
    Ok(())
}

/// Quantize a row-major `[k, n]` matrix to NF4.
///
/// # Errors
/// Fails when the shape does not satisfy [`nf4_fits`] or a value falls
/// outside its slice's range.
pub fn quantize_nf4(w: &[f32], k: usize, n: usize) -> Result<Nf4> {
    check_len("nf4", w, k, n)?;
    if !nf4_fits(k, n) {
        return Err(Error::InvalidShape(format!(
            "nf4 needs an even number of 64x8 superblocks, got [{k}, {n}]"
        )));
    }
    let superblocks = (k / NF4_BLOCK_ROWS) * (n / NF4_BLOCK_COLS);
    let mut out = Nf4 {
        data: Vec::with_capacity(k * n / 2),
        scales: Vec::with_capacity(superblocks * NF4_GROUPS * NF4_BLOCK_COLS),
        dq_scales: Vec::with_capacity(superblocks / 2 * NF4_BLOCK_COLS),
    };
    let mut pending: Vec<[f32; NF4_BLOCK_COLS]> = Vec::with_capacity(NF4_SCALE_GROUP);
    let mut block = [0.0f32; NF4_BLOCK_ROWS * NF4_BLOCK_COLS];

    for a in 0..k / NF4_BLOCK_ROWS {
        for b in 0..n / NF4_BLOCK_COLS {
            for row in 0..NF4_BLOCK_ROWS {
                let src = (a * NF4_BLOCK_ROWS + row) * n + b * NF4_BLOCK_COLS;
                block[row * NF4_BLOCK_COLS..(row + 1) * NF4_BLOCK_COLS]
                    .copy_from_slice(&w[src..src + NF4_BLOCK_COLS]);
            }

            let mut slice_scales = [[0.0f32; NF4_BLOCK_COLS]; NF4_GROUPS];
            for (group, scales) in slice_scales.iter_mut().enumerate() {
                for (col, scale) in scales.iter_mut().enumerate() {
                    let (min, max) = (0..NF4_GROUP_ROWS)
                        .map(|r| block[(group * NF4_GROUP_ROWS + r) * NF4_BLOCK_COLS + col])
                        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                            (lo.min(v), hi.max(v))
                        });
                    #[allow(clippy::float_cmp)]
                    let s = if max == min { 1.0 } else { max.abs().max(min.abs()) };
                    *scale = s;
                }
            }
            pending.extend_from_slice(&slice_scales);
            if pending.len() == NF4_SCALE_GROUP {
                flush_scale_group(&mut pending, &mut out)?;
            }

            let code_at = |idx: usize| {
                let scale = slice_scales[(idx / NF4_BLOCK_COLS) / NF4_GROUP_ROWS][idx % NF4_BLOCK_COLS];
                nf4_code(block[idx] / scale)
            };
            for run in 0..block.len() / (2 * NF4_PACK_RUN) {
                for j in 0..NF4_PACK_RUN {
                    let lo = run * 2 * NF4_PACK_RUN + j;
                    let hi = lo + NF4_PACK_RUN;
                    out.data.push((code_at(hi)? << 4) | code_at(lo)?);
                }
            }
        }
    }
    if !pending.is_empty() {
        return Err(Error::InvalidShape(
            "nf4 scale group left partially filled".into(),
        ));
    }
    Ok(out)
}

/// Row-major `[k, n]` reconstruction of NF4 weights.
#[must_use]
pub fn dequantize_nf4(q: &Nf4, k: usize, n: usize) -> Vec<f32> {
    let mut w = vec![0.0f32; k * n];
    let per_row = n / NF4_BLOCK_COLS;
    let block_bytes = NF4_BLOCK_ROWS * NF4_BLOCK_COLS / 2;
    for (sb, bytes) in q.data.chunks(block_bytes).enumerate() {
        let (a, b) = (sb / per_row, sb % per_row);
        let value = |idx: usize, code: u8| {
            let (row, col) = (idx / NF4_BLOCK_COLS, idx % NF4_BLOCK_COLS);
            let group = row / NF4_GROUP_ROWS;
            let step = q.dq_scales[(sb / 2) * NF4_BLOCK_COLS + col].to_f32() * 127.0;
            let scale = f32::from(q.scales[sb * NF4_GROUPS * NF4_BLOCK_COLS + group * NF4_BLOCK_COLS + col]) * step;
            let dst = (a * NF4_BLOCK_ROWS + row) * n + b * NF4_BLOCK_COLS + col;
            (dst, NF4_LEVELS[usize::from(code)] * scale)
        };
        for (i, &byte) in bytes.iter().enumerate() {
            let (run, j) = (i / NF4_PACK_RUN, i % NF4_PACK_RUN);
            let lo = run * 2 * NF4_PACK_RUN + j;
            let (dst, v) = value(lo, byte & 0x0F);
            w[dst] = v;
            let (dst, v) = value(lo + NF4_PACK_RUN, byte >> 4);
            w[dst] = v;
        }
    }
    w
}

/// Symmetric int8 embedding table.
#[derive(Debug, Clone)]
pub struct EmbeddingInt8 {
    pub data: Vec<i8>,
    pub scales: Vec<f16>,
}

/// Quantize a row-major `[vocab, dim]` embedding table in groups of 64.
/// Groups never cross a row.
///
/// # Errors
/// Fails when `dim` is not a multiple of 64, the length is not a whole
/// number of rows, or a value cannot be represented (NaN or infinite
/// input).
pub fn quantize_embedding(w: &[f32], dim: usize) -> Result<EmbeddingInt8> {
    if dim == 0 || dim % EMBED_GROUP != 0 {
        return Err(Error::InvalidShape(format!(
            "embedding rows of {dim} values do not split into groups of {EMBED_GROUP}"
        )));
    }
    if w.is_empty() || w.len() % dim != 0 {
        return Err(Error::InvalidShape(format!(
            "embedding of {} values is not a whole number of {dim}-wide rows",
            w.len()
        )));
    }
    let mut out = EmbeddingInt8 {
        data: Vec::with_capacity(w.len()),
        scales: Vec::with_capacity(w.len() / EMBED_GROUP),
    };
    for group in w.chunks(EMBED_GROUP) {
        let scale = group.iter().fold(0.0f32, |m, v| m.max(v.abs())) / 127.0;
        out.scales.push(f16::from_f32(scale));
        for &v in group {
            let q = if scale == 0.0 { 0.0 } else { (v / scale).round() };
            if !(-127.0..=127.0).contains(&q) {
                return Err(Error::QuantizationRange(format!(
                    "embedding value {v} with scale {scale}"
                )));
            }
            out.data.push(q as i8);
        }
    }
    Ok(out)
}

#[must_use]
pub fn dequantize_embedding(q: &EmbeddingInt8) -> Vec<f32> {
    q.data
        .chunks(EMBED_GROUP)
        .zip(&q.scales)
        .flat_map(|(group, scale)| {
            let s = scale.to_f32();
            group.iter().map(move |&v| f32::from(v) * s)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn random(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-0.5..0.5)).collect()
    }

    #[test]
    fn test_affine_error_within_scale() {
        let (k, n) = (128, 8);
        let w = random(k * n, 1);
        let q = quantize_affine_int8(&w, k, n).unwrap();
        assert_eq!(q.data.len(), k * n);
        assert_eq!(q.scales.len(), k * n / AFFINE_BLOCK_ROWS);
        let back = dequantize_affine_int8(&q, k, n);
        for (i, (orig, rec)) in w.iter().zip(&back).enumerate() {
            let (row, col) = (i / n, i % n);
            let slot = ((row / 64) * (n / 4) + col / 4) * 4 + col % 4;
            assert!((orig - rec).abs() <= q.scales[slot] * 0.5 + 1e-6);
        }
    }

    #[test]
    fn test_affine_constant_block() {
        let w = vec![0.75f32; 64 * 4];
        let q = quantize_affine_int8(&w, 64, 4).unwrap();
        assert!(q.scales.iter().all(|&s| s == 1.0));
        assert!(q.zero_points.iter().all(|&z| z == 0.75));
        assert!(q.data.iter().all(|&b| b == 0));
        assert_eq!(dequantize_affine_int8(&q, 64, 4), w);
    }

    #[test]
    fn test_affine_rejects_untiled_shape() {
        assert!(quantize_affine_int8(&[0.0; 32 * 4], 32, 4).is_err());
        assert!(!affine_int8_fits(64, 6));
    }

    #[test]
    fn test_nf4_levels_map_to_own_code() {
        for (code, &level) in NF4_LEVELS.iter().enumerate() {
            assert_eq!(usize::from(nf4_code(level).unwrap()), code);
        }
        assert!(NF4_LEVELS.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_nf4_code_range() {
        assert!(nf4_code(1.0001).is_err());
        assert!(nf4_code(f32::NAN).is_err());
        assert_eq!(nf4_code(-1.0).unwrap(), 0);
    }

    #[test]
    fn test_nf4_layout_sizes() {
        let (k, n) = (128, 16);
        assert!(nf4_fits(k, n));
        let q = quantize_nf4(&random(k * n, 2), k, n).unwrap();
        assert_eq!(q.data.len(), k * n / 2);
        assert_eq!(q.scales.len(), k * n / NF4_GROUP_ROWS);
        assert_eq!(q.dq_scales.len(), q.scales.len() / NF4_SCALE_GROUP);
    }

    #[test]
    fn test_nf4_reconstruction_keeps_buckets() {
        let (k, n) = (128, 32);
        let w = random(k * n, 3);
        let q = quantize_nf4(&w, k, n).unwrap();
        let back = dequantize_nf4(&q, k, n);

        let mut agree = 0;
        for (i, (&orig, &rec)) in w.iter().zip(&back).enumerate() {
            let (row, col) = (i / n, i % n);
            let start = (row / NF4_GROUP_ROWS) * NF4_GROUP_ROWS;
            let slice: Vec<f32> = (start..start + NF4_GROUP_ROWS).map(|r| w[r * n + col]).collect();
            let scale = slice.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let reference = nf4_code(orig / scale).unwrap();
            let rebucketed = nf4_code((rec / scale).clamp(-1.0, 1.0)).unwrap();
            if reference == rebucketed {
                agree += 1;
            }
        }
        assert!(agree * 100 >= w.len() * 99, "{agree} of {}", w.len());
    }

    #[test]
    fn test_nf4_odd_superblocks_do_not_fit() {
        assert!(!nf4_fits(64, 8));
        assert!(quantize_nf4(&[0.0; 64 * 8], 64, 8).is_err());
    }

    #[test]
    fn test_nf4_constant_slice_outside_range_fails() {
        // a constant slice gets scale 1.0, so values beyond 1.0 cannot be coded
        let w = vec![5.0f32; 64 * 16];
        assert!(matches!(
            quantize_nf4(&w, 64, 16),
            Err(Error::QuantizationRange(_))
        ));
    }

    #[test]
    fn test_embedding_round_trip_error() {
        let w = random(64 * 3, 4);
        let q = quantize_embedding(&w, 64).unwrap();
        assert_eq!(q.scales.len(), 3);
        let back = dequantize_embedding(&q);
        for (g, (orig, rec)) in w.chunks(64).zip(back.chunks(64)).enumerate() {
            let step = q.scales[g].to_f32();
            for (a, b) in orig.iter().zip(rec) {
                assert!((a - b).abs() <= step * 0.6 + 1e-4);
            }
        }
    }

    #[test]
    fn test_embedding_zero_group_and_bad_input() {
        let q = quantize_embedding(&[0.0; 64], 64).unwrap();
        assert!(q.data.iter().all(|&v| v == 0));
        let mut bad = vec![0.1f32; 64];
        bad[3] = f32::NAN;
        assert!(quantize_embedding(&bad, 64).is_err());
        assert!(quantize_embedding(&[0.0; 10], 64).is_err());
        assert!(quantize_embedding(&[0.0; 96], 64).is_err());
    }

    #[test]
    fn test_embedding_groups_never_span_rows() {
        // 4 rows of 32: the total is a multiple of 64 but each row is not.
        assert!(matches!(
            quantize_embedding(&[0.5; 128], 32),
            Err(Error::InvalidShape(_))
        ));
        let q = quantize_embedding(&random(128 * 2, 5), 128).unwrap();
        assert_eq!(q.scales.len(), 4);
    }
}
