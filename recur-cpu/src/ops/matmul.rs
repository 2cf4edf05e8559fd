//! Matmul for the CPU kernels.
//!
//! All products are f32 row-major `A (M,K) × B (K,N) → C (M,N)`. Rows of
//! `C` are built by accumulating `A[m,k] * B[k,:]`, which walks `B` in
//! storage order and needs no transpose. Output rows are parallelized with
//! Rayon when M > 1.

use rayon::prelude::*;
use recur::{shape, Result, Tensor};
use tracing::trace;

use super::{check_host, output};

/// Accumulate one row of C.
fn gemm_row(a_row: &[f32], b: &[f32], c_row: &mut [f32], n: usize) {
    for (k, &a) in a_row.iter().enumerate() {
        let b_row = &b[k * n..(k + 1) * n];
        for (c, &bv) in c_row.iter_mut().zip(b_row) {
            *c += a * bv;
        }
    }
}

/// Standard gemm: `A (M,K) × B (K,N) → C (M,N)`.
#[allow(clippy::many_single_char_names)]
fn gemm(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    if m == 1 {
        gemm_row(&a[..k], b, &mut c, n);
    } else {
        c.par_chunks_mut(n).enumerate().for_each(|(row, c_row)| {
            gemm_row(&a[row * k..(row + 1) * k], b, c_row, n);
        });
    }
    c
}

/// `a @ b` with the shape rules of [`recur::shape::matmul`].
#[allow(clippy::many_single_char_names)]
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_host("matmul", a)?;
    check_host("matmul", b)?;
    let out_shape = shape::matmul(a.shape(), b.shape())?;
    trace!(a = ?a.shape(), b = ?b.shape(), "matmul");
    let a_data = a.to_f32()?;
    let b_data = b.to_f32()?;

    let k = a.shape()[a.ndim() - 1];
    let n = b.shape()[b.ndim() - 1];

    if b.ndim() == 2 {
        let m = a.numel() / k;
        let c = gemm(&a_data, &b_data, m, k, n);
        return output(&out_shape, &c, a.dtype());
    }

    // Batched: broadcast leading dims, then one gemm per batch entry.
    let m = a.shape()[a.ndim() - 2];
    let batch_shape = &out_shape[..out_shape.len() - 2];
    let a_batch = &a.shape()[..a.ndim() - 2];
    let b_batch = &b.shape()[..b.ndim() - 2];
    let a_strides = shape::broadcast_strides(a_batch, batch_shape);
    let b_strides = shape::broadcast_strides(b_batch, batch_shape);
    let batch_strides = shape::strides(batch_shape);

    let batches = shape::numel(batch_shape);
    let mut c = Vec::with_capacity(batches * m * n);
    for flat in 0..batches {
        let mut ia = 0;
        let mut ib = 0;
        for (dim, stride) in batch_strides.iter().enumerate() {
            let idx = (flat / stride) % batch_shape[dim];
            ia += idx * a_strides[dim];
            ib += idx * b_strides[dim];
        }
        let a_mat = &a_data[ia * m * k..(ia + 1) * m * k];
        let b_mat = &b_data[ib * k * n..(ib + 1) * k * n];
        c.extend(gemm(a_mat, b_mat, m, k, n));
    }
    output(&out_shape, &c, a.dtype())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use recur::DType;

    fn naive(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
            }
        }
        c
    }

    #[test]
    fn test_vector_matrix() {
        let a = Tensor::from_f32(&[2], &[1.0, 2.0]);
        let b = Tensor::from_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[3]);
        assert_eq!(c.as_f32_slice(), &[9.0, 12.0, 15.0]);
    }

    #[test]
    fn test_gemm_matches_naive() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let (m, k, n) = (5, 17, 9);
        let a: Vec<f32> = (0..m * k).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let b: Vec<f32> = (0..k * n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let c = matmul(&Tensor::from_f32(&[m, k], &a), &Tensor::from_f32(&[k, n], &b)).unwrap();
        for (x, y) in c.as_f32_slice().iter().zip(naive(&a, &b, m, k, n)) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_batched_outer_product() {
        // [2,2,1] @ [2,1,2] -> per-head outer products
        let k = Tensor::from_f32(&[2, 2, 1], &[1.0, 2.0, 3.0, 4.0]);
        let v = Tensor::from_f32(&[2, 1, 2], &[1.0, 10.0, 100.0, 1000.0]);
        let c = matmul(&k, &v).unwrap();
        assert_eq!(c.shape(), &[2, 2, 2]);
        assert_eq!(
            c.as_f32_slice(),
            &[1.0, 10.0, 2.0, 20.0, 300.0, 3000.0, 400.0, 4000.0]
        );
    }

    #[test]
    fn test_batch_broadcast() {
        let a = Tensor::from_f32(&[1, 1, 2], &[1.0, 1.0]);
        let b = Tensor::from_f32(&[3, 2, 1], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[3, 1, 1]);
        assert_eq!(c.as_f32_slice(), &[3.0, 7.0, 11.0]);
    }

    #[test]
    fn test_f16_weights_f32_activations() {
        let a = Tensor::from_f32(&[2], &[0.5, 0.25]);
        let b = Tensor::from_f32(&[2, 1], &[2.0, 4.0]).to_dtype(DType::F16).unwrap();
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.dtype(), DType::F32);
        assert_eq!(c.as_f32_slice(), &[2.0]);
    }

    #[test]
    fn test_contraction_mismatch() {
        let a = Tensor::from_f32(&[3], &[0.0; 3]);
        let b = Tensor::from_f32(&[2, 2], &[0.0; 4]);
        assert!(matmul(&a, &b).is_err());
    }
}
