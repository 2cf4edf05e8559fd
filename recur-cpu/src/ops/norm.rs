//! Layer, group and L2 normalization over the last axis.

use recur::{Error, Result, Tensor};

use super::{check_host, output};

/// Floor applied to the L2 norm before dividing.
pub const L2_NORM_EPS: f32 = 1e-7;

fn normalize_into(row: &[f32], weight: &[f32], bias: &[f32], eps: f32, out: &mut [f32]) {
    let n = row.len() as f32;
    let mean = row.iter().sum::<f32>() / n;
    let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let inv = 1.0 / (var + eps).sqrt();
    for (i, o) in out.iter_mut().enumerate() {
        *o = (row[i] - mean) * inv * weight[i] + bias[i];
    }
}

fn check_affine(op: &str, x: &Tensor, weight: &Tensor, bias: &Tensor, width: usize) -> Result<()> {
    check_host(op, x)?;
    check_host(op, weight)?;
    check_host(op, bias)?;
    if weight.numel() != width || bias.numel() != width {
        return Err(Error::ShapeMismatch {
            expected: vec![width],
            got: weight.shape().to_vec(),
        });
    }
    Ok(())
}

pub fn layer_norm(x: &Tensor, weight: &Tensor, bias: &Tensor, eps: f32) -> Result<Tensor> {
    let width = x.shape().last().copied().unwrap_or(0);
    check_affine("layernorm", x, weight, bias, width)?;
    let data = x.to_f32()?;
    let w = weight.to_f32()?;
    let b = bias.to_f32()?;
    let mut out = vec![0.0f32; data.len()];
    for (row, dst) in data.chunks(width).zip(out.chunks_mut(width)) {
        normalize_into(row, &w, &b, eps, dst);
    }
    output(x.shape(), &out, x.dtype())
}

/// Each last-axis row is cut into `groups` slices normalized on their own;
/// `weight` and `bias` then apply per channel across the whole row.
pub fn group_norm(
    x: &Tensor,
    groups: usize,
    weight: &Tensor,
    bias: &Tensor,
    eps: f32,
) -> Result<Tensor> {
    let width = x.shape().last().copied().unwrap_or(0);
    check_affine("groupnorm", x, weight, bias, width)?;
    if groups == 0 || width % groups != 0 {
        return Err(Error::InvalidShape(format!(
            "groupnorm: {width} channels do not split into {groups} groups"
        )));
    }
    let group = width / groups;
    let data = x.to_f32()?;
    let w = weight.to_f32()?;
    let b = bias.to_f32()?;
    let mut out = vec![0.0f32; data.len()];
    for (row, dst) in data.chunks(width).zip(out.chunks_mut(width)) {
        for g in 0..groups {
            let span = g * group..(g + 1) * group;
            normalize_into(
                &row[span.clone()],
                &w[span.clone()],
                &b[span.clone()],
                eps,
                &mut dst[span],
            );
        }
    }
    output(x.shape(), &out, x.dtype())
}

pub fn l2_norm(x: &Tensor) -> Result<Tensor> {
    check_host("l2norm", x)?;
    let width = x.shape().last().copied().unwrap_or(1).max(1);
    let data = x.to_f32()?;
    let mut out = vec![0.0f32; data.len()];
    for (row, dst) in data.chunks(width).zip(out.chunks_mut(width)) {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(L2_NORM_EPS);
        for (o, v) in dst.iter_mut().zip(row) {
            *o = v / norm;
        }
    }
    output(x.shape(), &out, x.dtype())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ones(n: usize) -> Tensor {
        Tensor::from_f32(&[n], &vec![1.0; n])
    }

    fn zeros(n: usize) -> Tensor {
        Tensor::from_f32(&[n], &vec![0.0; n])
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let x = Tensor::from_f32(&[4], &[1.0, 2.0, 3.0, 4.0]);
        let y = layer_norm(&x, &ones(4), &zeros(4), 1e-5).unwrap();
        let v = y.as_f32_slice();
        let mean: f32 = v.iter().sum::<f32>() / 4.0;
        let var: f32 = v.iter().map(|a| a * a).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_layer_norm_affine() {
        let x = Tensor::from_f32(&[2], &[0.0, 2.0]);
        let w = Tensor::from_f32(&[2], &[2.0, 3.0]);
        let b = Tensor::from_f32(&[2], &[0.5, -0.5]);
        let y = layer_norm(&x, &w, &b, 0.0).unwrap();
        assert_eq!(y.as_f32_slice(), &[-1.5, 2.5]);
    }

    #[test]
    fn test_group_norm_groups_are_independent() {
        // second group is the first shifted by 100; both normalize the same
        let x = Tensor::from_f32(&[6], &[1.0, 2.0, 3.0, 101.0, 102.0, 103.0]);
        let y = group_norm(&x, 2, &ones(6), &zeros(6), 1e-5).unwrap();
        let v = y.as_f32_slice();
        for i in 0..3 {
            assert!((v[i] - v[i + 3]).abs() < 1e-4);
        }
        assert!(group_norm(&x, 4, &ones(6), &zeros(6), 1e-5).is_err());
    }

    #[test]
    fn test_l2_norm_rows() {
        let x = Tensor::from_f32(&[2, 2], &[3.0, 4.0, 0.0, 0.0]);
        let y = l2_norm(&x).unwrap();
        assert_eq!(y.as_f32_slice(), &[0.6, 0.8, 0.0, 0.0]);
    }
}
