//! Element-wise activations and softmax.

use recur::kernels::UnaryOp;
use recur::{Error, Result, Tensor};

use super::{check_host, output};

pub fn unary(op: UnaryOp, x: &Tensor) -> Result<Tensor> {
    check_host(op.name(), x)?;
    let out: Vec<f32> = x.to_f32()?.iter().map(|&v| op.apply(v)).collect();
    output(x.shape(), &out, x.dtype())
}

/// Softmax over each last-axis row of `x / temperature`.
///
/// The row max is subtracted before exponentiating, so very large logits
/// stay finite.
pub fn softmax(x: &Tensor, temperature: f32) -> Result<Tensor> {
    check_host("softmax", x)?;
    if temperature <= 0.0 || !temperature.is_finite() {
        return Err(Error::Other(format!(
            "softmax temperature must be positive, got {temperature}"
        )));
    }
    let data = x.to_f32()?;
    let width = x.shape().last().copied().unwrap_or(1).max(1);
    let mut out = vec![0.0f32; data.len()];
    for (row_in, row_out) in data.chunks(width).zip(out.chunks_mut(width)) {
        let max = row_in.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let mut sum = 0.0f32;
        for (o, &v) in row_out.iter_mut().zip(row_in) {
            *o = ((v - max) / temperature).exp();
            sum += *o;
        }
        for o in row_out.iter_mut() {
            *o /= sum;
        }
    }
    output(x.shape(), &out, x.dtype())
}
