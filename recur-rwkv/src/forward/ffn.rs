//! Channel-mix blocks. Each replaces `shift` with this token's normalized
//! input and returns the new residual stream.

use recur::{Dispatcher, Result, Tensor};

use super::{lerp_mix, shift_mix, LAYER_NORM_EPS};

/// Squared-ReLU key projection followed by the value projection.
fn squared_relu_mlp(
    ex: &mut Dispatcher<'_, '_>,
    kx: &Tensor,
    kw: &Tensor,
    vw: &Tensor,
) -> Result<Tensor> {
    let k = ex.matmul(kx, kw)?;
    let k = ex.relu(&k)?;
    let k = ex.mul(&k, &k)?;
    ex.matmul(&k, vw)
}

/// v4 and v5 family.
pub(super) fn channel_mix(
    ex: &mut Dispatcher<'_, '_>,
    x: &Tensor,
    shift: &mut Tensor,
    w: &[Tensor; 7],
) -> Result<Tensor> {
    let [ln_w, ln_b, k_mix, r_mix, kw, vw, rw] = w;
    let xx = ex.layer_norm(x, ln_w, ln_b, LAYER_NORM_EPS)?;
    let kx = lerp_mix(ex, &xx, shift, k_mix)?;
    let rx = lerp_mix(ex, &xx, shift, r_mix)?;

    let r = ex.matmul(&rx, rw)?;
    let r = ex.sigmoid(&r)?;
    let kv = squared_relu_mlp(ex, &kx, kw, vw)?;
    let out = ex.mul(&r, &kv)?;
    *shift = xx;
    ex.add(x, &out)
}

pub(super) fn channel_mix_v6(
    ex: &mut Dispatcher<'_, '_>,
    x: &Tensor,
    shift: &mut Tensor,
    w: &[Tensor; 7],
) -> Result<Tensor> {
    let [ln_w, ln_b, k_mix, r_mix, kw, vw, rw] = w;
    let xx = ex.layer_norm(x, ln_w, ln_b, LAYER_NORM_EPS)?;
    let delta = ex.sub(shift, &xx)?;
    let kx = shift_mix(ex, &xx, &delta, k_mix)?;
    let rx = shift_mix(ex, &xx, &delta, r_mix)?;

    let r = ex.matmul(&rx, rw)?;
    let r = ex.sigmoid(&r)?;
    let kv = squared_relu_mlp(ex, &kx, kw, vw)?;
    let out = ex.mul(&r, &kv)?;
    *shift = xx;
    ex.add(x, &out)
}

/// v7 drops the receptance gate.
pub(super) fn channel_mix_v7(
    ex: &mut Dispatcher<'_, '_>,
    x: &Tensor,
    shift: &mut Tensor,
    w: &[Tensor; 5],
) -> Result<Tensor> {
    let [ln_w, ln_b, k_mix, kw, vw] = w;
    let xx = ex.layer_norm(x, ln_w, ln_b, LAYER_NORM_EPS)?;
    let delta = ex.sub(shift, &xx)?;
    let kx = shift_mix(ex, &xx, &delta, k_mix)?;
    let out = squared_relu_mlp(ex, &kx, kw, vw)?;
    *shift = xx;
    ex.add(x, &out)
}
