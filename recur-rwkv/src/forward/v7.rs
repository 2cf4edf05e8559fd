//! v7 time mix: delta-rule state update with in-context learning rate.
//!
//! The `[H, S, S]` state is indexed `[head, key, value]`, the same layout
//! as v5 and v6, so the read-out is `r @ S` for every matrix-state version.

use recur::{DType, Dispatcher, Error, Result, Tensor};

use super::v5::head_dims;
use super::{shift_mix, LAYER_NORM_EPS};

/// `-exp(-0.5)`; keeps every decay above `exp(-exp(-0.5))`.
const DECAY_SCALE: f32 = -0.606_531;
const GROUP_NORM_EPS: f32 = 64e-5;

/// Named view of a v7 block's parameters.
pub(super) struct TimeMix<'a> {
    ln_w: &'a Tensor,
    ln_b: &'a Tensor,
    lx_w: &'a Tensor,
    lx_b: &'a Tensor,
    x_r: &'a Tensor,
    x_w: &'a Tensor,
    x_k: &'a Tensor,
    x_v: &'a Tensor,
    x_a: &'a Tensor,
    x_g: &'a Tensor,
    a0: &'a Tensor,
    a1: &'a Tensor,
    a2: &'a Tensor,
    /// `(v0, v1, v2)`, absent on the first layer.
    value_residual: Option<[&'a Tensor; 3]>,
    w0: &'a Tensor,
    w1: &'a Tensor,
    w2: &'a Tensor,
    g1: &'a Tensor,
    g2: &'a Tensor,
    k_k: &'a Tensor,
    k_a: &'a Tensor,
    r_k: &'a Tensor,
    kw: &'a Tensor,
    vw: &'a Tensor,
    rw: &'a Tensor,
    ow: &'a Tensor,
}

impl<'a> TimeMix<'a> {
    pub fn first(w: &'a [Tensor; 25]) -> Self {
        let [ln_w, ln_b, lx_w, lx_b, x_r, x_w, x_k, x_v, x_a, x_g, a0, a1, a2, w0, w1, w2, g1, g2, k_k, k_a, r_k, kw, vw, rw, ow] =
            w;
        Self {
            ln_w,
            ln_b,
            lx_w,
            lx_b,
            x_r,
            x_w,
            x_k,
            x_v,
            x_a,
            x_g,
            a0,
            a1,
            a2,
            value_residual: None,
            w0,
            w1,
            w2,
            g1,
            g2,
            k_k,
            k_a,
            r_k,
            kw,
            vw,
            rw,
            ow,
        }
    }

    pub fn later(w: &'a [Tensor; 28]) -> Self {
        let [ln_w, ln_b, lx_w, lx_b, x_r, x_w, x_k, x_v, x_a, x_g, a0, a1, a2, v0, v1, v2, w0, w1, w2, g1, g2, k_k, k_a, r_k, kw, vw, rw, ow] =
            w;
        Self {
            ln_w,
            ln_b,
            lx_w,
            lx_b,
            x_r,
            x_w,
            x_k,
            x_v,
            x_a,
            x_g,
            a0,
            a1,
            a2,
            value_residual: Some([v0, v1, v2]),
            w0,
            w1,
            w2,
            g1,
            g2,
            k_k,
            k_a,
            r_k,
            kw,
            vw,
            rw,
            ow,
        }
    }
}

/// `bias + (x @ down) @ up`, with an optional activation between the two
/// projections.
fn lora(
    ex: &mut Dispatcher<'_, '_>,
    x: &Tensor,
    down: &Tensor,
    up: &Tensor,
    bias: Option<&Tensor>,
    tanh: bool,
) -> Result<Tensor> {
    let h = ex.matmul(x, down)?;
    let h = if tanh { ex.tanh(&h)? } else { h };
    let h = ex.matmul(&h, up)?;
    match bias {
        Some(bias) => ex.add(bias, &h),
        None => Ok(h),
    }
}

/// `state` is `[shift, wkv, ffn_shift]`; the first two are updated.
/// `v_first` carries the first layer's value vector to later layers.
pub(super) fn time_mix(
    ex: &mut Dispatcher<'_, '_>,
    x: &Tensor,
    state: &mut [Tensor],
    v_first: &mut Option<Tensor>,
    w: &TimeMix<'_>,
) -> Result<Tensor> {
    let xx = ex.layer_norm(x, w.ln_w, w.ln_b, LAYER_NORM_EPS)?;
    let delta = ex.sub(&state[0], &xx)?;
    let xr = shift_mix(ex, &xx, &delta, w.x_r)?;
    let xw = shift_mix(ex, &xx, &delta, w.x_w)?;
    let xk = shift_mix(ex, &xx, &delta, w.x_k)?;
    let xv = shift_mix(ex, &xx, &delta, w.x_v)?;
    let xa = shift_mix(ex, &xx, &delta, w.x_a)?;
    let xg = shift_mix(ex, &xx, &delta, w.x_g)?;
    let (heads, size) = head_dims(&state[1]);

    let r = ex.matmul(&xr, w.rw)?;
    let k = ex.matmul(&xk, w.kw)?;
    let mut v = ex.matmul(&xv, w.vw)?;

    let decay = lora(ex, &xw, w.w1, w.w2, Some(w.w0), true)?;
    let decay = ex.sigmoid(&decay)?;
    let decay = ex.mul_scalar(&decay, DECAY_SCALE)?;
    let decay = ex.exp(&decay)?;
    let decay = ex.reshape(&decay, &[heads, size, 1])?;

    let a = lora(ex, &xa, w.a1, w.a2, Some(w.a0), false)?;
    let a = ex.sigmoid(&a)?;
    let g = ex.matmul(&xg, w.g1)?;
    let g = ex.sigmoid(&g)?;
    let g = ex.matmul(&g, w.g2)?;

    let kk = ex.mul(&k, w.k_k)?;
    let kk = ex.reshape(&kk, &[heads, size])?;
    let kk = ex.l2_norm(&kk)?;
    let kk = ex.flatten(&kk)?;
    let k = {
        let scale = ex.add_scalar(&a, -1.0)?;
        let scale = ex.mul(&scale, w.k_a)?;
        let scale = ex.add_scalar(&scale, 1.0)?;
        ex.mul(&k, &scale)?
    };

    match w.value_residual {
        None => *v_first = Some(v.clone()),
        Some([v0, v1, v2]) => {
            let first = v_first.as_ref().ok_or_else(|| {
                Error::Other("value residual requested before the first layer ran".into())
            })?;
            let mix = lora(ex, &xv, v1, v2, Some(v0), false)?;
            let mix = ex.sigmoid(&mix)?;
            let toward = ex.sub(first, &v)?;
            let toward = ex.mul(&toward, &mix)?;
            v = ex.add(&v, &toward)?;
        }
    }

    // S' = S * w + (kk * a) (-kk^T S) + k v^T
    let s = &state[1];
    let decayed = ex.mul(s, &decay)?;
    let removal = {
        let neg_kk = ex.mul_scalar(&kk, -1.0)?;
        let neg_kk = ex.reshape(&neg_kk, &[heads, 1, size])?;
        let projected = ex.matmul(&neg_kk, s)?;
        let kka = ex.mul(&kk, &a)?;
        let kka = ex.reshape(&kka, &[heads, size, 1])?;
        ex.matmul(&kka, &projected)?
    };
    let write = {
        let kh = ex.reshape(&k, &[heads, size, 1])?;
        let vh = ex.reshape(&v, &[heads, 1, size])?;
        let kv = ex.matmul(&kh, &vh)?;
        ex.cast(&kv, DType::F32)?
    };
    let new_s = ex.add(&decayed, &removal)?;
    let new_s = ex.add(&new_s, &write)?;

    let rh = ex.reshape(&r, &[heads, 1, size])?;
    let out = ex.matmul(&rh, &new_s)?;
    let out = ex.flatten(&out)?;
    let out = ex.group_norm(&out, heads, w.lx_w, w.lx_b, GROUP_NORM_EPS)?;

    // Per-head bonus: (sum(r * k * r_k)) * v
    let bonus = {
        let rk = ex.mul(&r, &k)?;
        let rk = ex.reshape(&rk, &[heads, size])?;
        let rk = ex.mul(&rk, w.r_k)?;
        let rk = ex.sum_last(&rk)?;
        let vh = ex.reshape(&v, &[heads, size])?;
        let bonus = ex.mul(&rk, &vh)?;
        ex.flatten(&bonus)?
    };
    let out = ex.add(&out, &bonus)?;
    let out = ex.mul(&out, &g)?;
    let out = ex.matmul(&out, w.ow)?;

    state[0] = xx;
    state[1] = new_s;
    ex.add(x, &out)
}
