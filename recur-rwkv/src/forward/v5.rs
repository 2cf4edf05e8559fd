//! v5, v5.1 and v5.2 time mix: per-head matrix state.

use recur::{DType, Dispatcher, Result, Tensor};

use super::{lerp_mix, GROUP_NORM_EPS, LAYER_NORM_EPS};

/// Named view of a v5-family block's parameters.
pub(super) struct TimeMix<'a> {
    ln_w: &'a Tensor,
    ln_b: &'a Tensor,
    lx_w: &'a Tensor,
    lx_b: &'a Tensor,
    k_mix: &'a Tensor,
    v_mix: &'a Tensor,
    r_mix: &'a Tensor,
    /// `(g_mix, gw)` for 5.1 and 5.2.
    gate: Option<(&'a Tensor, &'a Tensor)>,
    t_decay: &'a Tensor,
    t_first: &'a Tensor,
    kw: &'a Tensor,
    vw: &'a Tensor,
    rw: &'a Tensor,
    ow: &'a Tensor,
}

impl<'a> TimeMix<'a> {
    pub fn plain(w: &'a [Tensor; 13]) -> Self {
        let [ln_w, ln_b, lx_w, lx_b, k_mix, v_mix, r_mix, t_decay, t_first, kw, vw, rw, ow] = w;
        Self {
            ln_w,
            ln_b,
            lx_w,
            lx_b,
            k_mix,
            v_mix,
            r_mix,
            gate: None,
            t_decay,
            t_first,
            kw,
            vw,
            rw,
            ow,
        }
    }

    pub fn gated(w: &'a [Tensor; 15]) -> Self {
        let [ln_w, ln_b, lx_w, lx_b, k_mix, v_mix, r_mix, g_mix, t_decay, t_first, kw, vw, rw, gw, ow] =
            w;
        Self {
            ln_w,
            ln_b,
            lx_w,
            lx_b,
            k_mix,
            v_mix,
            r_mix,
            gate: Some((g_mix, gw)),
            t_decay,
            t_first,
            kw,
            vw,
            rw,
            ow,
        }
    }
}

/// Heads and head size from the `[H, S, S]` state.
pub(super) fn head_dims(s: &Tensor) -> (usize, usize) {
    let shape = s.shape();
    (shape[0], shape[shape.len() - 1])
}

/// Read-out and update of a `[H, S, S]` state given per-head `r`, `k`, `v`
/// and the decay. Returns the flattened read-out and the new state.
pub(super) fn wkv_step(
    ex: &mut Dispatcher<'_, '_>,
    s: &Tensor,
    r: &Tensor,
    k: &Tensor,
    v: &Tensor,
    t_first: &Tensor,
    decay: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let (h, n) = head_dims(s);
    let r = ex.reshape(r, &[h, 1, n])?;
    let k = ex.reshape(k, &[h, n, 1])?;
    let v = ex.reshape(v, &[h, 1, n])?;

    let a = ex.matmul(&k, &v)?;
    let a = ex.cast(&a, DType::F32)?;
    let bonus = ex.mul(&a, t_first)?;
    let read = ex.add(&bonus, s)?;
    let out = ex.matmul(&r, &read)?;
    let out = ex.flatten(&out)?;

    let decayed = ex.mul(s, decay)?;
    let new_s = ex.add(&a, &decayed)?;
    Ok((out, new_s))
}

/// `state` is `[shift, wkv, ffn_shift]`; the first two are updated.
pub(super) fn time_mix(
    ex: &mut Dispatcher<'_, '_>,
    x: &Tensor,
    state: &mut [Tensor],
    w: &TimeMix<'_>,
) -> Result<Tensor> {
    let xx = ex.layer_norm(x, w.ln_w, w.ln_b, LAYER_NORM_EPS)?;
    let sx = &state[0];
    let kx = lerp_mix(ex, &xx, sx, w.k_mix)?;
    let vx = lerp_mix(ex, &xx, sx, w.v_mix)?;
    let rx = lerp_mix(ex, &xx, sx, w.r_mix)?;
    let gate = match w.gate {
        Some((g_mix, gw)) => {
            let gx = lerp_mix(ex, &xx, sx, g_mix)?;
            let g = ex.matmul(&gx, gw)?;
            Some(ex.silu(&g)?)
        }
        None => None,
    };

    let r = ex.matmul(&rx, w.rw)?;
    let k = ex.matmul(&kx, w.kw)?;
    let v = ex.matmul(&vx, w.vw)?;
    let (out, new_s) = wkv_step(ex, &state[1], &r, &k, &v, w.t_first, w.t_decay)?;

    let (heads, _) = head_dims(&state[1]);
    let mut out = ex.group_norm(&out, heads, w.lx_w, w.lx_b, GROUP_NORM_EPS)?;
    if let Some(g) = gate {
        out = ex.mul(&out, &g)?;
    }
    let out = ex.matmul(&out, w.ow)?;
    state[0] = xx;
    state[1] = new_s;
    ex.add(x, &out)
}
