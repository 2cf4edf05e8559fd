//! v6 time mix: data-dependent token shift and decay.

use recur::{Dispatcher, Error, Result, Tensor};

use super::v5::{head_dims, wkv_step};
use super::{shift_mix, GROUP_NORM_EPS, LAYER_NORM_EPS};

/// Number of interpolated inputs (w, k, v, r, g).
const MIXES: usize = 5;

/// `state` is `[shift, wkv, ffn_shift]`; the first two are updated.
pub(super) fn time_mix(
    ex: &mut Dispatcher<'_, '_>,
    x: &Tensor,
    state: &mut [Tensor],
    w: &[Tensor; 21],
) -> Result<Tensor> {
    let [ln_w, ln_b, lx_w, lx_b, x_mix, w_mix, k_mix, v_mix, r_mix, g_mix, tm_w1, tm_w2, td_w1, td_w2, t_decay, t_first, kw, vw, rw, gw, ow] =
        w;
    let xx = ex.layer_norm(x, ln_w, ln_b, LAYER_NORM_EPS)?;
    let delta = ex.sub(&state[0], &xx)?;

    // Low-rank offsets for the five interpolation factors.
    let xxx = shift_mix(ex, &xx, &delta, x_mix)?;
    let xxx = ex.matmul(&xxx, tm_w1)?;
    let xxx = ex.tanh(&xxx)?;
    let rank = xxx.numel() / MIXES;
    let xxx = ex.reshape(&xxx, &[MIXES, 1, rank])?;
    let xxx = ex.matmul(&xxx, tm_w2)?;
    let channels = xxx.numel() / MIXES;
    let xxx = ex.reshape(&xxx, &[MIXES, channels])?;
    let offsets = ex.split(&xxx, MIXES)?;
    let [mw, mk, mv, mr, mg] = <[Tensor; MIXES]>::try_from(offsets)
        .map_err(|parts| Error::InvalidShape(format!("split gave {} parts", parts.len())))?;

    let mut mixed = Vec::with_capacity(MIXES);
    for (offset, base) in [(mw, w_mix), (mk, k_mix), (mv, v_mix), (mr, r_mix), (mg, g_mix)] {
        let offset = ex.flatten(&offset)?;
        let factor = ex.add(base, &offset)?;
        mixed.push(shift_mix(ex, &xx, &delta, &factor)?);
    }
    let [xw, xk, xv, xr, xg] = <[Tensor; MIXES]>::try_from(mixed)
        .map_err(|_| Error::Other("token-shift mix count".into()))?;

    let (heads, size) = head_dims(&state[1]);
    let decay = ex.matmul(&xw, td_w1)?;
    let decay = ex.tanh(&decay)?;
    let decay = ex.matmul(&decay, td_w2)?;
    let decay = ex.reshape(&decay, &[heads, size, 1])?;
    let decay = ex.add(t_decay, &decay)?;
    let decay = ex.exp(&decay)?;
    let decay = ex.rsub_scalar(&decay, 0.0)?;
    let decay = ex.exp(&decay)?;

    let r = ex.matmul(&xr, rw)?;
    let k = ex.matmul(&xk, kw)?;
    let v = ex.matmul(&xv, vw)?;
    let g = ex.matmul(&xg, gw)?;
    let g = ex.silu(&g)?;
    let (out, new_s) = wkv_step(ex, &state[1], &r, &k, &v, t_first, &decay)?;

    let out = ex.group_norm(&out, heads, lx_w, lx_b, GROUP_NORM_EPS)?;
    let out = ex.mul(&out, &g)?;
    let out = ex.matmul(&out, ow)?;
    state[0] = xx;
    state[1] = new_s;
    ex.add(x, &out)
}
