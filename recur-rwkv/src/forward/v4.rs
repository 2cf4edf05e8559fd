//! v4 time mix with the log-sum-exp WKV recurrence.

use recur::{DType, Dispatcher, Result, Tensor};

use super::{lerp_mix, LAYER_NORM_EPS};

/// `state` is `[shift, aa, bb, pp, ffn_shift]`; the first four are updated.
pub(super) fn time_mix(
    ex: &mut Dispatcher<'_, '_>,
    x: &Tensor,
    state: &mut [Tensor],
    w: &[Tensor; 11],
) -> Result<Tensor> {
    let [ln_w, ln_b, k_mix, v_mix, r_mix, t_decay, t_first, kw, vw, rw, ow] = w;
    let xx = ex.layer_norm(x, ln_w, ln_b, LAYER_NORM_EPS)?;
    let sx = &state[0];
    let kx = lerp_mix(ex, &xx, sx, k_mix)?;
    let vx = lerp_mix(ex, &xx, sx, v_mix)?;
    let rx = lerp_mix(ex, &xx, sx, r_mix)?;

    let r = ex.matmul(&rx, rw)?;
    let r = ex.sigmoid(&r)?;
    let k = ex.matmul(&kx, kw)?;
    let k = ex.cast(&k, DType::F32)?;
    let v = ex.matmul(&vx, vw)?;
    let v = ex.cast(&v, DType::F32)?;
    let (aa, bb, pp) = (&state[1], &state[2], &state[3]);

    // Output for this token.
    let ww = ex.add(t_first, &k)?;
    let p = ex.maximum(pp, &ww)?;
    let e1 = ex.sub(pp, &p)?;
    let e1 = ex.exp(&e1)?;
    let e2 = ex.sub(&ww, &p)?;
    let e2 = ex.exp(&e2)?;
    let num = {
        let a = ex.mul(&e1, aa)?;
        let b = ex.mul(&e2, &v)?;
        ex.add(&a, &b)?
    };
    let den = {
        let a = ex.mul(&e1, bb)?;
        ex.add(&a, &e2)?
    };
    let wkv = ex.div(&num, &den)?;

    // Decay the aggregates and fold this token in.
    let ww = ex.add(t_decay, pp)?;
    let p = ex.maximum(&ww, &k)?;
    let e1 = ex.sub(&ww, &p)?;
    let e1 = ex.exp(&e1)?;
    let e2 = ex.sub(&k, &p)?;
    let e2 = ex.exp(&e2)?;
    let new_aa = {
        let a = ex.mul(&e1, aa)?;
        let b = ex.mul(&e2, &v)?;
        ex.add(&a, &b)?
    };
    let new_bb = {
        let a = ex.mul(&e1, bb)?;
        ex.add(&a, &e2)?
    };

    let rwkv = ex.mul(&r, &wkv)?;
    let out = ex.matmul(&rwkv, ow)?;
    state[0] = xx;
    state[1] = new_aa;
    state[2] = new_bb;
    state[3] = p;
    ex.add(x, &out)
}
