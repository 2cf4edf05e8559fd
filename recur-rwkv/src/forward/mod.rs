//! Version-specific forward passes.
//!
//! Every block is written against [`Dispatcher`], so the same code computes
//! on eager kernel sets and records a graph on meta ones. A block takes its
//! parameters as a fixed-size array sliced off the model's flat parameter
//! list; the array length is the per-version parameter count.

mod ffn;
mod v4;
mod v5;
mod v6;
mod v7;

use recur::{DType, Dispatcher, Error, Result, Tensor};

use crate::config::RwkvConfig;
use crate::version::Version;

/// Group-norm epsilon for v5 and v6 attention output.
pub(crate) const GROUP_NORM_EPS: f32 = 1e-5;
pub(crate) const LAYER_NORM_EPS: f32 = 1e-5;

/// Weights needed for one step.
pub(crate) struct Weights<'a> {
    pub config: &'a RwkvConfig,
    pub params: &'a [Tensor],
    pub embedding: &'a Tensor,
}

/// Cursor over the flat parameter list.
pub(crate) struct Params<'a> {
    params: &'a [Tensor],
    pos: usize,
}

impl<'a> Params<'a> {
    pub fn new(params: &'a [Tensor]) -> Self {
        Self { params, pos: 0 }
    }

    /// The next `N` parameters.
    pub fn take<const N: usize>(&mut self) -> Result<&'a [Tensor; N]> {
        let end = self.pos + N;
        let chunk = self.params.get(self.pos..end).ok_or_else(|| {
            Error::Load {
                path: "parameters".into(),
                reason: format!("need {end} parameters, model has {}", self.params.len()),
            }
        })?;
        self.pos = end;
        <&[Tensor; N]>::try_from(chunk).map_err(|_| Error::Other("parameter slice length".into()))
    }
}

/// `xx * mix + sx * (1 - mix)`
pub(crate) fn lerp_mix(
    ex: &mut Dispatcher<'_, '_>,
    xx: &Tensor,
    sx: &Tensor,
    mix: &Tensor,
) -> Result<Tensor> {
    let a = ex.mul(xx, mix)?;
    let keep = ex.rsub_scalar(mix, 1.0)?;
    let b = ex.mul(sx, &keep)?;
    ex.add(&a, &b)
}

/// `xx + delta * mix`, where `delta = sx - xx`.
pub(crate) fn shift_mix(
    ex: &mut Dispatcher<'_, '_>,
    xx: &Tensor,
    delta: &Tensor,
    mix: &Tensor,
) -> Result<Tensor> {
    let scaled = ex.mul(delta, mix)?;
    ex.add(xx, &scaled)
}

/// Replace every state slot with a named graph input.
fn declare_state_inputs(ex: &mut Dispatcher<'_, '_>, states: &mut [Vec<Tensor>]) -> Result<()> {
    for (i, layer) in states.iter_mut().enumerate() {
        for (j, slot) in layer.iter_mut().enumerate() {
            *slot = ex.graph_input(slot.shape(), &format!("state_{i}_{j}"))?;
        }
    }
    Ok(())
}

fn mark_state_outputs(
    ex: &mut Dispatcher<'_, '_>,
    layer: usize,
    slots: std::ops::Range<usize>,
    state: &mut [Tensor],
) -> Result<()> {
    for j in slots {
        state[j] = ex.mark_output(&state[j], &format!("output_state_{layer}_{j}"))?;
    }
    Ok(())
}

/// Advance `states` by one token. The head runs only when `with_head` is
/// set; otherwise `Ok(None)` is returned.
pub(crate) fn step(
    ex: &mut Dispatcher<'_, '_>,
    weights: &Weights<'_>,
    states: &mut [Vec<Tensor>],
    token: u32,
    with_head: bool,
) -> Result<Option<Tensor>> {
    let config = weights.config;
    let version = config.version;
    let tracing = ex.device().is_meta();
    if tracing {
        declare_state_inputs(ex, states)?;
    }

    let mut x = ex.embedding(weights.embedding, token)?;
    let mut params = Params::new(weights.params);
    let mut v_first: Option<Tensor> = None;
    let ffn_slot = version.ffn_slot();

    for (i, state) in states.iter_mut().enumerate() {
        x = match version {
            Version::V4 => v4::time_mix(ex, &x, state, params.take()?)?,
            Version::V5 => v5::time_mix(ex, &x, state, &v5::TimeMix::plain(params.take()?))?,
            Version::V5_1 | Version::V5_2 => {
                v5::time_mix(ex, &x, state, &v5::TimeMix::gated(params.take()?))?
            }
            Version::V6 => v6::time_mix(ex, &x, state, params.take()?)?,
            Version::V7 => {
                let block = if i == 0 {
                    v7::TimeMix::first(params.take()?)
                } else {
                    v7::TimeMix::later(params.take()?)
                };
                v7::time_mix(ex, &x, state, &mut v_first, &block)?
            }
        };
        if tracing {
            mark_state_outputs(ex, i, 0..ffn_slot, state)?;
        }

        x = match version {
            Version::V7 => ffn::channel_mix_v7(ex, &x, &mut state[ffn_slot], params.take()?)?,
            Version::V6 => ffn::channel_mix_v6(ex, &x, &mut state[ffn_slot], params.take()?)?,
            _ => ffn::channel_mix(ex, &x, &mut state[ffn_slot], params.take()?)?,
        };
        if tracing {
            mark_state_outputs(ex, i, ffn_slot..ffn_slot + 1, state)?;
        }

        if x.dtype() == DType::F16 && (i + 1) % config.rescale_layer == 0 {
            x = ex.div_scalar(&x, 2.0)?;
        }
    }

    if !with_head {
        return Ok(None);
    }
    let [ln_w, ln_b, head] = params.take()?;
    let x = ex.layer_norm(&x, ln_w, ln_b, LAYER_NORM_EPS)?;
    ex.set_int4_disabled(true);
    let logits = ex.matmul(&x, head);
    ex.set_int4_disabled(false);
    let mut logits = logits?;
    if logits.dtype() == DType::F16 {
        logits = ex.cast(&logits, DType::F32)?;
    }
    if tracing {
        logits = ex.mark_output(&logits, "output")?;
    }
    Ok(Some(logits))
}
