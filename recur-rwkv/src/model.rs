//! The RWKV model: weights, recurrent state and the run entry points.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use recur::{
    DType, Device, Dispatcher, Error, ExportSession, KernelContext, KernelRegistry, Kernels,
    Result, Tensor,
};

use crate::accelerator::AcceleratorSession;
use crate::config::RwkvConfig;
use crate::forward::{self, Weights};
use crate::registry::default_registry;
use crate::state::{self, States};
use crate::strategy::Strategy;
use crate::version::Version;
use crate::weights::WeightFile;

/// Backend-specific part of a model.
enum Extra {
    /// Per-operator dispatch through a kernel set.
    Kernels {
        kernels: Arc<dyn Kernels>,
        /// Flat parameter list in forward order.
        params: Vec<Tensor>,
        /// `[vocab, n_embd]`
        embedding: Tensor,
    },
    /// A runtime session that owns weights and state.
    Accelerator(Box<dyn AcceleratorSession>),
}

/// A loaded RWKV model and its recurrent state.
///
/// Running mutates the state, so the run entry points take `&mut self`.
pub struct Model {
    config: RwkvConfig,
    device: Device,
    act_dtype: DType,
    weight_dtype: DType,
    states: States,
    extra: Extra,
}

fn is_decay_param(name: &str) -> bool {
    name.ends_with("time_decay") || name.ends_with("time_first")
}

/// Drop leading unit axes from vectors stored as `[1, 1, C]`.
fn squeeze(tensor: Tensor) -> Result<Tensor> {
    match tensor.shape().last() {
        Some(&last) if tensor.ndim() > 1 && tensor.numel() == last => tensor.reshape(&[last]),
        _ => Ok(tensor),
    }
}

fn load_params(file: &WeightFile, config: &RwkvConfig, dtype: DType) -> Result<Vec<Tensor>> {
    let names = config.version.param_names(config.n_layer);
    let mut params = Vec::with_capacity(names.len());
    for name in &names {
        let mut tensor = squeeze(file.tensor(name)?)?;
        if is_decay_param(name) {
            tensor = tensor.to_dtype(DType::F32)?;
            if config.version != Version::V4 {
                let heads = config.n_head;
                tensor = tensor.reshape(&[heads, tensor.numel() / heads, 1])?;
            }
        } else {
            tensor = tensor.to_dtype(dtype)?;
        }
        params.push(tensor.with_name(name).into_constant());
    }

    let head_shape = params.last().map(Tensor::shape).unwrap_or_default();
    if head_shape != [config.n_embd, config.vocab_size] {
        return Err(Error::Load {
            path: "head.weight".into(),
            reason: format!(
                "shape {head_shape:?} does not match n_embd {} and {} embedding rows",
                config.n_embd,
                config.vocab_size
            ),
        });
    }
    Ok(params)
}

fn load_embedding(file: &WeightFile, config: &RwkvConfig, dtype: DType) -> Result<Tensor> {
    let mut table = Vec::with_capacity(config.vocab_size * config.n_embd);
    for (token, row) in file.embd_weights.iter().enumerate() {
        let row = row.to_tensor()?;
        if row.numel() != config.n_embd {
            return Err(Error::Load {
                path: format!("embd_weights[{token}]"),
                reason: format!("{} values, expected {}", row.numel(), config.n_embd),
            });
        }
        table.extend_from_slice(&row.to_f32()?);
    }
    Ok(Tensor::from_f32_as(&[config.vocab_size, config.n_embd], &table, dtype)?
        .with_name("emb.weight")
        .into_constant())
}

impl Model {
    /// Load a weight file with a `"<device> <precision>"` strategy.
    ///
    /// # Errors
    /// See [`Model::from_weight_file`]; also fails when the file cannot be
    /// read or the strategy does not parse.
    pub fn load(path: impl AsRef<Path>, strategy: &str) -> Result<Self> {
        let strategy: Strategy = strategy.parse()?;
        let file = WeightFile::read(path)?;
        Self::from_weight_file(&file, strategy)
    }

    /// Build a model with the [`default_registry`].
    ///
    /// # Errors
    /// See [`Model::with_registry`].
    pub fn from_weight_file(file: &WeightFile, strategy: Strategy) -> Result<Self> {
        Self::with_registry(file, strategy, default_registry())
    }

    /// Build a model whose kernels come from `registry`.
    ///
    /// Meta devices trace activations in f32 and keep f32 host weights;
    /// the export kernels quantize them on the way out.
    ///
    /// # Errors
    /// Returns `Strategy` for accelerator devices, `Dispatch` when the
    /// registry has no kernels for the device, `UnsupportedDtype` for
    /// quantized weights on an eager device, and `Load` or
    /// `UnsupportedVersion` for malformed weight files.
    pub fn with_registry(
        file: &WeightFile,
        strategy: Strategy,
        registry: &KernelRegistry,
    ) -> Result<Self> {
        let device = strategy.device;
        if device.is_accelerator() {
            return Err(Error::Strategy(format!(
                "{device} runs through an accelerator session, see Model::with_accelerator"
            )));
        }
        let kernels = registry.resolve(device)?;
        let config = RwkvConfig::from_weight_file(file)?;

        let (mut act_dtype, weight_dtype) = strategy.resolved_dtypes();
        let param_dtype = if device.is_meta() {
            act_dtype = DType::F32;
            DType::F32
        } else if weight_dtype.is_float() {
            weight_dtype
        } else {
            return Err(Error::UnsupportedDtype(format!(
                "{weight_dtype} weights cannot run on {device}"
            )));
        };

        let params = load_params(file, &config, param_dtype)?;
        let embedding = load_embedding(file, &config, param_dtype)?;
        let states = state::fresh_states(&config, act_dtype)?;
        info!(
            version = %config.version,
            %device,
            %act_dtype,
            %weight_dtype,
            n_layer = config.n_layer,
            n_embd = config.n_embd,
            n_att = config.n_att,
            n_ffn = config.n_ffn,
            n_head = config.n_head,
            vocab = config.vocab_size,
            "model loaded"
        );
        Ok(Self {
            config,
            device,
            act_dtype,
            weight_dtype,
            states,
            extra: Extra::Kernels {
                kernels,
                params,
                embedding,
            },
        })
    }

    /// Wrap an accelerator session.
    ///
    /// # Errors
    /// Returns `Strategy` when the session reports a non-accelerator device.
    pub fn with_accelerator(session: Box<dyn AcceleratorSession>) -> Result<Self> {
        let info = session.info().clone();
        if !info.device.is_accelerator() {
            return Err(Error::Strategy(format!(
                "{} is not an accelerator device",
                info.device
            )));
        }
        info!(
            version = %info.config.version,
            device = %info.device,
            act_dtype = %info.act_dtype,
            weight_dtype = %info.weight_dtype,
            "accelerator session attached"
        );
        Ok(Self {
            config: info.config,
            device: info.device,
            act_dtype: info.act_dtype,
            weight_dtype: info.weight_dtype,
            states: States::new(),
            extra: Extra::Accelerator(session),
        })
    }

    /// Run one token and return `[vocab_size]` f32 logits on the host.
    ///
    /// # Errors
    /// Returns `Resource` on meta devices, which only trace, and propagates
    /// kernel errors.
    pub fn run(&mut self, token: u32) -> Result<Tensor> {
        self.run_seq(&[token])
    }

    /// Advance the state through `tokens` and return the logits after the
    /// last one. The head only runs for the final token.
    ///
    /// # Errors
    /// Fails on an empty sequence, see also [`Model::run`].
    pub fn run_seq(&mut self, tokens: &[u32]) -> Result<Tensor> {
        let Some(last) = tokens.len().checked_sub(1) else {
            return Err(Error::InvalidShape("empty token sequence".into()));
        };
        debug!(?tokens, device = %self.device, "run");
        let (kernels, params, embedding) = match &mut self.extra {
            Extra::Accelerator(session) => return session.run(tokens),
            Extra::Kernels { .. } if self.device.is_meta() => {
                return Err(Error::Resource(format!(
                    "{} only traces, use run_traced with an export session",
                    self.device
                )));
            }
            Extra::Kernels {
                kernels,
                params,
                embedding,
            } => (kernels, params, embedding),
        };

        let weights = Weights {
            config: &self.config,
            params,
            embedding,
        };
        let mut ex = Dispatcher::new(kernels.as_ref(), KernelContext::eager());
        let mut logits = None;
        for (i, &token) in tokens.iter().enumerate() {
            logits = forward::step(&mut ex, &weights, &mut self.states, token, i == last)?;
        }
        logits
            .ok_or_else(|| Error::Other("forward pass produced no logits".into()))?
            .to_host()
    }

    /// Trace one step into `session`. The model's own state is left
    /// untouched; states enter and leave the graph as named inputs and
    /// outputs.
    ///
    /// # Errors
    /// Returns `Dispatch` when the device has no graph kernels, and
    /// propagates kernel and IO errors.
    pub fn run_traced(&self, session: &mut ExportSession, token: u32) -> Result<Tensor> {
        let Extra::Kernels {
            kernels,
            params,
            embedding,
        } = &self.extra
        else {
            return Err(Error::dispatch("run_traced", self.device));
        };
        if !self.device.is_meta() {
            return Err(Error::dispatch("run_traced", self.device));
        }
        debug!(token, device = %self.device, "trace");
        let weights = Weights {
            config: &self.config,
            params,
            embedding,
        };
        let mut states = self.states.clone();
        let mut ex = Dispatcher::new(kernels.as_ref(), KernelContext::traced(session));
        forward::step(&mut ex, &weights, &mut states, token, true)?
            .ok_or_else(|| Error::Other("forward pass produced no logits".into()))
    }

    /// Zero the recurrent state (`pp` starts at `-1e30` for v4).
    ///
    /// # Errors
    /// Propagates accelerator session errors.
    pub fn reset_states(&mut self) -> Result<()> {
        match &mut self.extra {
            Extra::Accelerator(session) => session.reset_states(),
            Extra::Kernels { .. } => {
                self.states = state::fresh_states(&self.config, self.act_dtype)?;
                debug!(layers = self.states.len(), "states reset");
                Ok(())
            }
        }
    }

    /// Current state, one list of slots per layer. Empty for accelerator
    /// sessions, which keep their state internally.
    #[must_use]
    pub fn states(&self) -> &States {
        &self.states
    }

    /// Replace the state. Layer count, slot count and shapes must match;
    /// values are converted to each slot's dtype.
    ///
    /// # Errors
    /// Returns `Dispatch` for accelerator sessions and `ShapeMismatch` or
    /// `InvalidShape` for layout differences.
    pub fn set_states(&mut self, states: States) -> Result<()> {
        if matches!(self.extra, Extra::Accelerator(_)) {
            return Err(Error::dispatch("set_states", self.device));
        }
        state::check_layout(&self.states, &states)?;
        let converted = states
            .iter()
            .zip(&self.states)
            .map(|(theirs, ours)| {
                theirs
                    .iter()
                    .zip(ours)
                    .map(|(t, slot)| t.to_dtype(slot.dtype()))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<States>>()?;
        self.states = converted;
        Ok(())
    }

    /// # Errors
    /// Returns `Dispatch` for accelerator sessions and propagates IO errors.
    pub fn save_state_file(&self, path: impl AsRef<Path>) -> Result<()> {
        if matches!(self.extra, Extra::Accelerator(_)) {
            return Err(Error::dispatch("save_state_file", self.device));
        }
        state::write_state_file(path, &self.states)
    }

    /// # Errors
    /// See [`Model::set_states`]; also fails on unreadable files.
    pub fn load_state_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if matches!(self.extra, Extra::Accelerator(_)) {
            return Err(Error::dispatch("load_state_file", self.device));
        }
        let states = state::read_state_file(path)?;
        self.set_states(states)
    }

    #[must_use]
    pub fn config(&self) -> &RwkvConfig {
        &self.config
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.config.version
    }

    #[must_use]
    pub fn n_layer(&self) -> usize {
        self.config.n_layer
    }

    #[must_use]
    pub fn n_embd(&self) -> usize {
        self.config.n_embd
    }

    #[must_use]
    pub fn n_att(&self) -> usize {
        self.config.n_att
    }

    #[must_use]
    pub fn n_ffn(&self) -> usize {
        self.config.n_ffn
    }

    /// Channels per head; 0 for v4.
    #[must_use]
    pub fn head_size(&self) -> usize {
        self.config.head_size()
    }

    #[must_use]
    pub fn n_head(&self) -> usize {
        self.config.n_head
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    #[must_use]
    pub fn act_dtype(&self) -> DType {
        self.act_dtype
    }

    #[must_use]
    pub fn weight_dtype(&self) -> DType {
        self.weight_dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squeeze_vectors_only() {
        let t = squeeze(Tensor::zeros(&[1, 1, 8], DType::F32)).unwrap();
        assert_eq!(t.shape(), &[8]);
        let t = squeeze(Tensor::zeros(&[2, 8], DType::F32)).unwrap();
        assert_eq!(t.shape(), &[2, 8]);
        let t = squeeze(Tensor::zeros(&[8], DType::F32)).unwrap();
        assert_eq!(t.shape(), &[8]);
    }

    #[test]
    fn test_decay_param_names() {
        assert!(is_decay_param("blocks.3.att.time_decay"));
        assert!(is_decay_param("blocks.0.att.time_first"));
        assert!(!is_decay_param("blocks.0.att.time_decay_w1"));
        assert!(!is_decay_param("blocks.0.att.time_mix_k"));
    }
}
