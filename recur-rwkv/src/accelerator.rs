//! Hand-off to accelerator runtimes that execute a whole model.
//!
//! Accelerator devices (`qnn`, `mtk`, and the ncnn/onnx runtimes) do not
//! dispatch per operator. A session owns the compiled model and its
//! recurrent state; [`crate::Model`] only forwards calls to it.

use recur::{DType, Device, Result, Tensor};

use crate::config::RwkvConfig;

/// What a session reports about the model it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorInfo {
    pub device: Device,
    pub config: RwkvConfig,
    pub act_dtype: DType,
    pub weight_dtype: DType,
}

/// A runtime session owning a compiled model and its state.
pub trait AcceleratorSession: Send {
    fn info(&self) -> &AcceleratorInfo;

    /// Feed `tokens` in order and return the logits after the last one as
    /// a host tensor.
    ///
    /// # Errors
    /// Runtime failures are reported by the implementation.
    fn run(&mut self, tokens: &[u32]) -> Result<Tensor>;

    /// # Errors
    /// Runtime failures are reported by the implementation.
    fn reset_states(&mut self) -> Result<()>;
}
