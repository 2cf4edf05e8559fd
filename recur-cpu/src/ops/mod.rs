//! CPU implementations of every kernel.

pub mod activation;
pub mod arith;
pub mod cast;
pub mod embed;
pub mod matmul;
pub mod norm;
pub mod tensor_ops;

use recur::{DType, Device, Error, Result, Tensor};

/// Reject placeholders and tensors from other devices.
pub(crate) fn check_host(op: &str, t: &Tensor) -> Result<()> {
    if t.device() != Device::Cpu {
        return Err(Error::DeviceMismatch {
            expected: Device::Cpu,
            got: t.device(),
        });
    }
    if t.is_placeholder() {
        return Err(Error::Resource(format!("{op}: operand {:?} has no data", t.name())));
    }
    Ok(())
}

/// Build a result in `like`'s float dtype, falling back to f32.
pub(crate) fn output(shape: &[usize], values: &[f32], like: DType) -> Result<Tensor> {
    let dtype = if like.is_float() { like } else { DType::F32 };
    Tensor::from_f32_as(shape, values, dtype)
}
