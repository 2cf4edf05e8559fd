//! CPU kernels for Recur.
//!
//! Every op computes in f32 and stores its result in the dtype of its
//! first operand, so fp16 activations stay fp16 between kernels while
//! accumulation happens at full precision. Matmul rows are parallelized
//! with Rayon; everything else runs on the calling thread.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod ops;

use recur::kernels::{BinaryOp, KernelContext, Kernels, ScalarOp, UnaryOp};
use recur::{DType, Device, Result, Tensor};

/// Eager kernel set for [`Device::Cpu`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuKernels;

impl Kernels for CpuKernels {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn binary(
        &self,
        _cx: &mut KernelContext<'_>,
        op: BinaryOp,
        a: &Tensor,
        b: &Tensor,
    ) -> Result<Tensor> {
        ops::arith::binary(op, a, b)
    }

    fn unary(&self, _cx: &mut KernelContext<'_>, op: UnaryOp, x: &Tensor) -> Result<Tensor> {
        ops::activation::unary(op, x)
    }

    fn scalar(
        &self,
        _cx: &mut KernelContext<'_>,
        op: ScalarOp,
        x: &Tensor,
        value: f32,
    ) -> Result<Tensor> {
        ops::arith::scalar(op, x, value)
    }

    fn layer_norm(
        &self,
        _cx: &mut KernelContext<'_>,
        x: &Tensor,
        weight: &Tensor,
        bias: &Tensor,
        eps: f32,
    ) -> Result<Tensor> {
        ops::norm::layer_norm(x, weight, bias, eps)
    }

    fn group_norm(
        &self,
        _cx: &mut KernelContext<'_>,
        x: &Tensor,
        groups: usize,
        weight: &Tensor,
        bias: &Tensor,
        eps: f32,
    ) -> Result<Tensor> {
        ops::norm::group_norm(x, groups, weight, bias, eps)
    }

    fn l2_norm(&self, _cx: &mut KernelContext<'_>, x: &Tensor) -> Result<Tensor> {
        ops::norm::l2_norm(x)
    }

    fn sum_last(&self, _cx: &mut KernelContext<'_>, x: &Tensor) -> Result<Tensor> {
        ops::tensor_ops::sum_last(x)
    }

    fn matmul(&self, _cx: &mut KernelContext<'_>, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        ops::matmul::matmul(a, b)
    }

    fn embedding(&self, _cx: &mut KernelContext<'_>, table: &Tensor, token: u32) -> Result<Tensor> {
        ops::embed::embedding(table, token)
    }

    fn reshape(&self, _cx: &mut KernelContext<'_>, x: &Tensor, shape: &[usize]) -> Result<Tensor> {
        x.reshape(shape)
    }

    fn cast(&self, _cx: &mut KernelContext<'_>, x: &Tensor, dtype: DType) -> Result<Tensor> {
        ops::cast::cast(x, dtype)
    }

    fn split(&self, _cx: &mut KernelContext<'_>, x: &Tensor, parts: usize) -> Result<Vec<Tensor>> {
        ops::tensor_ops::split(x, parts)
    }

    fn softmax(&self, _cx: &mut KernelContext<'_>, x: &Tensor, temperature: f32) -> Result<Tensor> {
        ops::activation::softmax(x, temperature)
    }

    fn mark_output(&self, _cx: &mut KernelContext<'_>, x: &Tensor, name: &str) -> Result<Tensor> {
        Ok(x.clone().with_name(name))
    }
}
