//! Kernel set trait and op definitions for device-polymorphic inference.
//!
//! Model code composes forward passes out of the ops on [`Kernels`]. Each
//! device registers one kernel set; eager sets compute on host data, meta
//! sets append nodes to the [`ExportSession`] carried by the
//! [`KernelContext`].
//!
//! # Design notes
//!
//! - **Every op has a default body** that reports a missing `(op, device)`
//!   pair. A kernel set overrides only the ops it supports, so a gap shows
//!   up as a `Dispatch` error at the call site rather than a panic.
//! - **The context is threaded explicitly.** There is no process-global
//!   graph; a meta kernel without a session fails with `Resource`.
//! - **[`Dispatcher`]** pairs a kernel set with a context so composers can
//!   write `ex.add(&a, &b)?` instead of spelling out the op enums.

use crate::device::Device;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::session::ExportSession;
use crate::tensor::Tensor;

/// Element-wise binary ops with numpy broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
}

impl BinaryOp {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Maximum => "maximum",
        }
    }

    #[inline]
    #[must_use]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Maximum => a.max(b),
        }
    }
}

/// Element-wise unary ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Exp,
    Sigmoid,
    Tanh,
    Relu,
    Silu,
}

impl UnaryOp {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Exp => "exp",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Relu => "relu",
            Self::Silu => "silu",
        }
    }

    #[inline]
    #[must_use]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Exp => x.exp(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::Relu => x.max(0.0),
            Self::Silu => x / (1.0 + (-x).exp()),
        }
    }
}

/// Tensor-scalar ops. `Rsub` computes `scalar - x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarOp {
    Add,
    Mul,
    Div,
    Rsub,
}

impl ScalarOp {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add_scalar",
            Self::Mul => "mul_scalar",
            Self::Div => "div_scalar",
            Self::Rsub => "rsub_scalar",
        }
    }

    #[inline]
    #[must_use]
    pub fn apply(self, x: f32, s: f32) -> f32 {
        match self {
            Self::Add => x + s,
            Self::Mul => x * s,
            Self::Div => x / s,
            Self::Rsub => s - x,
        }
    }
}

/// Per-call state handed to every kernel.
pub struct KernelContext<'s> {
    session: Option<&'s mut ExportSession>,
}

impl<'s> KernelContext<'s> {
    /// Context for kernels that compute on real data.
    #[must_use]
    pub fn eager() -> Self {
        Self { session: None }
    }

    /// Context for kernels that record into `session`.
    #[must_use]
    pub fn traced(session: &'s mut ExportSession) -> Self {
        Self {
            session: Some(session),
        }
    }

    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.session.is_some()
    }

    /// The active export session.
    ///
    /// # Errors
    /// Returns `Resource` when no session is attached.
    pub fn session(&mut self) -> Result<&mut ExportSession> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| Error::Resource("graph kernel invoked without an export session".into()))
    }

    /// Forbid 4-bit weight lowering for subsequent matmuls. No-op when eager.
    pub fn set_int4_disabled(&mut self, disabled: bool) {
        if let Some(session) = self.session.as_deref_mut() {
            session.set_int4_disabled(disabled);
        }
    }
}

/// A device's kernel set.
///
/// Reductions, norms and splits act on the last axis unless stated
/// otherwise; `split` acts on axis 0.
pub trait Kernels: Send + Sync {
    /// The device these kernels run on.
    fn device(&self) -> Device;

    fn binary(
        &self,
        _cx: &mut KernelContext<'_>,
        op: BinaryOp,
        _a: &Tensor,
        _b: &Tensor,
    ) -> Result<Tensor> {
        Err(Error::dispatch(op.name(), self.device()))
    }

    fn unary(&self, _cx: &mut KernelContext<'_>, op: UnaryOp, _x: &Tensor) -> Result<Tensor> {
        Err(Error::dispatch(op.name(), self.device()))
    }

    fn scalar(
        &self,
        _cx: &mut KernelContext<'_>,
        op: ScalarOp,
        _x: &Tensor,
        _value: f32,
    ) -> Result<Tensor> {
        Err(Error::dispatch(op.name(), self.device()))
    }

    fn layer_norm(
        &self,
        _cx: &mut KernelContext<'_>,
        _x: &Tensor,
        _weight: &Tensor,
        _bias: &Tensor,
        _eps: f32,
    ) -> Result<Tensor> {
        Err(Error::dispatch("layernorm", self.device()))
    }

    /// Normalize `groups` equal slices of the last axis independently.
    fn group_norm(
        &self,
        _cx: &mut KernelContext<'_>,
        _x: &Tensor,
        _groups: usize,
        _weight: &Tensor,
        _bias: &Tensor,
        _eps: f32,
    ) -> Result<Tensor> {
        Err(Error::dispatch("groupnorm", self.device()))
    }

    /// Scale every last-axis row to unit L2 norm.
    fn l2_norm(&self, _cx: &mut KernelContext<'_>, _x: &Tensor) -> Result<Tensor> {
        Err(Error::dispatch("l2norm", self.device()))
    }

    /// Sum over the last axis, keeping it as size 1.
    fn sum_last(&self, _cx: &mut KernelContext<'_>, _x: &Tensor) -> Result<Tensor> {
        Err(Error::dispatch("sum", self.device()))
    }

    /// Broadcast-batched matrix product, see [`crate::shape::matmul`].
    fn matmul(&self, _cx: &mut KernelContext<'_>, _a: &Tensor, _b: &Tensor) -> Result<Tensor> {
        Err(Error::dispatch("matmul", self.device()))
    }

    /// Row `token` of a `[vocab, dim]` table.
    fn embedding(
        &self,
        _cx: &mut KernelContext<'_>,
        _table: &Tensor,
        _token: u32,
    ) -> Result<Tensor> {
        Err(Error::dispatch("embedding", self.device()))
    }

    fn reshape(&self, _cx: &mut KernelContext<'_>, _x: &Tensor, _shape: &[usize]) -> Result<Tensor> {
        Err(Error::dispatch("reshape", self.device()))
    }

    fn cast(&self, _cx: &mut KernelContext<'_>, _x: &Tensor, _dtype: DType) -> Result<Tensor> {
        Err(Error::dispatch("cast_dtype", self.device()))
    }

    /// Split axis 0 into `parts` equal chunks.
    fn split(&self, _cx: &mut KernelContext<'_>, _x: &Tensor, _parts: usize) -> Result<Vec<Tensor>> {
        Err(Error::dispatch("split", self.device()))
    }

    /// Softmax over the last axis of `x / temperature`.
    fn softmax(
        &self,
        _cx: &mut KernelContext<'_>,
        _x: &Tensor,
        _temperature: f32,
    ) -> Result<Tensor> {
        Err(Error::dispatch("softmax", self.device()))
    }

    /// Declare a named graph input.
    fn graph_input(
        &self,
        _cx: &mut KernelContext<'_>,
        _shape: &[usize],
        _name: &str,
    ) -> Result<Tensor> {
        Err(Error::dispatch("input", self.device()))
    }

    /// Expose `x` under `name` as a graph output.
    fn mark_output(&self, _cx: &mut KernelContext<'_>, _x: &Tensor, _name: &str) -> Result<Tensor> {
        Err(Error::dispatch("mark_as_output", self.device()))
    }
}

/// A kernel set bound to a context.
pub struct Dispatcher<'k, 's> {
    kernels: &'k dyn Kernels,
    cx: KernelContext<'s>,
}

impl<'k, 's> Dispatcher<'k, 's> {
    #[must_use]
    pub fn new(kernels: &'k dyn Kernels, cx: KernelContext<'s>) -> Self {
        Self { kernels, cx }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.kernels.device()
    }

    pub fn set_int4_disabled(&mut self, disabled: bool) {
        self.cx.set_int4_disabled(disabled);
    }

    pub fn add(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.kernels.binary(&mut self.cx, BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.kernels.binary(&mut self.cx, BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.kernels.binary(&mut self.cx, BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.kernels.binary(&mut self.cx, BinaryOp::Div, a, b)
    }

    pub fn maximum(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.kernels.binary(&mut self.cx, BinaryOp::Maximum, a, b)
    }

    pub fn exp(&mut self, x: &Tensor) -> Result<Tensor> {
        self.kernels.unary(&mut self.cx, UnaryOp::Exp, x)
    }

    pub fn sigmoid(&mut self, x: &Tensor) -> Result<Tensor> {
        self.kernels.unary(&mut self.cx, UnaryOp::Sigmoid, x)
    }

    pub fn tanh(&mut self, x: &Tensor) -> Result<Tensor> {
        self.kernels.unary(&mut self.cx, UnaryOp::Tanh, x)
    }

    pub fn relu(&mut self, x: &Tensor) -> Result<Tensor> {
        self.kernels.unary(&mut self.cx, UnaryOp::Relu, x)
    }

    pub fn silu(&mut self, x: &Tensor) -> Result<Tensor> {
        self.kernels.unary(&mut self.cx, UnaryOp::Silu, x)
    }

    pub fn add_scalar(&mut self, x: &Tensor, value: f32) -> Result<Tensor> {
        self.kernels.scalar(&mut self.cx, ScalarOp::Add, x, value)
    }

    pub fn mul_scalar(&mut self, x: &Tensor, value: f32) -> Result<Tensor> {
        self.kernels.scalar(&mut self.cx, ScalarOp::Mul, x, value)
    }

    pub fn div_scalar(&mut self, x: &Tensor, value: f32) -> Result<Tensor> {
        self.kernels.scalar(&mut self.cx, ScalarOp::Div, x, value)
    }

    /// `value - x`
    pub fn rsub_scalar(&mut self, x: &Tensor, value: f32) -> Result<Tensor> {
        self.kernels.scalar(&mut self.cx, ScalarOp::Rsub, x, value)
    }

    pub fn layer_norm(
        &mut self,
        x: &Tensor,
        weight: &Tensor,
        bias: &Tensor,
        eps: f32,
    ) -> Result<Tensor> {
        self.kernels.layer_norm(&mut self.cx, x, weight, bias, eps)
    }

    pub fn group_norm(
        &mut self,
        x: &Tensor,
        groups: usize,
        weight: &Tensor,
        bias: &Tensor,
        eps: f32,
    ) -> Result<Tensor> {
        self.kernels
            .group_norm(&mut self.cx, x, groups, weight, bias, eps)
    }

    pub fn l2_norm(&mut self, x: &Tensor) -> Result<Tensor> {
        self.kernels.l2_norm(&mut self.cx, x)
    }

    pub fn sum_last(&mut self, x: &Tensor) -> Result<Tensor> {
        self.kernels.sum_last(&mut self.cx, x)
    }

    pub fn matmul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.kernels.matmul(&mut self.cx, a, b)
    }

    pub fn embedding(&mut self, table: &Tensor, token: u32) -> Result<Tensor> {
        self.kernels.embedding(&mut self.cx, table, token)
    }

    pub fn reshape(&mut self, x: &Tensor, shape: &[usize]) -> Result<Tensor> {
        self.kernels.reshape(&mut self.cx, x, shape)
    }

    /// Reshape to a single axis.
    pub fn flatten(&mut self, x: &Tensor) -> Result<Tensor> {
        if x.ndim() == 1 {
            return Ok(x.clone());
        }
        self.kernels.reshape(&mut self.cx, x, &[x.numel()])
    }

    pub fn cast(&mut self, x: &Tensor, dtype: DType) -> Result<Tensor> {
        self.kernels.cast(&mut self.cx, x, dtype)
    }

    pub fn split(&mut self, x: &Tensor, parts: usize) -> Result<Vec<Tensor>> {
        self.kernels.split(&mut self.cx, x, parts)
    }

    pub fn softmax(&mut self, x: &Tensor, temperature: f32) -> Result<Tensor> {
        self.kernels.softmax(&mut self.cx, x, temperature)
    }

    pub fn graph_input(&mut self, shape: &[usize], name: &str) -> Result<Tensor> {
        self.kernels.graph_input(&mut self.cx, shape, name)
    }

    pub fn mark_output(&mut self, x: &Tensor, name: &str) -> Result<Tensor> {
        self.kernels.mark_output(&mut self.cx, x, name)
    }
}
