//! Kernel set that records ncnn layers instead of computing.
//!
//! Activations are placeholders named after graph edges. Host tensors that
//! reach a kernel (model parameters) are materialized as `MemoryData`
//! layers, once per parameter and shape. Matmuls against host weights are
//! lowered to the quantized gemv layers when the export weight dtype and
//! the weight shape allow it, and to fp16 `Gemm` otherwise.

use recur::kernels::{BinaryOp, KernelContext, Kernels, ScalarOp, UnaryOp};
use recur::session::{format_e, shape_attrs, ExportSession, TAG_FP16, TAG_FP32, TAG_INT8};
use recur::{shape, DType, Device, Error, Result, Tensor};
use tracing::debug;

use crate::quant;

type Attrs = Vec<(i32, String)>;

/// Kernel set for [`Device::NcnnMeta`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NcnnKernels;

fn edge_tensor(shape: &[usize], edge: &str) -> Tensor {
    Tensor::placeholder(shape, DType::F32, Device::NcnnMeta, edge)
}

fn single(mut outputs: Vec<String>) -> String {
    outputs.pop().unwrap_or_default()
}

fn attr(key: i32, value: impl ToString) -> (i32, String) {
    (key, value.to_string())
}

const fn binary_id(op: BinaryOp) -> i32 {
    match op {
        BinaryOp::Add => 0,
        BinaryOp::Sub => 1,
        BinaryOp::Mul => 2,
        BinaryOp::Div => 3,
        BinaryOp::Maximum => 4,
    }
}

const fn scalar_id(op: ScalarOp) -> i32 {
    match op {
        ScalarOp::Add => 0,
        ScalarOp::Mul => 2,
        ScalarOp::Div => 3,
        ScalarOp::Rsub => 7,
    }
}

const fn unary_layer(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Exp => "Exp",
        UnaryOp::Sigmoid => "Sigmoid",
        UnaryOp::Tanh => "TanH",
        UnaryOp::Relu => "ReLU",
        UnaryOp::Silu => "Swish",
    }
}

fn f32_bytes(t: &Tensor) -> Result<Vec<u8>> {
    Ok(bytemuck::cast_slice(&t.to_f32()?).to_vec())
}

/// Edge carrying `x`, emitting a `MemoryData` layer for host tensors.
fn operand(session: &mut ExportSession, x: &Tensor) -> Result<String> {
    if x.is_placeholder() {
        if x.device() != Device::NcnnMeta {
            return Err(Error::DeviceMismatch {
                expected: Device::NcnnMeta,
                got: x.device(),
            });
        }
        return Ok(x.name().to_string());
    }
    if x.is_constant() {
        if let Some(edge) = session.constant_edge(x.name(), x.shape()) {
            return Ok(edge.to_string());
        }
    }
    if x.ndim() > 3 {
        return Err(Error::InvalidShape(format!(
            "MemoryData supports up to 3 dims, got {:?}",
            x.shape()
        )));
    }
    let mut attrs = shape_attrs(x.shape());
    attrs.push(attr(21, 0));
    let edge = single(session.emit("MemoryData", vec![], 1, attrs));
    session.write_weights(&f32_bytes(x)?, Some(TAG_FP32))?;
    if x.is_constant() {
        session.remember_constant(x.name(), x.shape(), &edge);
    }
    Ok(edge)
}

fn gemv_w8(session: &mut ExportSession, a: &str, b: &Tensor) -> Result<String> {
    let (k, n) = (b.shape()[0], b.shape()[1]);
    let q = quant::quantize_affine_int8(&b.to_f32()?, k, n)?;
    let out = single(session.emit(
        "GemvA32W8",
        vec![a.to_string()],
        1,
        vec![attr(0, n), attr(1, k)],
    ));
    session.write_weights(&q.data, Some(TAG_INT8))?;
    session.write_weights(bytemuck::cast_slice(&q.scales), None)?;
    session.write_weights(bytemuck::cast_slice(&q.zero_points), None)?;
    Ok(out)
}

fn gemv_w4(session: &mut ExportSession, a: &str, b: &Tensor) -> Result<String> {
    let (k, n) = (b.shape()[0], b.shape()[1]);
    let q = quant::quantize_nf4(&b.to_f32()?, k, n)?;
    let out = single(session.emit(
        "GemvA32W4",
        vec![a.to_string()],
        1,
        vec![
            attr(0, n),
            attr(1, k),
            attr(11, quant::NF4_GROUP_ROWS),
            attr(22, quant::NF4_SCALE_GROUP),
        ],
    ));
    session.write_weights(&q.data, Some(TAG_INT8))?;
    session.write_weights(bytemuck::cast_slice(&q.scales), None)?;
    session.write_weights(bytemuck::cast_slice(&q.dq_scales), None)?;
    Ok(out)
}

/// `Gemm` with fp16 constant weights; 1-D activations are reshaped to a
/// single row and back.
fn gemm(session: &mut ExportSession, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.ndim() == 0 || b.ndim() == 0 {
        return Err(Error::InvalidShape(format!(
            "matmul needs at least 1-D operands, got {:?} @ {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let a_edge = operand(session, a)?;
    let (a_edge, rows, squeeze) = if a.ndim() == 1 {
        let row = single(session.emit(
            "Reshape",
            vec![a_edge],
            1,
            vec![attr(0, 0), attr(1, 1)],
        ));
        (row, 1, true)
    } else {
        (a_edge, a.shape()[0], false)
    };
    let n = b.shape()[b.ndim() - 1];
    let k = b.shape()[0];

    let mut inputs = vec![a_edge];
    let b_const = !b.is_placeholder();
    if !b_const {
        inputs.push(operand(session, b)?);
    }
    let (const_n, const_k) = if b_const { (n, k) } else { (0, 0) };
    let out = single(session.emit(
        "Gemm",
        inputs,
        1,
        vec![
            attr(4, 0),
            attr(5, i32::from(b_const)),
            attr(6, 1),
            attr(7, 0),
            attr(8, const_n),
            attr(9, const_k),
            attr(10, -1),
        ],
    ));
    if b_const {
        let halves = b.to_dtype(DType::F16)?;
        session.write_weights(halves.as_bytes()?, Some(TAG_FP16))?;
    }
    if squeeze {
        let flat = single(session.emit("Reshape", vec![out], 1, vec![attr(0, -1)]));
        return Ok(edge_tensor(&[n], &flat));
    }
    Ok(edge_tensor(&[rows, n], &out))
}

fn batch_matmul(session: &mut ExportSession, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let out_shape = shape::matmul(a.shape(), b.shape())?;
    let a_edge = operand(session, a)?;
    let b_edge = operand(session, b)?;
    let out = single(session.emit("MatMul", vec![a_edge, b_edge], 1, vec![attr(0, 0)]));
    Ok(edge_tensor(&out_shape, &out))
}

impl Kernels for NcnnKernels {
    fn device(&self) -> Device {
        Device::NcnnMeta
    }

    fn binary(
        &self,
        cx: &mut KernelContext<'_>,
        op: BinaryOp,
        a: &Tensor,
        b: &Tensor,
    ) -> Result<Tensor> {
        let out_shape = shape::broadcast(a.shape(), b.shape())?;
        let session = cx.session()?;
        let inputs = vec![operand(session, a)?, operand(session, b)?];
        let out = single(session.emit("BinaryOp", inputs, 1, vec![attr(0, binary_id(op))]));
        Ok(edge_tensor(&out_shape, &out))
    }

    fn unary(&self, cx: &mut KernelContext<'_>, op: UnaryOp, x: &Tensor) -> Result<Tensor> {
        let session = cx.session()?;
        let input = operand(session, x)?;
        let out = single(session.emit(unary_layer(op), vec![input], 1, vec![]));
        Ok(edge_tensor(x.shape(), &out))
    }

    fn scalar(
        &self,
        cx: &mut KernelContext<'_>,
        op: ScalarOp,
        x: &Tensor,
        value: f32,
    ) -> Result<Tensor> {
        let session = cx.session()?;
        let input = operand(session, x)?;
        let attrs = vec![attr(0, scalar_id(op)), attr(1, 1), attr(2, format_e(value))];
        let out = single(session.emit("BinaryOp", vec![input], 1, attrs));
        Ok(edge_tensor(x.shape(), &out))
    }

    fn layer_norm(
        &self,
        cx: &mut KernelContext<'_>,
        x: &Tensor,
        weight: &Tensor,
        bias: &Tensor,
        eps: f32,
    ) -> Result<Tensor> {
        let session = cx.session()?;
        let input = operand(session, x)?;
        let attrs = vec![attr(0, weight.numel()), attr(1, format_e(eps)), attr(2, 1)];
        let out = single(session.emit("LayerNorm", vec![input], 1, attrs));
        session.write_weights(&f32_bytes(weight)?, None)?;
        session.write_weights(&f32_bytes(bias)?, None)?;
        Ok(edge_tensor(x.shape(), &out))
    }

    fn group_norm(
        &self,
        cx: &mut KernelContext<'_>,
        x: &Tensor,
        groups: usize,
        weight: &Tensor,
        bias: &Tensor,
        eps: f32,
    ) -> Result<Tensor> {
        let session = cx.session()?;
        let input = operand(session, x)?;
        let attrs = vec![
            attr(0, groups),
            attr(1, weight.numel()),
            attr(2, format_e(eps)),
            attr(3, 1),
        ];
        let out = single(session.emit("GroupNorm", vec![input], 1, attrs));
        session.write_weights(&f32_bytes(weight)?, None)?;
        session.write_weights(&f32_bytes(bias)?, None)?;
        Ok(edge_tensor(x.shape(), &out))
    }

    fn l2_norm(&self, cx: &mut KernelContext<'_>, x: &Tensor) -> Result<Tensor> {
        let session = cx.session()?;
        let input = operand(session, x)?;
        let attrs = vec![
            attr(0, 1),
            attr(1, 1),
            attr(2, "0.0000001"),
            attr(3, 1),
            attr(4, 0),
            attr(9, 1),
        ];
        let out = single(session.emit("Normalize", vec![input], 1, attrs));
        session.write_weights(bytemuck::bytes_of(&1.0f32), None)?;
        Ok(edge_tensor(x.shape(), &out))
    }

    fn sum_last(&self, cx: &mut KernelContext<'_>, x: &Tensor) -> Result<Tensor> {
        let session = cx.session()?;
        let input = operand(session, x)?;
        let attrs = vec![attr(1, 0), attr(-23303, "1,-1"), attr(4, 1), attr(5, 1)];
        let out = single(session.emit("Reduction", vec![input], 1, attrs));
        let mut shape = x.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = 1;
        }
        Ok(edge_tensor(&shape, &out))
    }

    fn matmul(&self, cx: &mut KernelContext<'_>, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let session = cx.session()?;
        if a.ndim() == 1 && b.ndim() == 2 && !b.is_placeholder() {
            let (k, n) = (b.shape()[0], b.shape()[1]);
            if k != a.shape()[0] {
                return Err(Error::ShapeMismatch {
                    expected: vec![a.shape()[0], n],
                    got: b.shape().to_vec(),
                });
            }
            let dtype = session.weight_dtype();
            let want_int4 = dtype == DType::Int4 && !session.int4_disabled();
            if want_int4 && quant::nf4_fits(k, n) {
                let input = operand(session, a)?;
                return Ok(edge_tensor(&[n], &gemv_w4(session, &input, b)?));
            }
            if matches!(dtype, DType::Int4 | DType::Int8) {
                if quant::affine_int8_fits(k, n) {
                    let input = operand(session, a)?;
                    return Ok(edge_tensor(&[n], &gemv_w8(session, &input, b)?));
                }
                debug!(weight = b.name(), k, n, "weight does not tile, exporting as fp16 gemm");
            }
        }
        if a.ndim() <= 2 && b.ndim() <= 2 {
            gemm(session, a, b)
        } else {
            batch_matmul(session, a, b)
        }
    }

    fn embedding(&self, cx: &mut KernelContext<'_>, table: &Tensor, _token: u32) -> Result<Tensor> {
        let [vocab, dim] = table.shape() else {
            return Err(Error::InvalidShape(format!(
                "embedding table must be 2-D, got {:?}",
                table.shape()
            )));
        };
        let (vocab, dim) = (*vocab, *dim);
        let session = cx.session()?;
        session.push_node("Input", vec![], vec!["input_id".into()], shape_attrs(&[1]));
        let q = quant::quantize_embedding(&table.to_f32()?, dim)?;
        let attrs = vec![
            attr(0, dim),
            attr(1, vocab),
            attr(3, vocab * dim),
            attr(4, quant::EMBED_GROUP),
        ];
        let out = single(session.emit("Embed", vec!["input_id".into()], 1, attrs));
        session.write_weights(bytemuck::cast_slice(&q.data), Some(TAG_INT8))?;
        session.write_weights(bytemuck::cast_slice(&q.scales), Some(TAG_FP16))?;
        Ok(edge_tensor(&[dim], &out))
    }

    fn reshape(&self, cx: &mut KernelContext<'_>, x: &Tensor, shape: &[usize]) -> Result<Tensor> {
        if !x.is_placeholder() {
            return x.reshape(shape);
        }
        if shape::numel(shape) != x.numel() {
            return Err(Error::ShapeMismatch {
                expected: x.shape().to_vec(),
                got: shape.to_vec(),
            });
        }
        let session = cx.session()?;
        let input = operand(session, x)?;
        let out = single(session.emit("Reshape", vec![input], 1, shape_attrs(shape)));
        Ok(edge_tensor(shape, &out))
    }

    /// Graph activations are always fp32, so casts only touch host data.
    fn cast(&self, _cx: &mut KernelContext<'_>, x: &Tensor, dtype: DType) -> Result<Tensor> {
        if x.is_placeholder() {
            Ok(x.clone())
        } else {
            x.to_dtype(dtype)
        }
    }

    fn split(&self, cx: &mut KernelContext<'_>, x: &Tensor, parts: usize) -> Result<Vec<Tensor>> {
        let rows = x.shape().first().copied().unwrap_or(0);
        if x.ndim() == 0 || parts == 0 || rows % parts != 0 {
            return Err(Error::InvalidShape(format!(
                "cannot split axis of {rows} into {parts} parts"
            )));
        }
        let session = cx.session()?;
        let input = operand(session, x)?;
        let mut slices = parts.to_string();
        for _ in 0..parts {
            slices.push_str(",-233");
        }
        let outputs = session.emit("Slice", vec![input], parts, vec![attr(-23300, slices), attr(1, 0)]);
        let mut shape = x.shape().to_vec();
        shape[0] = rows / parts;
        Ok(outputs.iter().map(|edge| edge_tensor(&shape, edge)).collect())
    }

    fn graph_input(&self, cx: &mut KernelContext<'_>, shape: &[usize], name: &str) -> Result<Tensor> {
        let mut attrs = shape_attrs(shape);
        if shape.len() == 4 {
            attrs.pop();
            attrs.push(attr(3, shape[0]));
        }
        cx.session()?
            .push_node("Input", vec![], vec![name.to_string()], attrs);
        Ok(edge_tensor(shape, name))
    }

    fn mark_output(&self, cx: &mut KernelContext<'_>, x: &Tensor, name: &str) -> Result<Tensor> {
        let session = cx.session()?;
        let input = operand(session, x)?;
        session.push_node("Split", vec![input], vec![name.to_string()], vec![]);
        Ok(edge_tensor(x.shape(), name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recur::{Dispatcher, ExportConfig};
    use serial_test::serial;

    fn prefix(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("recur-ncnn-{}-{name}", std::process::id()))
    }

    fn weight(k: usize, n: usize) -> Tensor {
        let values: Vec<f32> = (0..k * n).map(|i| ((i % 17) as f32 - 8.0) / 16.0).collect();
        Tensor::from_f32(&[k, n], &values).with_name("w").into_constant()
    }

    fn lowered_op(dtype: DType, k: usize, n: usize, disable_int4: bool) -> &'static str {
        let mut session = ExportSession::open(ExportConfig::new(prefix("lower"), dtype)).unwrap();
        {
            let mut ex = Dispatcher::new(&NcnnKernels, KernelContext::traced(&mut session));
            ex.set_int4_disabled(disable_int4);
            let x = ex.graph_input(&[k], "x").unwrap();
            let y = ex.matmul(&x, &weight(k, n)).unwrap();
            assert_eq!(y.shape(), &[n]);
        }
        session
            .nodes()
            .iter()
            .map(|node| node.op_type)
            .find(|op| op.starts_with("Gemv") || *op == "Gemm")
            .unwrap()
    }

    #[test]
    #[serial]
    fn test_matmul_lowering() {
        assert_eq!(lowered_op(DType::Int4, 64, 16, false), "GemvA32W4");
        assert_eq!(lowered_op(DType::Int4, 64, 16, true), "GemvA32W8");
        assert_eq!(lowered_op(DType::Int4, 64, 8, false), "GemvA32W8");
        assert_eq!(lowered_op(DType::Int8, 64, 16, false), "GemvA32W8");
        assert_eq!(lowered_op(DType::Int8, 48, 16, false), "Gemm");
        assert_eq!(lowered_op(DType::F16, 64, 16, false), "Gemm");
    }

    #[test]
    #[serial]
    fn test_constants_emitted_once() {
        let mut session =
            ExportSession::open(ExportConfig::new(prefix("const"), DType::F16)).unwrap();
        {
            let mut ex = Dispatcher::new(&NcnnKernels, KernelContext::traced(&mut session));
            let x = ex.graph_input(&[4], "x").unwrap();
            let w = Tensor::from_f32(&[4], &[1.0; 4]).with_name("mix").into_constant();
            ex.mul(&x, &w).unwrap();
            ex.add(&x, &w).unwrap();
            let viewed = ex.reshape(&w, &[2, 2]).unwrap();
            assert!(!viewed.is_placeholder());
            let grid = ex.reshape(&x, &[2, 2]).unwrap();
            ex.mul(&grid, &viewed).unwrap();
        }
        let memory = session
            .nodes()
            .iter()
            .filter(|node| node.op_type == "MemoryData")
            .count();
        assert_eq!(memory, 2);
    }

    #[test]
    #[serial]
    fn test_scalar_and_norm_attrs() {
        let mut session = ExportSession::open(ExportConfig::new(prefix("attrs"), DType::F16)).unwrap();
        {
            let mut ex = Dispatcher::new(&NcnnKernels, KernelContext::traced(&mut session));
            let x = ex.graph_input(&[8], "x").unwrap();
            ex.rsub_scalar(&x, 1.0).unwrap();
            let ones = Tensor::from_f32(&[8], &[1.0; 8]);
            ex.group_norm(&x, 2, &ones, &ones, 64e-5).unwrap();
            let rows = ex.reshape(&x, &[2, 4]).unwrap();
            let s = ex.sum_last(&rows).unwrap();
            assert_eq!(s.shape(), &[2, 1]);
        }
        let nodes = session.nodes();
        let rsub = nodes.iter().find(|n| n.op_type == "BinaryOp").unwrap();
        assert_eq!(rsub.attrs[0], (0, "7".to_string()));
        assert_eq!(rsub.attrs[2], (2, "1.000000e+00".to_string()));
        let gn = nodes.iter().find(|n| n.op_type == "GroupNorm").unwrap();
        assert_eq!(gn.attrs[2], (2, "6.400000e-04".to_string()));
    }

    #[test]
    #[serial]
    fn test_split_shapes() {
        let mut session = ExportSession::open(ExportConfig::new(prefix("split"), DType::F16)).unwrap();
        let mut ex = Dispatcher::new(&NcnnKernels, KernelContext::traced(&mut session));
        let x = ex.graph_input(&[5, 6], "x").unwrap();
        let parts = ex.split(&x, 5).unwrap();
        assert_eq!(parts.len(), 5);
        assert!(parts.iter().all(|p| p.shape() == [1, 6]));
    }

    #[test]
    #[serial]
    fn test_scalar_operands_are_rejected() {
        let mut session = ExportSession::open(ExportConfig::new(prefix("scalar"), DType::F16)).unwrap();
        {
            let mut ex = Dispatcher::new(&NcnnKernels, KernelContext::traced(&mut session));
            let x = ex.graph_input(&[4], "x").unwrap();
            let s = Tensor::from_f32(&[], &[2.0]);
            assert!(matches!(ex.matmul(&x, &s), Err(Error::InvalidShape(_))));
            assert!(matches!(ex.matmul(&s, &s), Err(Error::InvalidShape(_))));
        }
        assert_eq!(session.nodes().len(), 1);
    }

    #[test]
    #[serial]
    fn test_embedding_rows_must_fill_groups() {
        let mut session = ExportSession::open(ExportConfig::new(prefix("embed"), DType::Int8)).unwrap();
        let mut ex = Dispatcher::new(&NcnnKernels, KernelContext::traced(&mut session));
        let narrow = Tensor::from_f32(&[4, 32], &[0.25; 128]);
        assert!(matches!(
            ex.embedding(&narrow, 0),
            Err(Error::InvalidShape(_))
        ));
        let wide = Tensor::from_f32(&[2, 64], &[0.25; 128]);
        assert_eq!(ex.embedding(&wide, 0).unwrap().shape(), &[64]);
    }

    #[test]
    fn test_kernels_need_a_session() {
        let mut ex = Dispatcher::new(&NcnnKernels, KernelContext::eager());
        let x = Tensor::placeholder(&[2], DType::F32, Device::NcnnMeta, "x");
        assert!(matches!(ex.exp(&x), Err(Error::Resource(_))));
        assert!(matches!(ex.softmax(&x, 1.0), Err(Error::Dispatch { .. })));
    }
}
