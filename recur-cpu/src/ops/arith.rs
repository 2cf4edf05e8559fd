//! Element-wise arithmetic with numpy broadcasting.

use recur::kernels::{BinaryOp, ScalarOp};
use recur::{shape, Result, Tensor};

use super::{check_host, output};

/// `a op b`, broadcasting both operands to a common shape.
pub fn binary(op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_host(op.name(), a)?;
    check_host(op.name(), b)?;
    let out_shape = shape::broadcast(a.shape(), b.shape())?;
    let a_data = a.to_f32()?;
    let b_data = b.to_f32()?;

    let out: Vec<f32> = if a.shape() == b.shape() {
        a_data
            .iter()
            .zip(b_data.iter())
            .map(|(&x, &y)| op.apply(x, y))
            .collect()
    } else if b_data.len() == 1 {
        let y = b_data[0];
        let mut out: Vec<f32> = a_data.iter().map(|&x| op.apply(x, y)).collect();
        if out.len() != shape::numel(&out_shape) {
            out = broadcast_apply(op, &a_data, a.shape(), &b_data, b.shape(), &out_shape);
        }
        out
    } else {
        broadcast_apply(op, &a_data, a.shape(), &b_data, b.shape(), &out_shape)
    };
    output(&out_shape, &out, a.dtype())
}

fn broadcast_apply(
    op: BinaryOp,
    a: &[f32],
    a_shape: &[usize],
    b: &[f32],
    b_shape: &[usize],
    out_shape: &[usize],
) -> Vec<f32> {
    let a_strides = shape::broadcast_strides(a_shape, out_shape);
    let b_strides = shape::broadcast_strides(b_shape, out_shape);
    let numel = shape::numel(out_shape);
    let rank = out_shape.len();

    let mut out = Vec::with_capacity(numel);
    let mut index = vec![0usize; rank];
    for _ in 0..numel {
        let ia: usize = index.iter().zip(&a_strides).map(|(i, s)| i * s).sum();
        let ib: usize = index.iter().zip(&b_strides).map(|(i, s)| i * s).sum();
        out.push(op.apply(a[ia], b[ib]));
        for dim in (0..rank).rev() {
            index[dim] += 1;
            if index[dim] < out_shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
    out
}

/// `x op value` for every element.
pub fn scalar(op: ScalarOp, x: &Tensor, value: f32) -> Result<Tensor> {
    check_host(op.name(), x)?;
    let out: Vec<f32> = x.to_f32()?.iter().map(|&v| op.apply(v, value)).collect();
    output(x.shape(), &out, x.dtype())
}

#[cfg(test)]
mod tests {
    use super::*;
    use recur::DType;

    #[test]
    fn test_same_shape_add() {
        let a = Tensor::from_f32(&[3], &[1.0, 2.0, 3.0]);
        let b = Tensor::from_f32(&[3], &[10.0, 20.0, 30.0]);
        let c = binary(BinaryOp::Add, &a, &b).unwrap();
        assert_eq!(c.as_f32_slice(), &[11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_broadcast_trailing_unit_dim() {
        // [2,2,2] * [2,2,1]: each row scaled by its own factor
        let s = Tensor::from_f32(&[2, 2, 2], &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0]);
        let w = Tensor::from_f32(&[2, 2, 1], &[1.0, 10.0, 100.0, 1000.0]);
        let c = binary(BinaryOp::Mul, &s, &w).unwrap();
        assert_eq!(c.shape(), &[2, 2, 2]);
        assert_eq!(
            c.as_f32_slice(),
            &[1.0, 1.0, 20.0, 20.0, 300.0, 300.0, 4000.0, 4000.0]
        );
    }

    #[test]
    fn test_broadcast_lower_rank_rhs() {
        let a = Tensor::from_f32(&[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let b = Tensor::from_f32(&[3], &[1.0, 1.0, 1.0]);
        let c = binary(BinaryOp::Sub, &a, &b).unwrap();
        assert_eq!(c.as_f32_slice(), &[-1.0, 0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_single_element_rhs_expands_lhs() {
        let a = Tensor::from_f32(&[1], &[2.0]);
        let b = Tensor::from_f32(&[2, 1], &[3.0, 4.0]);
        let c = binary(BinaryOp::Mul, &a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 1]);
        assert_eq!(c.as_f32_slice(), &[6.0, 8.0]);
    }

    #[test]
    fn test_incompatible_shapes_fail() {
        let a = Tensor::from_f32(&[3], &[0.0; 3]);
        let b = Tensor::from_f32(&[2], &[0.0; 2]);
        assert!(binary(BinaryOp::Add, &a, &b).is_err());
    }

    #[test]
    fn test_result_takes_lhs_dtype() {
        let a = Tensor::from_f32(&[2], &[1.5, 2.5]).to_dtype(DType::F16).unwrap();
        let b = Tensor::from_f32(&[2], &[0.5, 0.5]);
        let c = binary(BinaryOp::Maximum, &a, &b).unwrap();
        assert_eq!(c.dtype(), DType::F16);
        let d = binary(BinaryOp::Add, &b, &a).unwrap();
        assert_eq!(d.dtype(), DType::F32);
        assert_eq!(d.as_f32_slice(), &[2.0, 3.0]);
    }

    #[test]
    fn test_scalar_ops() {
        let x = Tensor::from_f32(&[2], &[0.25, 4.0]);
        assert_eq!(scalar(ScalarOp::Rsub, &x, 1.0).unwrap().as_f32_slice(), &[0.75, -3.0]);
        assert_eq!(scalar(ScalarOp::Div, &x, 2.0).unwrap().as_f32_slice(), &[0.125, 2.0]);
        assert_eq!(scalar(ScalarOp::Mul, &x, -1.0).unwrap().as_f32_slice(), &[-0.25, -4.0]);
    }
}
