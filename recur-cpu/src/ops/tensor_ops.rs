//! Shape-level ops: reductions and splits.

use recur::{Error, Result, Tensor};

use super::{check_host, output};

/// Sum over the last axis, kept as size 1.
pub fn sum_last(x: &Tensor) -> Result<Tensor> {
    check_host("sum", x)?;
    let width = x.shape().last().copied().unwrap_or(1).max(1);
    let sums: Vec<f32> = x.to_f32()?.chunks(width).map(|row| row.iter().sum()).collect();
    let mut shape = x.shape().to_vec();
    if let Some(last) = shape.last_mut() {
        *last = 1;
    } else {
        shape.push(1);
    }
    output(&shape, &sums, x.dtype())
}

/// Split axis 0 into `parts` equal views.
pub fn split(x: &Tensor, parts: usize) -> Result<Vec<Tensor>> {
    check_host("split", x)?;
    let rows = x.shape().first().copied().unwrap_or(0);
    if parts == 0 || rows % parts != 0 {
        return Err(Error::InvalidShape(format!(
            "cannot split axis of {rows} into {parts} parts"
        )));
    }
    let mut shape = x.shape().to_vec();
    shape[0] = rows / parts;
    let chunk: usize = shape.iter().product();
    (0..parts).map(|i| x.slice_view(i * chunk, &shape)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_last_keeps_dim() {
        let x = Tensor::from_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let s = sum_last(&x).unwrap();
        assert_eq!(s.shape(), &[2, 1]);
        assert_eq!(s.as_f32_slice(), &[6.0, 15.0]);
    }

    #[test]
    fn test_split_axis0() {
        let x = Tensor::from_f32(&[4, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let parts = split(&x, 2).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].shape(), &[2, 2]);
        assert_eq!(parts[1].as_f32_slice(), &[4.0, 5.0, 6.0, 7.0]);
        assert!(split(&x, 3).is_err());
    }
}
