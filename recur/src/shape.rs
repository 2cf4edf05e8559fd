//! Shape arithmetic shared by every kernel set.

use crate::error::{Error, Result};

/// Number of elements in a shape.
#[must_use]
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major element strides.
#[must_use]
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Numpy-style broadcast of two shapes, aligned from the trailing dim.
///
/// # Errors
/// Returns `InvalidShape` when a pair of dims is neither equal nor 1.
pub fn broadcast(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = dim_from_back(a, rank - 1 - i);
        let db = dim_from_back(b, rank - 1 - i);
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(Error::InvalidShape(format!(
                    "cannot broadcast {a:?} with {b:?}"
                )))
            }
        };
    }
    Ok(out)
}

/// Strides of `shape` viewed inside the broadcast `out` shape.
///
/// Broadcast (size-1 or missing) dims get stride 0.
#[must_use]
pub fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let own = strides(shape);
    let pad = out.len() - shape.len();
    (0..out.len())
        .map(|i| {
            if i < pad || shape[i - pad] == 1 {
                0
            } else {
                own[i - pad]
            }
        })
        .collect()
}

fn dim_from_back(shape: &[usize], from_back: usize) -> usize {
    if from_back < shape.len() {
        shape[shape.len() - 1 - from_back]
    } else {
        1
    }
}

/// Output shape of `a @ b`.
///
/// A 1-D `a` is a single row and its row dim is dropped from the result.
/// A 2-D `b` is shared across every leading dim of `a`. Otherwise both
/// operands are batched and their leading dims broadcast.
///
/// # Errors
/// Returns `ShapeMismatch` on a contraction mismatch and `InvalidShape` when
/// ranks are unsupported or batch dims do not broadcast.
pub fn matmul(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    if a.is_empty() || b.len() < 2 {
        return Err(Error::InvalidShape(format!(
            "matmul needs a non-scalar lhs and a matrix rhs, got {a:?} @ {b:?}"
        )));
    }
    let k = a[a.len() - 1];
    let (kb, n) = (b[b.len() - 2], b[b.len() - 1]);
    if k != kb {
        return Err(Error::ShapeMismatch {
            expected: vec![k, n],
            got: b.to_vec(),
        });
    }
    if a.len() == 1 {
        if b.len() != 2 {
            return Err(Error::InvalidShape(format!(
                "vector lhs needs a 2-D rhs, got {b:?}"
            )));
        }
        return Ok(vec![n]);
    }
    if b.len() == 2 {
        let mut out = a[..a.len() - 1].to_vec();
        out.push(n);
        return Ok(out);
    }
    let m = a[a.len() - 2];
    let mut out = broadcast(&a[..a.len() - 2], &b[..b.len() - 2])?;
    out.push(m);
    out.push(n);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides(&[7]), vec![1]);
        assert!(strides(&[]).is_empty());
    }

    #[test]
    fn test_broadcast_rules() {
        assert_eq!(broadcast(&[4, 3, 3], &[4, 3, 1]).unwrap(), vec![4, 3, 3]);
        assert_eq!(broadcast(&[3], &[2, 1]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast(&[1, 1, 5], &[5]).unwrap(), vec![1, 1, 5]);
        assert!(broadcast(&[3], &[4]).is_err());
    }

    #[test]
    fn test_broadcast_strides_zero_out_expanded_dims() {
        assert_eq!(broadcast_strides(&[4, 3, 1], &[4, 3, 3]), vec![3, 1, 0]);
        assert_eq!(broadcast_strides(&[3], &[2, 3]), vec![0, 1]);
    }

    #[test]
    fn test_matmul_shapes() {
        assert_eq!(matmul(&[8], &[8, 5]).unwrap(), vec![5]);
        assert_eq!(matmul(&[2, 8], &[8, 5]).unwrap(), vec![2, 5]);
        assert_eq!(matmul(&[4, 3, 1], &[4, 1, 3]).unwrap(), vec![4, 3, 3]);
        assert_eq!(matmul(&[4, 1, 3], &[4, 3, 3]).unwrap(), vec![4, 1, 3]);
        assert_eq!(matmul(&[5, 1, 6], &[5, 6, 2]).unwrap(), vec![5, 1, 2]);
        assert!(matmul(&[8], &[7, 5]).is_err());
        assert!(matmul(&[8], &[2, 8, 5]).is_err());
    }
}
