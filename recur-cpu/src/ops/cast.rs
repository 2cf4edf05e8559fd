//! Float dtype conversion.

use recur::{DType, Error, Result, Tensor};

use super::check_host;

pub fn cast(x: &Tensor, dtype: DType) -> Result<Tensor> {
    check_host("cast_dtype", x)?;
    if !dtype.is_float() {
        return Err(Error::UnsupportedDtype(format!(
            "cpu kernels cannot cast to {dtype}"
        )));
    }
    x.to_dtype(dtype)
}
