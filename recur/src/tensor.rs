//! Device-tagged tensor handle.
//!
//! A [`Tensor`] is a cheap-to-clone handle. Host tensors share an
//! `Arc<Vec<u8>>` so clones, reshapes and `slice_view`s never copy data.
//! Tensors on meta devices carry no data at all; they name an edge in the
//! export graph being recorded.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use half::f16;

use crate::device::Device;
use crate::dtype::{DType, TensorDType};
use crate::error::{Error, Result};
use crate::shape;

#[derive(Clone)]
enum Storage {
    Host(Arc<Vec<u8>>),
    Placeholder,
}

/// Shape, dtype, device and (for host tensors) shared byte storage.
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    offset: usize,
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    name: String,
    constant: bool,
}

impl Tensor {
    fn host(shape: &[usize], dtype: DType, bytes: Vec<u8>) -> Self {
        Self {
            storage: Storage::Host(Arc::new(bytes)),
            offset: 0,
            shape: shape.to_vec(),
            dtype,
            device: Device::Cpu,
            name: String::new(),
            constant: false,
        }
    }

    /// Create a host tensor from a slice of any element type.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the shape's element count.
    #[must_use]
    pub fn from_slice<T: TensorDType>(shape: &[usize], data: &[T]) -> Self {
        let numel = shape::numel(shape);
        assert_eq!(
            data.len(),
            numel,
            "data len {} != shape product {numel}",
            data.len()
        );
        Self::host(shape, T::DTYPE, bytemuck::cast_slice(data).to_vec())
    }

    /// Create a host tensor from an f32 slice.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the shape's element count.
    #[must_use]
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Self {
        Self::from_slice(shape, data)
    }

    /// Create a host tensor from an f16 slice.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the shape's element count.
    #[must_use]
    pub fn from_f16(shape: &[usize], data: &[f16]) -> Self {
        Self::from_slice(shape, data)
    }

    /// Create a host tensor of a float dtype from f32 values.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` on a length mismatch and `UnsupportedDtype`
    /// for quantized dtypes.
    pub fn from_f32_as(shape: &[usize], data: &[f32], dtype: DType) -> Result<Self> {
        let numel = shape::numel(shape);
        if data.len() != numel {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        match dtype {
            DType::F32 => Ok(Self::from_f32(shape, data)),
            DType::F16 => {
                let halves: Vec<f16> = data.iter().map(|&v| f16::from_f32(v)).collect();
                Ok(Self::from_f16(shape, &halves))
            }
            other => Err(Error::UnsupportedDtype(format!(
                "cannot build a {other} tensor from f32 values"
            ))),
        }
    }

    /// Create a host tensor from raw little-endian bytes.
    ///
    /// # Errors
    /// Returns `InvalidShape` if the byte length does not match the shape.
    pub fn from_raw(shape: &[usize], dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = dtype.storage_bytes(shape::numel(shape));
        if data.len() != expected {
            return Err(Error::InvalidShape(format!(
                "{} bytes cannot hold a {dtype} tensor of shape {shape:?} ({expected} bytes)",
                data.len()
            )));
        }
        Ok(Self::host(shape, dtype, data))
    }

    /// Create a zero-filled host tensor.
    #[must_use]
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let bytes = dtype.storage_bytes(shape::numel(shape));
        Self::host(shape, dtype, vec![0u8; bytes])
    }

    /// Create a host tensor with every element set to `value`.
    ///
    /// # Errors
    /// Returns `UnsupportedDtype` for quantized dtypes.
    pub fn full(shape: &[usize], value: f32, dtype: DType) -> Result<Self> {
        Self::from_f32_as(shape, &vec![value; shape::numel(shape)], dtype)
    }

    /// Create a data-less tensor standing for a graph edge on `device`.
    #[must_use]
    pub fn placeholder(shape: &[usize], dtype: DType, device: Device, name: &str) -> Self {
        Self {
            storage: Storage::Placeholder,
            offset: 0,
            shape: shape.to_vec(),
            dtype,
            device,
            name: name.to_string(),
            constant: false,
        }
    }

    /// Returns the shape of the tensor as a slice of dimensions
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the data type of tensor elements
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Weight name for constants, edge name for placeholders.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Constants are model parameters, deduplicated by name on export.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    #[must_use]
    pub fn into_constant(mut self) -> Self {
        self.constant = true;
        self
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        matches!(self.storage, Storage::Placeholder)
    }

    /// Returns the total number of elements in the tensor
    #[must_use]
    pub fn numel(&self) -> usize {
        shape::numel(&self.shape)
    }

    /// Returns the number of dimensions (rank) of the tensor
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the size of the tensor data in bytes
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel())
    }

    /// Get the raw bytes.
    ///
    /// # Errors
    /// Placeholders have no bytes.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match &self.storage {
            Storage::Host(data) => Ok(&data[self.offset..self.offset + self.size_in_bytes()]),
            Storage::Placeholder => Err(Error::Resource(format!(
                "tensor {:?} on {} has no host data",
                self.name, self.device
            ))),
        }
    }

    /// Get the data as an f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32, the tensor has no host data, or the
    /// storage is not 4-byte aligned.
    #[must_use]
    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        let bytes = self.as_bytes().expect("host tensor");
        bytemuck::try_cast_slice(bytes).expect("aligned f32 storage")
    }

    /// Borrow the values as f32 when possible, converting f16 otherwise.
    ///
    /// # Errors
    /// Fails for placeholders and quantized dtypes.
    pub fn to_f32(&self) -> Result<Cow<'_, [f32]>> {
        let bytes = self.as_bytes()?;
        match self.dtype {
            DType::F32 => Ok(match bytemuck::try_cast_slice(bytes) {
                Ok(values) => Cow::Borrowed(values),
                Err(_) => Cow::Owned(bytemuck::pod_collect_to_vec(bytes)),
            }),
            DType::F16 => {
                let halves: Vec<f16> = bytemuck::pod_collect_to_vec(bytes);
                Ok(Cow::Owned(halves.iter().map(|v| v.to_f32()).collect()))
            }
            other => Err(Error::UnsupportedDtype(format!(
                "cannot read {other} tensor {:?} as f32",
                self.name
            ))),
        }
    }

    /// Convert to an f32 Vec, casting from f16 if necessary.
    ///
    /// # Errors
    /// Fails for placeholders and quantized dtypes.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        Ok(self.to_f32()?.into_owned())
    }

    /// Host copy converted to another float dtype.
    ///
    /// # Errors
    /// Fails for placeholders and quantized dtypes.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        let values = self.to_f32()?;
        let mut out = Self::from_f32_as(&self.shape, &values, dtype)?;
        out.name.clone_from(&self.name);
        out.constant = self.constant;
        Ok(out)
    }

    /// Create a view with a different shape (same data, same number of elements).
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the element counts differ.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        if shape::numel(shape) != self.numel() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: shape.to_vec(),
            });
        }
        let mut out = self.clone();
        out.shape = shape.to_vec();
        Ok(out)
    }

    /// Create a zero-copy view starting at element `offset` with `shape`.
    ///
    /// # Errors
    /// Fails for placeholders, packed dtypes and out-of-bounds views.
    pub fn slice_view(&self, offset: usize, shape: &[usize]) -> Result<Self> {
        let Storage::Host(data) = &self.storage else {
            return Err(Error::Resource("cannot view a placeholder".into()));
        };
        if self.dtype.bits() % 8 != 0 {
            return Err(Error::UnsupportedDtype(format!(
                "cannot view packed {} data",
                self.dtype
            )));
        }
        let elem = self.dtype.bits() / 8;
        let byte_offset = self.offset + offset * elem;
        if byte_offset + shape::numel(shape) * elem > data.len() {
            return Err(Error::InvalidShape(format!(
                "view of {shape:?} at element {offset} exceeds tensor {:?}",
                self.shape
            )));
        }
        Ok(Self {
            storage: Storage::Host(Arc::clone(data)),
            offset: byte_offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
            device: self.device,
            name: self.name.clone(),
            constant: self.constant,
        })
    }

    /// Tensor with host-resident data, copying if needed.
    ///
    /// # Errors
    /// Placeholders cannot be brought to the host.
    pub fn to_host(&self) -> Result<Self> {
        match self.storage {
            Storage::Host(_) if self.device.is_host() => Ok(self.clone()),
            Storage::Host(_) => {
                let mut out = Self::host(&self.shape, self.dtype, self.as_bytes()?.to_vec());
                out.name.clone_from(&self.name);
                Ok(out)
            }
            Storage::Placeholder => Err(Error::Resource(format!(
                "tensor {:?} on {} has no host data",
                self.name, self.device
            ))),
        }
    }

    /// True when both handles view the same backing allocation.
    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        match (&self.storage, &other.storage) {
            (Storage::Host(a), Storage::Host(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("placeholder", &self.is_placeholder())
            .finish()
    }
}
