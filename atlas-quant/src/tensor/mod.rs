//! Dense row-major tensors.
//!
//! [`Tensor`] is statically typed. [`DynTensor`] carries its element type at run time and
//! is what callers hand to the module entry points, so that a float array passed where
//! integer codes are expected is reported instead of silently converted.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use thiserror::Error;

pub mod quantized;

pub use quantized::{OpValue, QuantizedTensor};

/// Errors raised by tensor construction and reshaping.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorError {
    #[error("tensor with dims {dims:?} needs {expected} values, got {got}")]
    DimMismatch {
        dims: Vec<usize>,
        expected: usize,
        got: usize,
    },
    #[error("a 0-d tensor has no batch dimension")]
    NoBatchDim,
    #[error("sample {index} is out of bounds for a batch of {len}")]
    SampleOutOfBounds { index: usize, len: usize },
    #[error("cannot concatenate an empty list of tensors")]
    EmptyConcat,
    #[error("cannot concatenate tensors with trailing dims {left:?} and {right:?}")]
    ConcatShapeMismatch { left: Vec<usize>, right: Vec<usize> },
    #[error("value {value} is outside the {n_bits}-bit range [{min}, {max}]")]
    OutOfRange {
        value: i64,
        n_bits: u32,
        min: i64,
        max: i64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
/// A dense tensor stored in row-major order.
pub struct Tensor<T> {
    data: Vec<T>,
    dims: Vec<usize>,
}

impl<T: Clone> Tensor<T> {
    /// Create a tensor with the given dims, filled with `values` or with `T::default()`.
    pub fn new(values: Option<&[T]>, dims: &[usize]) -> Result<Self, TensorError>
    where
        T: Default,
    {
        let expected = dims.iter().product::<usize>();
        let data = match values {
            Some(values) => {
                if values.len() != expected {
                    return Err(TensorError::DimMismatch {
                        dims: dims.to_vec(),
                        expected,
                        got: values.len(),
                    });
                }
                values.to_vec()
            }
            None => vec![T::default(); expected],
        };
        Ok(Tensor {
            data,
            dims: dims.to_vec(),
        })
    }

    /// Build a tensor from owned data. Panics if `data` does not fill `dims`.
    pub fn construct(data: Vec<T>, dims: Vec<usize>) -> Self {
        assert_eq!(
            data.len(),
            dims.iter().product::<usize>(),
            "data does not match dims {dims:?}"
        );
        Tensor { data, dims }
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    /// Apply `f` element-wise, keeping the dims.
    pub fn map<U, F: FnMut(&T) -> U>(&self, f: F) -> Tensor<U> {
        Tensor {
            data: self.data.iter().map(f).collect(),
            dims: self.dims.clone(),
        }
    }

    /// Size of the leading (sample) dimension.
    pub fn batch_size(&self) -> Result<usize, TensorError> {
        self.dims.first().copied().ok_or(TensorError::NoBatchDim)
    }

    /// Extract sample `index` along the leading dimension, keeping that dimension with size 1.
    pub fn sample(&self, index: usize) -> Result<Self, TensorError> {
        let len = self.batch_size()?;
        if index >= len {
            return Err(TensorError::SampleOutOfBounds { index, len });
        }
        let stride = self.dims[1..].iter().product::<usize>();
        let mut dims = self.dims.clone();
        dims[0] = 1;
        Ok(Tensor {
            data: self.data[index * stride..(index + 1) * stride].to_vec(),
            dims,
        })
    }

    /// Concatenate along the leading dimension. Trailing dims must agree.
    pub fn concat_batch(parts: &[Self]) -> Result<Self, TensorError> {
        let first = parts.first().ok_or(TensorError::EmptyConcat)?;
        first.batch_size()?;
        let trailing = &first.dims[1..];
        let mut data = Vec::with_capacity(parts.iter().map(Tensor::len).sum());
        let mut batch = 0;
        for part in parts {
            batch += part.batch_size()?;
            if &part.dims[1..] != trailing {
                return Err(TensorError::ConcatShapeMismatch {
                    left: trailing.to_vec(),
                    right: part.dims[1..].to_vec(),
                });
            }
            data.extend_from_slice(&part.data);
        }
        let mut dims = first.dims.clone();
        dims[0] = batch;
        Ok(Tensor { data, dims })
    }
}

impl<T> FromIterator<T> for Tensor<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let data: Vec<T> = iter.into_iter().collect();
        let dims = vec![data.len()];
        Tensor { data, dims }
    }
}

impl<T> From<Vec<T>> for Tensor<T> {
    fn from(data: Vec<T>) -> Self {
        let dims = vec![data.len()];
        Tensor { data, dims }
    }
}

/// Element type of a [`DynTensor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter, Serialize, Deserialize)]
pub enum DType {
    #[strum(serialize = "int32")]
    I32,
    #[strum(serialize = "int64")]
    I64,
    #[strum(serialize = "float32")]
    F32,
    #[strum(serialize = "float64")]
    F64,
}

impl DType {
    pub fn is_integer(self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }
}

/// A tensor whose element type is only known at run time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DynTensor {
    I32(Tensor<i32>),
    I64(Tensor<i64>),
    F32(Tensor<f32>),
    F64(Tensor<f64>),
}

impl DynTensor {
    pub fn dtype(&self) -> DType {
        match self {
            DynTensor::I32(_) => DType::I32,
            DynTensor::I64(_) => DType::I64,
            DynTensor::F32(_) => DType::F32,
            DynTensor::F64(_) => DType::F64,
        }
    }

    pub fn dims(&self) -> &[usize] {
        match self {
            DynTensor::I32(t) => t.dims(),
            DynTensor::I64(t) => t.dims(),
            DynTensor::F32(t) => t.dims(),
            DynTensor::F64(t) => t.dims(),
        }
    }

    pub fn batch_size(&self) -> Result<usize, TensorError> {
        self.dims().first().copied().ok_or(TensorError::NoBatchDim)
    }

    /// Widen integer codes to `i64`; `None` for float tensors.
    pub fn to_i64(&self) -> Option<Tensor<i64>> {
        match self {
            DynTensor::I32(t) => Some(t.map(|&v| i64::from(v))),
            DynTensor::I64(t) => Some(t.clone()),
            DynTensor::F32(_) | DynTensor::F64(_) => None,
        }
    }

    /// Widen float values to `f64`; `None` for integer tensors.
    pub fn to_f64(&self) -> Option<Tensor<f64>> {
        match self {
            DynTensor::F32(t) => Some(t.map(|&v| f64::from(v))),
            DynTensor::F64(t) => Some(t.clone()),
            DynTensor::I32(_) | DynTensor::I64(_) => None,
        }
    }
}

macro_rules! impl_dyn_from {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl From<Tensor<$ty>> for DynTensor {
                fn from(tensor: Tensor<$ty>) -> Self {
                    DynTensor::$variant(tensor)
                }
            }
        )*
    };
}

impl_dyn_from!(i32 => I32, i64 => I64, f32 => F32, f64 => F64);
