//! Typed, shaped storage exchanged across the engine boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DnnError, Result};

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Float64,
    Int32,
    Int64,
    UInt8,
    Bool,
}

impl DType {
    /// Returns the lower-case type name (`"float32"`, ...).
    pub fn name(self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::Bool => "bool",
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Float32 | DType::Int32 => 4,
            DType::Float64 | DType::Int64 => 8,
            DType::UInt8 | DType::Bool => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row-major element storage, one variant per [`DType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
}

impl Data {
    pub fn dtype(&self) -> DType {
        match self {
            Data::F32(_) => DType::Float32,
            Data::F64(_) => DType::Float64,
            Data::I32(_) => DType::Int32,
            Data::I64(_) => DType::Int64,
            Data::U8(_) => DType::UInt8,
            Data::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Data::F32(v) => v.len(),
            Data::F64(v) => v.len(),
            Data::I32(v) => v.len(),
            Data::I64(v) => v.len(),
            Data::U8(v) => v.len(),
            Data::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Float32 => Data::F32(vec![0.0; len]),
            DType::Float64 => Data::F64(vec![0.0; len]),
            DType::Int32 => Data::I32(vec![0; len]),
            DType::Int64 => Data::I64(vec![0; len]),
            DType::UInt8 => Data::U8(vec![0; len]),
            DType::Bool => Data::Bool(vec![false; len]),
        }
    }
}

/// A Rust scalar type that can be stored in a [`Buffer`].
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;

    fn slice(data: &Data) -> Option<&[Self]>;
    fn slice_mut(data: &mut Data) -> Option<&mut [Self]>;
    fn wrap(values: Vec<Self>) -> Data;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:ident, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$dtype;

            fn slice(data: &Data) -> Option<&[Self]> {
                match data {
                    Data::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(data: &mut Data) -> Option<&mut [Self]> {
                match data {
                    Data::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(values: Vec<Self>) -> Data {
                Data::$variant(values)
            }
        }
    };
}

impl_element!(f32, Float32, F32);
impl_element!(f64, Float64, F64);
impl_element!(i32, Int32, I32);
impl_element!(i64, Int64, I64);
impl_element!(u8, UInt8, U8);
impl_element!(bool, Bool, Bool);

/// An allocated, shaped block of elements.
///
/// A buffer always holds exactly `shape.iter().product()` elements. Moving a
/// buffer moves ownership of its storage; nothing is reference counted.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    shape: Vec<usize>,
    data: Data,
}

impl Buffer {
    /// Number of elements a buffer of `shape` holds.
    ///
    /// Fails when the count, or its size in bytes for `dtype`, does not fit
    /// in the address space.
    pub fn element_count(dtype: DType, shape: &[usize]) -> Result<usize> {
        shape
            .iter()
            .try_fold(1usize, |n, &extent| n.checked_mul(extent))
            .filter(|&n| {
                n.checked_mul(dtype.size())
                    .is_some_and(|bytes| bytes <= isize::MAX as usize)
            })
            .ok_or_else(|| DnnError::InvalidTensor(format!("shape {shape:?} of {dtype} overflows")))
    }

    /// Allocates a zero-filled buffer.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Result<Self> {
        let len = Self::element_count(dtype, shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            data: Data::zeros(dtype, len),
        })
    }

    /// Wraps `data` with the given shape.
    pub fn from_vec<T: Element>(shape: &[usize], data: Vec<T>) -> Result<Self> {
        Self::from_data(shape, T::wrap(data))
    }

    /// Wraps untyped storage with the given shape.
    pub fn from_data(shape: &[usize], data: Data) -> Result<Self> {
        let want = Self::element_count(data.dtype(), shape)?;
        if data.len() != want {
            return Err(DnnError::InvalidTensor(format!(
                "shape {shape:?} needs {want} elements, got {}",
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn into_data(self) -> Data {
        self.data
    }

    /// Returns the elements as `T`, or `None` on a dtype mismatch.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(&self.data)
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        T::slice_mut(&mut self.data)
    }

    /// Converts every element to `f64`. Booleans map to 0 and 1.
    pub(crate) fn to_f64_vec(&self) -> Vec<f64> {
        match &self.data {
            Data::F32(v) => v.iter().map(|&x| x as f64).collect(),
            Data::F64(v) => v.clone(),
            Data::I32(v) => v.iter().map(|&x| x as f64).collect(),
            Data::I64(v) => v.iter().map(|&x| x as f64).collect(),
            Data::U8(v) => v.iter().map(|&x| x as f64).collect(),
            Data::Bool(v) => v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Builds a buffer of `dtype` from `f64` values, casting each element.
    pub(crate) fn from_f64(dtype: DType, shape: Vec<usize>, values: Vec<f64>) -> Self {
        let data = match dtype {
            DType::Float32 => Data::F32(values.into_iter().map(|x| x as f32).collect()),
            DType::Float64 => Data::F64(values),
            DType::Int32 => Data::I32(values.into_iter().map(|x| x as i32).collect()),
            DType::Int64 => Data::I64(values.into_iter().map(|x| x as i64).collect()),
            DType::UInt8 => Data::U8(values.into_iter().map(|x| x as u8).collect()),
            DType::Bool => Data::Bool(values.into_iter().map(|x| x != 0.0).collect()),
        };
        Self { shape, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_matches_shape() {
        let b = Buffer::zeros(DType::Int64, &[2, 3]).unwrap();
        assert_eq!(b.len(), 6);
        assert_eq!(b.rank(), 2);
        assert_eq!(b.as_slice::<i64>().unwrap(), &[0; 6]);
    }

    #[test]
    fn scalar_has_one_element() {
        let b = Buffer::zeros(DType::Float32, &[]).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b.rank(), 0);
    }

    #[test]
    fn overflowing_shapes_are_rejected() {
        let err = Buffer::zeros(DType::Float32, &[1 << 40, 1 << 40]).unwrap_err();
        assert!(matches!(err, DnnError::InvalidTensor(_)));
        assert!(err.to_string().contains("overflows"));

        let err = Buffer::zeros(DType::Float64, &[usize::MAX / 4]).unwrap_err();
        assert!(matches!(err, DnnError::InvalidTensor(_)));

        let err = Buffer::from_vec(&[usize::MAX, 2], vec![1u8]).unwrap_err();
        assert!(matches!(err, DnnError::InvalidTensor(_)));

        assert_eq!(Buffer::element_count(DType::UInt8, &[0, usize::MAX]).unwrap(), 0);
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Buffer::from_vec(&[2, 2], vec![1.0f32, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, DnnError::InvalidTensor(_)));
    }

    #[test]
    fn typed_access_checks_dtype() {
        let b = Buffer::from_vec(&[2], vec![1i32, 2]).unwrap();
        assert!(b.as_slice::<f32>().is_none());
        assert_eq!(b.as_slice::<i32>().unwrap(), &[1, 2]);
    }

    #[test]
    fn f64_conversion_casts() {
        let b = Buffer::from_f64(DType::Int32, vec![3], vec![1.7, -2.2, 0.0]);
        assert_eq!(b.as_slice::<i32>().unwrap(), &[1, -2, 0]);
        assert_eq!(b.to_f64_vec(), vec![1.0, -2.0, 0.0]);
    }

    #[test]
    fn dtype_serde_names() {
        let s = serde_json::to_string(&DType::UInt8).unwrap();
        assert_eq!(s, "\"uint8\"");
        let d: DType = serde_json::from_str("\"float64\"").unwrap();
        assert_eq!(d, DType::Float64);
    }
}
