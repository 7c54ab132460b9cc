//! Tensor: a named, empty-or-allocated, typed multi-dimensional buffer.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::{Buffer, DType, Element};
use crate::error::{DnnError, Result};

/// A tensor is either empty or exclusively owns one [`Buffer`].
///
/// Shape, rank and element queries on an empty tensor fail with
/// [`DnnError::InvalidTensor`]; there are no sentinel values. The name is a
/// label for diagnostics and survives reallocation and clearing.
#[derive(Debug, Default)]
pub struct Tensor {
    name: String,
    buffer: Option<Buffer>,
}

impl Tensor {
    /// Creates an empty, unnamed tensor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty tensor called `name`.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer: None,
        }
    }

    /// Creates a zero-filled tensor.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Result<Self> {
        Ok(Self {
            name: String::new(),
            buffer: Some(Buffer::zeros(dtype, shape)?),
        })
    }

    /// Creates a tensor from row-major values.
    pub fn from_vec<T: Element>(shape: &[usize], data: Vec<T>) -> Result<Self> {
        Ok(Self {
            name: String::new(),
            buffer: Some(Buffer::from_vec(shape, data)?),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Allocates a zero-filled buffer of the given rank, shape and type.
    ///
    /// Any existing buffer is released first, including when validation
    /// fails, so a failed allocation leaves the tensor empty.
    pub fn allocate(&mut self, rank: usize, shape: &[i64], dtype: DType) -> Result<()> {
        self.clear();
        if shape.len() != rank {
            return Err(DnnError::InvalidTensor(format!(
                "shape {shape:?} has {} extents, rank is {rank}",
                shape.len()
            )));
        }
        let mut dims = Vec::with_capacity(rank);
        for (axis, &extent) in shape.iter().enumerate() {
            let extent = usize::try_from(extent).map_err(|_| {
                DnnError::InvalidTensor(format!("negative extent {extent} on axis {axis}"))
            })?;
            dims.push(extent);
        }
        self.buffer = Some(Buffer::zeros(dtype, &dims)?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_none()
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    /// Adopts `buffer`, taking ownership of it.
    ///
    /// The currently owned buffer, if any, is dropped before the new one is
    /// stored.
    pub fn replace_buffer(&mut self, buffer: Buffer) {
        drop(self.buffer.take());
        self.buffer = Some(buffer);
    }

    /// Gives up ownership of the buffer, leaving the tensor empty.
    pub fn take_buffer(&mut self) -> Option<Buffer> {
        self.buffer.take()
    }

    /// Releases the buffer, leaving the tensor empty.
    pub fn clear(&mut self) {
        drop(self.buffer.take());
    }

    pub fn dtype(&self) -> Result<DType> {
        Ok(self.allocated()?.dtype())
    }

    pub fn rank(&self) -> Result<usize> {
        Ok(self.allocated()?.rank())
    }

    pub fn shape(&self) -> Result<&[usize]> {
        Ok(self.allocated()?.shape())
    }

    /// Extent of one axis.
    pub fn dim(&self, axis: usize) -> Result<usize> {
        let shape = self.shape()?;
        shape.get(axis).copied().ok_or_else(|| {
            DnnError::InvalidTensor(format!("axis {axis} invalid for rank {}", shape.len()))
        })
    }

    /// Number of elements.
    pub fn len(&self) -> Result<usize> {
        Ok(self.allocated()?.len())
    }

    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        let buffer = self.allocated()?;
        let dtype = buffer.dtype();
        buffer.as_slice().ok_or_else(|| type_mismatch::<T>(dtype))
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        let buffer = self.allocated_mut()?;
        let dtype = buffer.dtype();
        buffer.as_mut_slice().ok_or_else(|| type_mismatch::<T>(dtype))
    }

    /// Reads the element at `pos`.
    pub fn get<T: Element>(&self, pos: &[usize]) -> Result<T> {
        let offset = self.offset(pos)?;
        Ok(self.as_slice::<T>()?[offset])
    }

    /// Writes the element at `pos`.
    pub fn set<T: Element>(&mut self, pos: &[usize], value: T) -> Result<()> {
        let offset = self.offset(pos)?;
        self.as_mut_slice::<T>()?[offset] = value;
        Ok(())
    }

    /// Fills every element with `value`.
    pub fn fill<T: Element>(&mut self, value: T) -> Result<()> {
        self.as_mut_slice::<T>()?.fill(value);
        Ok(())
    }

    /// Collects all values along `axis`, holding the other coordinates at
    /// `pos` (which has `rank - 1` entries). A negative axis counts from the
    /// last one.
    pub fn vector<T: Element>(&self, axis: isize, pos: &[usize]) -> Result<Vec<T>> {
        let shape = self.shape()?;
        let rank = shape.len() as isize;
        let axis = if axis < 0 { rank + axis } else { axis };
        if axis < 0 || axis >= rank {
            return Err(DnnError::InvalidTensor(format!(
                "axis {axis} invalid for rank {rank}"
            )));
        }
        let axis = axis as usize;
        if pos.len() + 1 != shape.len() {
            return Err(DnnError::InvalidTensor(format!(
                "position {pos:?} needs {} coordinates",
                shape.len() - 1
            )));
        }

        let mut full: Vec<usize> = Vec::with_capacity(shape.len());
        full.extend_from_slice(&pos[..axis]);
        full.push(0);
        full.extend_from_slice(&pos[axis..]);

        let values = self.as_slice::<T>()?;
        (0..shape[axis])
            .map(|i| {
                full[axis] = i;
                self.offset(&full).map(|o| values[o])
            })
            .collect()
    }

    /// Row-major offset of `pos`, bounds-checked on every axis.
    fn offset(&self, pos: &[usize]) -> Result<usize> {
        let shape = self.shape()?;
        if pos.len() != shape.len() {
            return Err(DnnError::InvalidTensor(format!(
                "position {pos:?} has {} coordinates, rank is {}",
                pos.len(),
                shape.len()
            )));
        }
        let mut offset = 0;
        for (axis, (&p, &extent)) in pos.iter().zip(shape).enumerate() {
            if p >= extent {
                return Err(DnnError::InvalidTensor(format!(
                    "index {p} out of bounds for axis {axis} with extent {extent}"
                )));
            }
            offset = offset * extent + p;
        }
        Ok(offset)
    }

    fn allocated(&self) -> Result<&Buffer> {
        self.buffer
            .as_ref()
            .ok_or_else(|| DnnError::InvalidTensor("tensor is empty".into()))
    }

    fn allocated_mut(&mut self) -> Result<&mut Buffer> {
        self.buffer
            .as_mut()
            .ok_or_else(|| DnnError::InvalidTensor("tensor is empty".into()))
    }
}

fn type_mismatch<T: Element>(held: DType) -> DnnError {
    DnnError::InvalidTensor(format!("tensor holds {held}, requested {}", T::DTYPE))
}

/// Caller-owned handle to a [`Tensor`].
///
/// Sessions and IOs keep clones of the handle to refer to a tensor without
/// taking it over; the tensor lives as long as any handle does. Two handles
/// refer to the same tensor iff [`SharedTensor::same`] is true.
#[derive(Debug, Clone, Default)]
pub struct SharedTensor(Arc<RwLock<Tensor>>);

impl SharedTensor {
    pub fn new(tensor: Tensor) -> Self {
        Self(Arc::new(RwLock::new(tensor)))
    }

    /// Creates a handle to an empty tensor.
    pub fn empty() -> Self {
        Self::new(Tensor::new())
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Tensor> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Tensor> {
        self.0.write()
    }

    /// Read lock that never waits behind a queued writer when the calling
    /// thread already holds a read lock on this tensor.
    pub(crate) fn read_recursive(&self) -> RwLockReadGuard<'_, Tensor> {
        self.0.read_recursive()
    }

    /// Reports whether both handles refer to the same tensor.
    pub fn same(&self, other: &SharedTensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Tensor> for SharedTensor {
    fn from(tensor: Tensor) -> Self {
        Self::new(tensor)
    }
}
