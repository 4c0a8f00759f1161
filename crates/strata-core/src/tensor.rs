use std::fmt;

use crate::error::{Error, Result};
use crate::layout::LayoutDescriptor;
use crate::memory::{DataHandle, Memory};
use crate::shape::Shape;

// HostTensor — A canonical-layout snapshot handed back to callers
//
// Stage outputs live in whatever layout negotiation settled on. What leaves
// the pipeline is always canonical: the values of the final user view read
// out in logical row-major order.

/// Owned tensor in canonical layout.
#[derive(Clone, PartialEq)]
pub struct HostTensor {
    shape: Shape,
    data: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: impl Into<Shape>, data: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != data.len() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        Ok(HostTensor { shape, data })
    }

    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let data = vec![0.0; shape.elem_count()];
        HostTensor { shape, data }
    }

    /// Snapshot the logical contents of a memory view.
    pub fn from_memory(memory: &Memory) -> Result<Self> {
        let data = memory.read_canonical()?;
        Ok(HostTensor {
            shape: memory.layout().shape(),
            data,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.clone()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Canonical layout descriptor for this tensor's shape.
    pub fn layout(&self) -> Result<LayoutDescriptor> {
        LayoutDescriptor::canonical(self.shape.dims())
    }

    /// Copy into fresh shared storage, ready to feed a pipeline.
    pub fn to_handle(&self) -> DataHandle {
        DataHandle::from_vec(self.data.clone())
    }
}

impl fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostTensor({}, ", self.shape)?;
        if self.data.len() <= 8 {
            write!(f, "{:?})", self.data)
        } else {
            write!(f, "{:?} ...)", &self.data[..8])
        }
    }
}
