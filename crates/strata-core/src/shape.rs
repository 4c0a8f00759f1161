use std::fmt;

use serde::{Deserialize, Serialize};

// Shape — Logical extent of a tensor moving through a pipeline
//
// Dimensions are always listed in canonical logical order, independent of
// how the elements are physically arranged:
//   - Vector:  [x]
//   - Matrix:  [n, c]
//   - Image:   [n, c, h, w]
//
// Dimension 0 is the batch. A stage is reconfigured exactly when its input
// batch size or spatial extent changes, so the batch/spatial accessors here
// are what the reconfiguration check compares.

/// N-dimensional logical shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or(crate::Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Batch size (dimension 0), or 1 for a scalar.
    pub fn batch(&self) -> usize {
        self.0.first().copied().unwrap_or(1)
    }

    /// Channel count (dimension 1), or 1 when the rank is below 2.
    pub fn channels(&self) -> usize {
        self.0.get(1).copied().unwrap_or(1)
    }

    /// Spatial extent `(h, w)` for rank-4 shapes, `(1, 1)` otherwise.
    pub fn spatial(&self) -> (usize, usize) {
        if self.rank() == 4 {
            (self.0[2], self.0[3])
        } else {
            (1, 1)
        }
    }

    /// Number of spatial positions per channel.
    pub fn spatial_size(&self) -> usize {
        let (h, w) = self.spatial();
        h * w
    }

    /// Same shape with a different batch size.
    pub fn with_batch(&self, batch: usize) -> Shape {
        let mut dims = self.0.clone();
        if let Some(first) = dims.first_mut() {
            *first = batch;
        }
        Shape(dims)
    }

    /// Same shape with a different channel count (rank >= 2).
    pub fn with_channels(&self, channels: usize) -> Shape {
        let mut dims = self.0.clone();
        if dims.len() >= 2 {
            dims[1] = channels;
        }
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations
// These let you write: Shape::from((32, 16, 7, 7)) instead of Shape::new(vec![...])

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}
