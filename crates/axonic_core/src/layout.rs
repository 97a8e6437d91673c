use crate::error::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl Layout {
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: Self::compute_strides(shape),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
    pub fn dim_size(&self, dim: usize) -> Option<usize> {
        self.shape.get(dim).copied()
    }
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Maps coordinates to the flat buffer index.
    pub fn flat_index(&self, coords: &[usize]) -> Result<usize> {
        if coords.len() != self.ndim() {
            return Err(Error::DimensionMismatch {
                expected: self.shape.clone(),
                got: coords.to_vec(),
            });
        }

        let mut index = 0;
        for ((&c, &dim), &stride) in coords.iter().zip(self.shape.iter()).zip(self.strides.iter()) {
            if c >= dim {
                return Err(Error::IndexOutOfBounds { index: c, size: dim });
            }
            index += c * stride;
        }
        Ok(index)
    }

    /// Inverse of [`flat_index`](Self::flat_index).
    pub fn coords(&self, flat: usize) -> Result<Vec<usize>> {
        let size = self.size();
        if flat >= size {
            return Err(Error::IndexOutOfBounds { index: flat, size });
        }

        let mut rest = flat;
        Ok(self
            .strides
            .iter()
            .map(|&stride| {
                let c = rest / stride;
                rest %= stride;
                c
            })
            .collect())
    }

    // helper

    pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
        if shape.is_empty() {
            return vec![];
        }

        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len() - 1).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    pub fn compute_size(shape: &[usize]) -> usize {
        shape.iter().product()
    }
}
