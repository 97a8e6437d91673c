//! Elementwise arithmetic. Kernels run on the host; results are host tensors
//! and can be moved with [`Tensor::to_device`].

use crate::{Tensor, TensorStorage};
use axonic_core::error::{check_finite, Error, Result};
use std::sync::atomic::Ordering;

impl Tensor {
    fn check_same_shape(&self, rhs: &Tensor, op: &'static str) -> Result<()> {
        if self.shape() != rhs.shape() {
            return Err(Error::computation(
                op,
                vec![self.shape().to_vec(), rhs.shape().to_vec()],
                "operand shapes differ",
            ));
        }
        Ok(())
    }

    fn zip_with<F>(&self, rhs: &Tensor, op: &'static str, func: F) -> Result<Tensor>
    where
        F: Fn(f64, f64) -> f64,
    {
        self.check_same_shape(rhs, op)?;
        let (lhs, rhs) = (self.to_vec()?, rhs.to_vec()?);
        let out: Vec<f64> = lhs.iter().zip(rhs.iter()).map(|(&a, &b)| func(a, b)).collect();
        check_finite(op, &out)?;
        Tensor::from_vec(self.shape(), out)
    }

    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, "add", |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, "sub", |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, "mul", |a, b| a * b)
    }

    pub fn scale(&self, factor: f64) -> Result<Tensor> {
        check_finite("scale", &[factor])?;
        let out: Vec<f64> = self.to_vec()?.into_iter().map(|v| v * factor).collect();
        check_finite("scale", &out)?;
        Tensor::from_vec(self.shape(), out)
    }

    pub fn dot(&self, rhs: &Tensor) -> Result<f64> {
        self.check_same_shape(rhs, "dot")?;
        let (lhs, rhs) = (self.to_vec()?, rhs.to_vec()?);
        let dot = lhs.iter().zip(rhs.iter()).map(|(a, b)| a * b).sum::<f64>();
        check_finite("dot", &[dot])?;
        Ok(dot)
    }

    pub fn sum(&self) -> Result<f64> {
        let sum = self.to_vec()?.iter().sum::<f64>();
        check_finite("sum", &[sum])?;
        Ok(sum)
    }

    /// In-place `self += rhs`. Visible to every clone sharing this storage;
    /// the update is atomic with respect to other writers of that storage.
    pub fn add_assign(&self, rhs: &Tensor) -> Result<()> {
        self.check_same_shape(rhs, "add_assign")?;
        // Read first: `rhs` may share storage with `self`.
        let rhs = rhs.to_vec()?;
        let add = |data: &mut [f64]| data.iter_mut().zip(&rhs).for_each(|(d, r)| *d += r);

        match self.storage.as_ref() {
            TensorStorage::Host(buffer) => {
                let mut data = buffer.write()?;
                let mut summed = data.clone();
                add(summed.as_mut_slice());
                check_finite("add_assign", &summed)?;
                *data = summed;
            },
            TensorStorage::Device(ptr) => ptr.update(add)?,
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_reports_operands() -> Result<()> {
        let a = Tensor::zeros(&[2])?;
        let b = Tensor::zeros(&[3])?;
        match a.add(&b) {
            Err(Error::ComputationError { op, shapes, .. }) => {
                assert_eq!(op, "add");
                assert_eq!(shapes, vec![vec![2], vec![3]]);
            },
            other => panic!("expected computation error, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn overflow_is_corrupt() -> Result<()> {
        let a = Tensor::full(&[1], f64::MAX)?;
        assert!(matches!(a.scale(10.0), Err(Error::CorruptValue { op: "scale", .. })));
        Ok(())
    }
}
