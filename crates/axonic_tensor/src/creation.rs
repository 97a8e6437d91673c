use crate::{Tensor, TensorStorage};
use axonic_core::{
    device::get_default_device,
    error::{check_finite, Error, Result},
    layout::Layout,
};
use axonic_memory::DeviceMemoryPool;
use rand::{distributions::Distribution, Rng};
use std::sync::RwLock;

impl Tensor {
    /// One-dimensional tensor over `data`.
    pub fn new(data: Vec<f64>) -> Result<Self> {
        let shape = [data.len()];
        Self::from_vec(&shape, data)
    }

    pub fn from_vec(shape: &[usize], data: Vec<f64>) -> Result<Self> {
        let layout = Layout::from_shape(shape);
        if layout.size() != data.len() {
            return Err(Error::DimensionMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        check_finite("tensor creation", &data)?;

        Ok(Self::from_storage(layout, TensorStorage::Host(RwLock::new(data))))
    }

    /// Like [`from_vec`](Self::from_vec), placed on the thread's default device.
    pub fn from_vec_in(pool: &DeviceMemoryPool, shape: &[usize], data: Vec<f64>) -> Result<Self> {
        let host = Self::from_vec(shape, data)?;
        let device = get_default_device();
        if device.is_gpu() {
            host.to_device(pool, device)
        } else {
            Ok(host)
        }
    }

    pub fn scalar(value: f64) -> Result<Self> {
        Self::from_vec(&[], vec![value])
    }

    pub fn zeros(shape: &[usize]) -> Result<Self> {
        Self::full(shape, 0.0)
    }

    pub fn zeros_like(src: &Tensor) -> Result<Self> {
        Self::zeros(src.shape())
    }

    pub fn ones(shape: &[usize]) -> Result<Self> {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: &[usize], value: f64) -> Result<Self> {
        let size = Layout::compute_size(shape);
        Self::from_vec(shape, vec![value; size])
    }

    pub fn randn(shape: &[usize]) -> Result<Self> {
        Self::randn_with_rng(shape, &mut rand::thread_rng())
    }

    pub fn randn_with_rng<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Result<Self> {
        let size = Layout::compute_size(shape);
        let normal = rand_distr::Normal::new(0.0, 1.0).map_err(|_e| Error::Internal {
            message: "Failed to create normal distribution with mean=0.0 and std=1.0".to_string(),
        })?;
        let data: Vec<f64> = (0..size).map(|_| normal.sample(rng)).collect();

        Self::from_vec(shape, data)
    }
}
