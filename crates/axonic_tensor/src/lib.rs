mod creation;
mod list;
mod ops;
#[cfg(feature = "serde")]
mod serde;

pub use list::TensorList;

use axonic_core::{
    device::Device,
    error::{check_finite, Error, Result},
    layout::Layout,
};
use axonic_memory::{DeviceMemoryPool, DevicePtr, MemoryKind};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);
static TENSOR_COUNTER: AtomicU64 = AtomicU64::new(1);
#[inline]
pub(crate) fn next_tensor_id() -> TensorId {
    TensorId(TENSOR_COUNTER.fetch_add(1, Ordering::SeqCst))
}

impl TensorId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

pub enum TensorStorage {
    Host(RwLock<Vec<f64>>),
    Device(DevicePtr),
}

/// An n-dimensional buffer of finite `f64` values.
///
/// Cloning shares the underlying storage; the storage (and, for device
/// tensors, the pooled block) is released when the last clone is dropped.
#[derive(Clone)]
pub struct Tensor {
    id: TensorId,
    layout: Layout,
    storage: Arc<TensorStorage>,
    version: Arc<AtomicU64>,
}

impl Tensor {
    pub(crate) fn from_storage(layout: Layout, storage: TensorStorage) -> Self {
        Self {
            id: next_tensor_id(),
            layout,
            storage: Arc::new(storage),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn ndim(&self) -> usize {
        self.layout.ndim()
    }

    pub fn device(&self) -> Device {
        match self.storage.as_ref() {
            TensorStorage::Host(_) => Device::CPU,
            TensorStorage::Device(ptr) => ptr.device(),
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self.storage.as_ref(), TensorStorage::Device(_))
    }

    /// Bumped by every in-place mutation; cached device copies compare against it.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Number of `Tensor` handles sharing this storage.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    pub fn to_vec(&self) -> Result<Vec<f64>> {
        match self.storage.as_ref() {
            TensorStorage::Host(data) => Ok(data.read()?.clone()),
            TensorStorage::Device(ptr) => {
                let mut out = vec![0.0; self.size()];
                ptr.read(0, &mut out)?;
                Ok(out)
            },
        }
    }

    /// Overwrites the whole buffer from a flat array.
    pub fn write_from(&self, data: &[f64]) -> Result<()> {
        if data.len() != self.size() {
            return Err(Error::DimensionMismatch {
                expected: vec![self.size()],
                got: vec![data.len()],
            });
        }
        check_finite("tensor write", data)?;

        match self.storage.as_ref() {
            TensorStorage::Host(buffer) => buffer.write()?.copy_from_slice(data),
            TensorStorage::Device(ptr) => ptr.write(0, data)?,
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn get(&self, coords: &[usize]) -> Result<f64> {
        let index = self.layout.flat_index(coords)?;
        match self.storage.as_ref() {
            TensorStorage::Host(data) => Ok(data.read()?[index]),
            TensorStorage::Device(ptr) => {
                let mut out = [0.0];
                ptr.read(index, &mut out)?;
                Ok(out[0])
            },
        }
    }

    pub fn set(&self, coords: &[usize], value: f64) -> Result<()> {
        let index = self.layout.flat_index(coords)?;
        check_finite("tensor set", &[value])?;
        match self.storage.as_ref() {
            TensorStorage::Host(data) => data.write()?[index] = value,
            TensorStorage::Device(ptr) => ptr.write(index, &[value])?,
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn item(&self) -> Result<f64> {
        if self.size() != 1 {
            return Err(Error::InvalidArgument(format!(
                "item() can only be called on a tensor with a single element, but got tensor with {} elements",
                self.size()
            )));
        }
        Ok(self.to_vec()?[0])
    }

    pub fn to_device(&self, pool: &DeviceMemoryPool, device: Device) -> Result<Tensor> {
        if device == Device::CPU {
            return self.to_host();
        }
        let ptr = pool.allocate_elements(device, self.size(), MemoryKind::Device)?;
        ptr.write(0, &self.to_vec()?)?;
        Ok(Tensor::from_storage(self.layout.clone(), TensorStorage::Device(ptr)))
    }

    pub fn to_host(&self) -> Result<Tensor> {
        Ok(Tensor::from_storage(
            self.layout.clone(),
            TensorStorage::Host(RwLock::new(self.to_vec()?)),
        ))
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("shape", &self.shape())
            .field("device", &self.device())
            .finish()
    }
}
