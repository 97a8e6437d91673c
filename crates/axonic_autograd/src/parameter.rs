use axonic_core::{device::Device, error::Result};
use axonic_memory::{CacheKey, DeviceMemoryPool, DevicePtr, MemoryKind};
use axonic_tensor::Tensor;
use log::trace;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);
static PARAM_COUNTER: AtomicU64 = AtomicU64::new(1);

impl ParamId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

struct ParameterInner {
    id: ParamId,
    name: String,
    weights: Tensor,
    frozen: AtomicBool,
}

/// A learnable weight buffer. Clones share the weights and the frozen flag.
#[derive(Clone)]
pub struct Parameter {
    inner: Arc<ParameterInner>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, weights: Tensor) -> Self {
        Self {
            inner: Arc::new(ParameterInner {
                id: ParamId(PARAM_COUNTER.fetch_add(1, Ordering::SeqCst)),
                name: name.into(),
                weights,
                frozen: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ParamId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn weights(&self) -> &Tensor {
        &self.inner.weights
    }

    pub fn shape(&self) -> &[usize] {
        self.inner.weights.shape()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::SeqCst)
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.inner.frozen.store(frozen, Ordering::SeqCst);
    }

    pub fn freeze(&self) {
        self.set_frozen(true);
    }

    pub fn unfreeze(&self) {
        self.set_frozen(false);
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey(self.inner.id.as_u64())
    }

    /// Device copy of the weights, served from the pool's weight cache while
    /// the host weights are unchanged.
    pub fn device_weights(&self, pool: &DeviceMemoryPool, device: Device) -> Result<DevicePtr> {
        let key = self.cache_key();
        let version = self.inner.weights.version();
        if let Some(ptr) = pool.cache().get(key, device, version)? {
            return Ok(ptr);
        }

        trace!("uploading {} v{} to {}", self.name(), version, device.name());
        let ptr = pool.allocate_elements(device, self.inner.weights.size(), MemoryKind::Device)?;
        ptr.write(0, &self.inner.weights.to_vec()?)?;
        // Another worker may have filled the slot meanwhile; its copy wins and ours stays private.
        pool.cache().replace(key, device, None, version, ptr.try_clone()?)?;
        Ok(ptr)
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("shape", &self.shape())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
