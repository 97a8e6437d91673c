//! Device buffer allocation, recycling and out-of-memory recovery.
//!
//! Blocks are owned through [`DevicePtr`] handles backed by a per-device
//! refcount [`Arena`]. When the last handle goes away the block is not returned
//! to the allocator: it is parked and handed to the next request of the same
//! size. A collection pass ([`DeviceMemoryPool::gc`]) evicts the weight cache
//! and frees every parked block; it runs on demand and automatically when the
//! allocator reports exhaustion, before a single retry.

use crate::{
    allocator::{DeviceAllocator, DeviceMemory, HostAllocator, MemoryKind, ELEMENT_BYTES},
    cache::WeightCache,
    stats::{DeviceCounters, MemoryStats},
};
use axonic_core::{
    config::Config,
    device::Device,
    error::{check_finite, Error, Result},
    refcount::{Arena, Handle, Released},
};
use dashmap::DashMap;
use log::{debug, error, trace, warn};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

struct Block {
    memory: Box<dyn DeviceMemory>,
    kind: MemoryKind,
    bytes: usize,
    dirty: bool,
}

struct DeviceState {
    blocks: Mutex<Arena<Block>>,
    parked: Mutex<HashMap<(MemoryKind, usize), Vec<Block>>>,
    counters: DeviceCounters,
}

pub(crate) struct PoolInner {
    config: Config,
    allocator: Arc<dyn DeviceAllocator>,
    devices: DashMap<Device, Arc<DeviceState>>,
    transfer_lock: Mutex<()>,
}

impl PoolInner {
    fn state(&self, device: Device) -> Arc<DeviceState> {
        self.devices
            .entry(device)
            .or_insert_with(|| {
                Arc::new(DeviceState {
                    blocks: Mutex::new(Arena::new("device block", self.config.refcount)),
                    parked: Mutex::new(HashMap::new()),
                    counters: DeviceCounters::default(),
                })
            })
            .clone()
    }

    fn add_ref(&self, device: Device, handle: Handle) -> Result<()> {
        self.state(device).blocks.lock()?.add_ref(handle)?;
        Ok(())
    }

    fn release(&self, device: Device, handle: Handle) -> Result<()> {
        let state = self.state(device);
        let released = state.blocks.lock()?.release(handle)?;
        if let Released::Finalized(mut block) = released {
            trace!("parking {} byte block on {}", block.bytes, device.name());
            block.dirty = false;
            state.counters.on_park(block.bytes);
            state.parked.lock()?.entry((block.kind, block.bytes)).or_default().push(block);
        }
        Ok(())
    }

    fn with_block<R, F>(&self, device: Device, handle: Handle, func: F) -> Result<R>
    where
        F: FnOnce(&mut Block, &DeviceCounters) -> Result<R>,
    {
        let _bus = if self.config.serialize_transfers {
            Some(self.transfer_lock.lock()?)
        } else {
            None
        };
        let state = self.state(device);
        let mut blocks = state.blocks.lock()?;
        func(blocks.get_mut(handle)?, &state.counters)
    }

    fn register(self: &Arc<Self>, device: Device, state: &DeviceState, block: Block) -> Result<DevicePtr> {
        let (kind, bytes) = (block.kind, block.bytes);
        let handle = state.blocks.lock()?.insert(block);
        Ok(DevicePtr {
            inner: Arc::clone(self),
            handle,
            device,
            kind,
            bytes,
            released: false,
        })
    }

    fn free_parked(&self, device: Device) -> Result<usize> {
        let state = self.state(device);
        let parked: Vec<Block> = state.parked.lock()?.drain().flat_map(|(_, blocks)| blocks).collect();

        let mut freed = 0;
        for block in parked {
            state.counters.on_unpark(block.bytes);
            state.counters.on_free(block.bytes);
            freed += block.bytes;
            self.allocator.free(device, block.bytes, block.memory);
        }
        Ok(freed)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let devices: Vec<Device> = self.devices.iter().map(|entry| *entry.key()).collect();
        for device in devices {
            if let Err(e) = self.free_parked(device) {
                error!("failed to free parked blocks on {}: {}", device.name(), e);
            }
        }
    }
}

/// Owning handle to a pooled device block.
///
/// Dropping the handle releases one reference; [`try_clone`](Self::try_clone)
/// takes another.
pub struct DevicePtr {
    inner: Arc<PoolInner>,
    handle: Handle,
    device: Device,
    kind: MemoryKind,
    bytes: usize,
    released: bool,
}

impl DevicePtr {
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Capacity in elements.
    pub fn len(&self) -> usize {
        self.bytes / ELEMENT_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_clone(&self) -> Result<Self> {
        self.inner.add_ref(self.device, self.handle)?;
        Ok(Self {
            inner: Arc::clone(&self.inner),
            handle: self.handle,
            device: self.device,
            kind: self.kind,
            bytes: self.bytes,
            released: false,
        })
    }

    /// Releases this reference now, surfacing protocol errors instead of logging them.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.inner.release(self.device, self.handle)
    }

    pub fn is_alive(&self) -> bool {
        let state = self.inner.state(self.device);
        let alive = state.blocks.lock().map(|blocks| blocks.assert_alive(self.handle));
        alive.unwrap_or(false)
    }

    pub fn ref_count(&self) -> Result<usize> {
        self.inner.state(self.device).blocks.lock()?.ref_count(self.handle)
    }

    pub fn write(&self, offset: usize, src: &[f64]) -> Result<()> {
        check_finite("device write", src)?;
        self.inner.with_block(self.device, self.handle, |block, counters| {
            block.memory.write(offset, src)?;
            block.dirty = true;
            counters.on_write(src.len() * ELEMENT_BYTES);
            Ok(())
        })
    }

    pub fn read(&self, offset: usize, dst: &mut [f64]) -> Result<()> {
        self.inner.with_block(self.device, self.handle, |block, counters| {
            block.memory.read(offset, dst)?;
            counters.on_read(dst.len() * ELEMENT_BYTES);
            Ok(())
        })?;
        check_finite("device read", dst)
    }

    /// Read-modify-write of the whole block under the block lock, so
    /// concurrent updates through clones of this pointer are not lost.
    /// Nothing is written if `func` leaves a non-finite value.
    pub fn update<F>(&self, func: F) -> Result<()>
    where
        F: FnOnce(&mut [f64]),
    {
        self.inner.with_block(self.device, self.handle, |block, counters| {
            let mut data = vec![0.0; block.memory.len()];
            block.memory.read(0, &mut data)?;
            func(&mut data);
            check_finite("device update", &data)?;
            block.memory.write(0, &data)?;
            block.dirty = true;
            counters.on_read(data.len() * ELEMENT_BYTES);
            counters.on_write(data.len() * ELEMENT_BYTES);
            Ok(())
        })
    }

    pub fn to_vec(&self) -> Result<Vec<f64>> {
        let mut out = vec![0.0; self.len()];
        self.read(0, &mut out)?;
        Ok(out)
    }

    pub fn is_dirty(&self) -> Result<bool> {
        self.inner.with_block(self.device, self.handle, |block, _| Ok(block.dirty))
    }

    /// Marks pending writes as observed by the device.
    pub fn synchronize(&self) -> Result<()> {
        self.inner.with_block(self.device, self.handle, |block, _| {
            block.dirty = false;
            Ok(())
        })
    }
}

impl Drop for DevicePtr {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.inner.release(self.device, self.handle) {
            error!("failed to release device block #{}: {}", self.handle.id(), e);
        }
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePtr")
            .field("id", &self.handle.id())
            .field("device", &self.device)
            .field("kind", &self.kind)
            .field("bytes", &self.bytes)
            .finish()
    }
}

pub struct DeviceMemoryPool {
    inner: Arc<PoolInner>,
    cache: WeightCache,
}

impl DeviceMemoryPool {
    pub fn new(config: Config, allocator: Arc<dyn DeviceAllocator>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                allocator,
                devices: DashMap::new(),
                transfer_lock: Mutex::new(()),
            }),
            cache: WeightCache::new(),
        }
    }

    pub fn with_host_allocator(config: Config) -> Self {
        Self::new(config, Arc::new(HostAllocator::new()))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cache(&self) -> &WeightCache {
        &self.cache
    }

    pub fn allocate(&self, device: Device, bytes: usize, kind: MemoryKind) -> Result<DevicePtr> {
        let ceiling = self.inner.config.max_allocation_bytes;
        if bytes > ceiling {
            return Err(Error::AllocationTooLarge {
                device,
                requested: bytes,
                ceiling,
            });
        }

        let state = self.inner.state(device);
        let recycled = state.parked.lock()?.get_mut(&(kind, bytes)).and_then(|blocks| blocks.pop());
        if let Some(block) = recycled {
            trace!("reusing parked {} byte block on {}", bytes, device.name());
            state.counters.on_unpark(bytes);
            return self.inner.register(device, &state, block);
        }

        let memory = match self.inner.allocator.allocate(device, bytes, kind) {
            Ok(memory) => memory,
            Err(e) if e.is_out_of_memory() => {
                warn!(
                    "allocation of {} bytes on {} failed, collecting before retry",
                    bytes,
                    device.name()
                );
                self.gc(device)?;
                self.inner.allocator.allocate(device, bytes, kind).map_err(|e| {
                    if e.is_out_of_memory() {
                        Error::OutOfMemory {
                            device,
                            requested: bytes,
                        }
                    } else {
                        e
                    }
                })?
            },
            Err(e) => return Err(e),
        };

        state.counters.on_allocate(bytes);
        let block = Block {
            memory,
            kind,
            bytes,
            dirty: false,
        };
        self.inner.register(device, &state, block)
    }

    pub fn allocate_elements(&self, device: Device, len: usize, kind: MemoryKind) -> Result<DevicePtr> {
        let bytes = len
            .checked_mul(ELEMENT_BYTES)
            .ok_or_else(|| Error::InvalidArgument("Overflow in allocation".into()))?;
        self.allocate(device, bytes, kind)
    }

    pub fn write(&self, ptr: &DevicePtr, offset: usize, src: &[f64]) -> Result<()> {
        ptr.write(offset, src)
    }

    pub fn read(&self, ptr: &DevicePtr, offset: usize, dst: &mut [f64]) -> Result<()> {
        ptr.read(offset, dst)
    }

    /// Evicts cached weights on `device`, then frees every parked block there.
    /// Returns the number of bytes handed back to the allocator.
    pub fn gc(&self, device: Device) -> Result<usize> {
        let evicted = self.cache.evict_device(device)?;
        let evicted_count = evicted.len();
        drop(evicted);

        let freed = self.inner.free_parked(device)?;
        self.inner.state(device).counters.on_gc();
        debug!(
            "gc on {}: evicted {} cached weights, freed {} bytes",
            device.name(),
            evicted_count,
            freed
        );
        Ok(freed)
    }

    pub fn gc_all(&self) -> Result<usize> {
        let mut freed = 0;
        for device in self.devices() {
            freed += self.gc(device)?;
        }
        Ok(freed)
    }

    pub fn stats(&self, device: Device) -> MemoryStats {
        self.inner.state(device).counters.snapshot(device)
    }

    /// Devices that have seen at least one allocation.
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.inner.devices.iter().map(|entry| *entry.key()).collect();
        devices.sort();
        devices
    }

    pub fn live_blocks(&self, device: Device) -> Result<usize> {
        Ok(self.inner.state(device).blocks.lock()?.live_count())
    }
}
