use axonic_core::{
    device::Device,
    error::{Error, Result},
};
use dashmap::DashMap;
use log::trace;

/// Size of one stored element.
pub const ELEMENT_BYTES: usize = std::mem::size_of::<f64>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Visible to the device only.
    Device,
    /// Host-visible ("managed") memory.
    Managed,
}

/// A raw block handed out by a [`DeviceAllocator`].
pub trait DeviceMemory: Send + Sync {
    /// Length in elements.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&mut self, offset: usize, src: &[f64]) -> Result<()>;
    fn read(&self, offset: usize, dst: &mut [f64]) -> Result<()>;
}

/// Seam to the vendor allocation API.
pub trait DeviceAllocator: Send + Sync {
    /// Fails with `Error::OutOfMemory` when the device cannot satisfy the request.
    fn allocate(&self, device: Device, bytes: usize, kind: MemoryKind) -> Result<Box<dyn DeviceMemory>>;
    fn free(&self, device: Device, bytes: usize, memory: Box<dyn DeviceMemory>);
    fn capacity(&self, _device: Device) -> Option<usize> {
        None
    }
}

pub struct HostMemory {
    data: Vec<f64>,
}

impl HostMemory {
    pub fn new(len: usize) -> Self {
        Self { data: vec![0.0; len] }
    }

    fn check_range(&self, offset: usize, count: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(count) {
            Some(end) if end <= self.data.len() => Ok(offset..end),
            _ => Err(Error::InvalidArgument(format!(
                "range of {} elements at offset {} exceeds block of {} elements",
                count,
                offset,
                self.data.len()
            ))),
        }
    }
}

impl DeviceMemory for HostMemory {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn write(&mut self, offset: usize, src: &[f64]) -> Result<()> {
        let range = self.check_range(offset, src.len())?;
        self.data[range].copy_from_slice(src);
        Ok(())
    }

    fn read(&self, offset: usize, dst: &mut [f64]) -> Result<()> {
        let range = self.check_range(offset, dst.len())?;
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }
}

/// Host-memory backed allocator with an optional per-device byte capacity,
/// so device exhaustion can be reproduced without hardware.
#[derive(Default)]
pub struct HostAllocator {
    capacity: Option<usize>,
    in_use: DashMap<Device, usize>,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            in_use: DashMap::new(),
        }
    }

    pub fn in_use(&self, device: Device) -> usize {
        self.in_use.get(&device).map(|v| *v.value()).unwrap_or(0)
    }
}

impl DeviceAllocator for HostAllocator {
    fn allocate(&self, device: Device, bytes: usize, _kind: MemoryKind) -> Result<Box<dyn DeviceMemory>> {
        {
            let mut used = self.in_use.entry(device).or_insert(0);
            if let Some(capacity) = self.capacity {
                if *used + bytes > capacity {
                    return Err(Error::OutOfMemory {
                        device,
                        requested: bytes,
                    });
                }
            }
            *used += bytes;
        }

        trace!("host allocator: {} bytes on {}", bytes, device.name());
        Ok(Box::new(HostMemory::new(bytes.div_ceil(ELEMENT_BYTES))))
    }

    fn free(&self, device: Device, bytes: usize, memory: Box<dyn DeviceMemory>) {
        drop(memory);
        if let Some(mut used) = self.in_use.get_mut(&device) {
            *used = used.saturating_sub(bytes);
        }
    }

    fn capacity(&self, _device: Device) -> Option<usize> {
        self.capacity
    }
}
