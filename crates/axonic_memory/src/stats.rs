use axonic_core::device::Device;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time view of one device's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub device: Device,
    pub used_bytes: usize,
    pub peak_bytes: usize,
    pub parked_bytes: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub allocations: u64,
    pub gc_passes: u64,
}

// Lock-free so readers never block allocation.
#[derive(Default)]
pub(crate) struct DeviceCounters {
    used: AtomicUsize,
    peak: AtomicUsize,
    parked: AtomicUsize,
    read: AtomicU64,
    written: AtomicU64,
    allocations: AtomicU64,
    gc_passes: AtomicU64,
}

impl DeviceCounters {
    pub(crate) fn on_allocate(&self, bytes: usize) {
        let used = self.used.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(used, Ordering::SeqCst);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_free(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub(crate) fn on_park(&self, bytes: usize) {
        self.parked.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn on_unpark(&self, bytes: usize) {
        self.parked.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub(crate) fn on_read(&self, bytes: usize) {
        self.read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_write(&self, bytes: usize) {
        self.written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_gc(&self) {
        self.gc_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, device: Device) -> MemoryStats {
        MemoryStats {
            device,
            used_bytes: self.used.load(Ordering::SeqCst),
            peak_bytes: self.peak.load(Ordering::SeqCst),
            parked_bytes: self.parked.load(Ordering::SeqCst),
            bytes_read: self.read.load(Ordering::Relaxed),
            bytes_written: self.written.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            gc_passes: self.gc_passes.load(Ordering::Relaxed),
        }
    }
}
