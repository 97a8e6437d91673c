//! Per-device cache of long-lived weight buffers.
//!
//! Each slot remembers the version of the host weights it was uploaded from.
//! A lookup with a newer version evicts the slot. Every removal path hands the
//! displaced [`DevicePtr`] back to the caller or drops it after the table lock
//! is released, so no reference is ever lost without being released.

use crate::pool::DevicePtr;
use axonic_core::{device::Device, error::Result};
use log::trace;
use std::{collections::HashMap, sync::Mutex};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(pub u64);

struct CacheSlot {
    version: u64,
    ptr: DevicePtr,
}

#[derive(Default)]
pub struct WeightCache {
    slots: Mutex<HashMap<(CacheKey, Device), CacheSlot>>,
}

impl WeightCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new reference to the cached block if it was uploaded from `version`.
    pub fn get(&self, key: CacheKey, device: Device, version: u64) -> Result<Option<DevicePtr>> {
        let stale = {
            let mut slots = self.slots.lock()?;
            match slots.get(&(key, device)).map(|slot| slot.version) {
                Some(current) if current == version => {
                    return match slots.get(&(key, device)) {
                        Some(slot) => slot.ptr.try_clone().map(Some),
                        None => Ok(None),
                    };
                },
                Some(_) => slots.remove(&(key, device)),
                None => None,
            }
        };
        if stale.is_some() {
            trace!("weight cache: {:?} on {} is stale", key, device.name());
        }
        drop(stale);
        Ok(None)
    }

    /// Stores `ptr` unconditionally, releasing whatever it displaces.
    pub fn insert(&self, key: CacheKey, device: Device, version: u64, ptr: DevicePtr) -> Result<()> {
        let displaced = self.slots.lock()?.insert((key, device), CacheSlot { version, ptr });
        drop(displaced);
        Ok(())
    }

    /// Compare-and-swap: installs `ptr` only if the slot currently holds
    /// `expected` (`None` meaning empty). The loser (displaced entry on
    /// success, `ptr` itself on failure) is released.
    pub fn replace(
        &self,
        key: CacheKey,
        device: Device,
        expected: Option<u64>,
        version: u64,
        ptr: DevicePtr,
    ) -> Result<bool> {
        let (installed, loser) = {
            let mut slots = self.slots.lock()?;
            let current = slots.get(&(key, device)).map(|slot| slot.version);
            if current == expected {
                let displaced = slots.insert((key, device), CacheSlot { version, ptr });
                (true, displaced.map(|slot| slot.ptr))
            } else {
                (false, Some(ptr))
            }
        };
        drop(loser);
        Ok(installed)
    }

    /// Removes `key` on every device.
    pub fn evict(&self, key: CacheKey) -> Result<usize> {
        let removed: Vec<CacheSlot> = {
            let mut slots = self.slots.lock()?;
            let keys: Vec<_> = slots.keys().filter(|(k, _)| *k == key).copied().collect();
            keys.iter().filter_map(|k| slots.remove(k)).collect()
        };
        Ok(removed.len())
    }

    /// Removes every entry on `device`, returning the references for the caller to release.
    pub fn evict_device(&self, device: Device) -> Result<Vec<DevicePtr>> {
        let mut slots = self.slots.lock()?;
        let keys: Vec<_> = slots.keys().filter(|(_, d)| *d == device).copied().collect();
        Ok(keys.iter().filter_map(|k| slots.remove(k)).map(|slot| slot.ptr).collect())
    }

    pub fn clear(&self) -> Result<()> {
        let drained: Vec<CacheSlot> = self.slots.lock()?.drain().map(|(_, slot)| slot).collect();
        drop(drained);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
