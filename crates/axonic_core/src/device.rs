#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Device {
    CPU,
    GPU(usize),
}

impl Device {
    pub fn name(&self) -> String {
        match self {
            Device::CPU => "CPU".to_string(),
            Device::GPU(id) => format!("GPU Device {}", id),
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::GPU(_))
    }

    /// Slot used for per-device bookkeeping; the host counts as ordinal 0 of its own kind.
    pub fn ordinal(&self) -> usize {
        match self {
            Device::CPU => 0,
            Device::GPU(id) => *id,
        }
    }
}

thread_local! {
    static DEFAULT_DEVICE: std::cell::Cell<Device> = const { std::cell::Cell::new(Device::CPU) };
}

pub fn get_default_device() -> Device {
    DEFAULT_DEVICE.with(|d| d.get())
}

pub fn set_default_device(device: Device) {
    DEFAULT_DEVICE.with(|d| d.set(device));
}
