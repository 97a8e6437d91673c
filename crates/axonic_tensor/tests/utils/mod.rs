use axonic_core::{
    config::Config,
    device::{set_default_device, Device},
};
use axonic_memory::DeviceMemoryPool;

// Helper functions
pub fn setup_pool() -> DeviceMemoryPool {
    let _ = env_logger::builder().is_test(true).try_init();
    set_default_device(Device::CPU);
    DeviceMemoryPool::with_host_allocator(Config::new())
}
