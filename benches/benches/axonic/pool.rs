use axonic_core::{config::Config, device::Device};
use axonic_memory::{DeviceMemoryPool, MemoryKind};
use criterion::{black_box, Criterion};

// Constants for benchmark data sizes
const SIZES: [(usize, &str); 3] = [(16, "small"), (4096, "medium"), (1 << 16, "large")];

pub fn allocate(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("pool/allocate");
    group.warm_up_time(core::time::Duration::from_millis(500));
    group.measurement_time(core::time::Duration::from_secs(3));
    group.sample_size(50);

    let device = Device::GPU(0);
    for (size, label) in SIZES {
        // Parked blocks are handed straight back on the next request.
        let pool = DeviceMemoryPool::with_host_allocator(Config::new());
        group.bench_function(format!("recycled/{}", label), |b| {
            b.iter(|| black_box(pool.allocate_elements(device, size, MemoryKind::Device).unwrap()))
        });

        // A collection after each release forces a fresh allocation.
        let pool = DeviceMemoryPool::with_host_allocator(Config::new());
        group.bench_function(format!("fresh/{}", label), |b| {
            b.iter(|| {
                drop(black_box(pool.allocate_elements(device, size, MemoryKind::Device).unwrap()));
                pool.gc(device).unwrap()
            })
        });
    }

    group.finish();
}
