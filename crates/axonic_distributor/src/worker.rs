use axonic_core::{
    device::Device,
    error::{Error, Result},
};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

/// A device's single-threaded executor plus its adaptive scheduling state.
pub(crate) struct DeviceWorker {
    device: Device,
    executor: ThreadPool,
    batch_size: AtomicUsize,
    throughput: Mutex<Option<f64>>,
}

impl DeviceWorker {
    pub(crate) fn new(device: Device) -> Result<Self> {
        let name = match device {
            Device::CPU => "axonic-cpu".to_string(),
            Device::GPU(id) => format!("axonic-gpu-{}", id),
        };
        let executor = ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(move |_| name.clone())
            .build()
            .map_err(|e| Error::Internal {
                message: format!("failed to start executor for {}: {}", device.name(), e),
            })?;

        Ok(Self {
            device,
            executor,
            batch_size: AtomicUsize::new(usize::MAX),
            throughput: Mutex::new(None),
        })
    }

    pub(crate) fn device(&self) -> Device {
        self.device
    }

    /// Runs `func` on this device's worker thread, after anything queued before it.
    pub(crate) fn run<R, F>(&self, func: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.executor.install(func)
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::SeqCst)
    }

    /// Lowers the batch size to `size`; never raises it.
    pub(crate) fn shrink_batch(&self, size: usize) -> usize {
        let size = size.max(1);
        let previous = self.batch_size.fetch_min(size, Ordering::SeqCst);
        previous.min(size)
    }

    pub(crate) fn reset_batch(&self) {
        self.batch_size.store(usize::MAX, Ordering::SeqCst);
    }

    pub(crate) fn throughput(&self) -> Result<Option<f64>> {
        Ok(*self.throughput.lock()?)
    }

    /// Folds one batch's items-per-second into the moving average.
    pub(crate) fn record(&self, items: usize, elapsed: Duration, smoothing: f64) -> Result<f64> {
        let rate = items as f64 / elapsed.as_secs_f64().max(1e-9);
        let mut throughput = self.throughput.lock()?;
        let updated = match *throughput {
            Some(previous) => smoothing * rate + (1.0 - smoothing) * previous,
            None => rate,
        };
        *throughput = Some(updated);
        Ok(updated)
    }
}
