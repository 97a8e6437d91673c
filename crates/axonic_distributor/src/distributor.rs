use crate::{partition::partition, worker::DeviceWorker};
use axonic_core::{
    config::Config,
    device::Device,
    error::{Error, Result},
};
use axonic_memory::DeviceMemoryPool;
use log::{debug, error, trace, warn};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

/// What a map function knows about the batch it is running.
pub struct DeviceContext<'a> {
    device: Device,
    pool: &'a DeviceMemoryPool,
    batch_index: usize,
    offset: usize,
    attempt: usize,
}

impl DeviceContext<'_> {
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn pool(&self) -> &DeviceMemoryPool {
        self.pool
    }

    /// Index of this batch within the device's share.
    pub fn batch_index(&self) -> usize {
        self.batch_index
    }

    /// Position of the batch's first item within the device's share.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// How many times this batch has already failed with out-of-memory.
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

/// Splits work across devices, one single-threaded executor per device.
///
/// Shares are proportional to each device's smoothed throughput. A device
/// whose batch runs out of memory halves its batch size, collects the pool
/// and retries; batch sizes never grow back within the distributor's lifetime
/// unless [`reset_batch_sizes`](Self::reset_batch_sizes) is called.
pub struct WorkDistributor {
    config: Config,
    pool: Arc<DeviceMemoryPool>,
    workers: Vec<DeviceWorker>,
}

impl WorkDistributor {
    pub fn new(config: Config, pool: Arc<DeviceMemoryPool>, devices: &[Device]) -> Result<Self> {
        let mut seen = HashSet::new();
        if let Some(dup) = devices.iter().find(|d| !seen.insert(**d)) {
            return Err(Error::InvalidDevice(format!("{} listed twice", dup.name())));
        }
        let workers = devices.iter().map(|&d| DeviceWorker::new(d)).collect::<Result<Vec<_>>>()?;
        debug!("work distributor over {} devices", workers.len());

        Ok(Self { config, pool, workers })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &DeviceMemoryPool {
        &self.pool
    }

    pub fn devices(&self) -> Vec<Device> {
        self.workers.iter().map(|w| w.device()).collect()
    }

    fn worker(&self, device: Device) -> Option<&DeviceWorker> {
        self.workers.iter().find(|w| w.device() == device)
    }

    /// Current batch size of `device`; `usize::MAX` until its first out-of-memory.
    pub fn batch_size(&self, device: Device) -> Option<usize> {
        self.worker(device).map(|w| w.batch_size())
    }

    /// Smoothed items per second of `device`, once it has finished a batch.
    pub fn throughput(&self, device: Device) -> Result<Option<f64>> {
        match self.worker(device) {
            Some(worker) => worker.throughput(),
            None => Err(Error::InvalidDevice(device.name())),
        }
    }

    pub fn reset_batch_sizes(&self) {
        self.workers.iter().for_each(|w| w.reset_batch());
    }

    /// Maps `items` over all devices and folds the partial results with `reduce_fn`.
    ///
    /// Returns `Ok(None)` for empty input without submitting anything. Blocks
    /// until every device has finished its share.
    pub fn distribute<I, T, M, R>(&self, items: &[I], map_fn: M, reduce_fn: R) -> Result<Option<T>>
    where
        I: Sync,
        T: Send,
        M: Fn(&DeviceContext<'_>, &[I]) -> Result<T> + Sync,
        R: Fn(T, T) -> T + Sync,
    {
        if items.is_empty() {
            debug!("nothing to distribute");
            return Ok(None);
        }
        if self.workers.is_empty() {
            return Err(Error::InvalidDevice("no devices to distribute over".into()));
        }

        let weights = self
            .workers
            .iter()
            .map(|w| w.throughput().map(|t| t.unwrap_or(0.0)))
            .collect::<Result<Vec<_>>>()?;
        let shares = partition(items.len(), &weights);
        debug!("distributing {} items as {:?}", items.len(), shares);

        let deadline = self.config.timeout.map(|timeout| Instant::now() + timeout);
        let processed = AtomicUsize::new(0);
        let (map_fn, reduce_fn, processed) = (&map_fn, &reduce_fn, &processed);

        let results: Vec<Result<Option<T>>> = std::thread::scope(|scope| {
            let mut start = 0;
            let mut handles = Vec::new();
            for (worker, share) in self.workers.iter().zip(shares) {
                if share == 0 {
                    continue;
                }
                let slice = &items[start..start + share];
                start += share;
                handles.push(scope.spawn(move || {
                    worker.run(|| self.run_share(worker, slice, map_fn, reduce_fn, deadline, processed, items.len()))
                }));
            }
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(Error::Internal {
                            message: "device worker panicked".into(),
                        })
                    })
                })
                .collect()
        });

        let mut combined = None;
        for result in results {
            if let Some(partial) = result? {
                combined = Some(match combined {
                    Some(acc) => reduce_fn(acc, partial),
                    None => partial,
                });
            }
        }
        Ok(combined)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_share<I, T, M, R>(
        &self,
        worker: &DeviceWorker,
        share: &[I],
        map_fn: &M,
        reduce_fn: &R,
        deadline: Option<Instant>,
        processed: &AtomicUsize,
        total: usize,
    ) -> Result<Option<T>>
    where
        M: Fn(&DeviceContext<'_>, &[I]) -> Result<T>,
        R: Fn(T, T) -> T,
    {
        let device = worker.device();
        let mut acc: Option<T> = None;
        let (mut offset, mut batch_index, mut attempt) = (0, 0, 0);

        while offset < share.len() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                let done = processed.load(Ordering::SeqCst);
                warn!("{}: deadline passed after {} of {} items", device.name(), done, total);
                return Err(Error::Timeout { processed: done, total });
            }

            let size = worker.batch_size().min(share.len() - offset);
            let ctx = DeviceContext {
                device,
                pool: &self.pool,
                batch_index,
                offset,
                attempt,
            };
            let started = Instant::now();
            match map_fn(&ctx, &share[offset..offset + size]) {
                Ok(partial) => {
                    let rate = worker.record(size, started.elapsed(), self.config.throughput_smoothing)?;
                    trace!("{}: batch {} of {} items at {:.1} items/s", device.name(), batch_index, size, rate);
                    acc = Some(match acc.take() {
                        Some(prev) => reduce_fn(prev, partial),
                        None => partial,
                    });
                    processed.fetch_add(size, Ordering::SeqCst);
                    offset += size;
                    batch_index += 1;
                    attempt = 0;
                },
                Err(e) if e.is_out_of_memory() => {
                    if size <= 1 {
                        error!("{}: out of memory on a single item at offset {}: {}", device.name(), offset, e);
                        return Err(Error::DeviceTask {
                            device,
                            source: Box::new(e),
                        });
                    }
                    let shrunk = worker.shrink_batch(size / 2);
                    warn!(
                        "{}: out of memory on a batch of {} items, retrying with {}",
                        device.name(),
                        size,
                        shrunk
                    );
                    self.pool.gc(device)?;
                    attempt += 1;
                },
                Err(e) => {
                    error!(
                        "{}: batch {} ({} items at offset {}) failed: {}",
                        device.name(),
                        batch_index,
                        size,
                        offset,
                        e
                    );
                    return Err(Error::DeviceTask {
                        device,
                        source: Box::new(e),
                    });
                },
            }
        }
        Ok(acc)
    }
}
