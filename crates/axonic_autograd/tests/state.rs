mod utils;

use axonic_autograd::{DeltaSet, Parameter, StateSet};
use axonic_core::{config::Config, device::Device, error::Result};
use axonic_memory::DeviceMemoryPool;
use utils::tensor;

#[test]
fn backup_apply_restore() -> Result<()> {
    let w = Parameter::new("w", tensor(&[1.0, 2.0])?);
    let b = Parameter::new("b", tensor(&[0.5])?);
    let mut states = StateSet::new(&[w.clone(), b.clone()])?;

    let deltas = DeltaSet::new();
    deltas.add_in_place(w.id(), w.shape(), &[1.0, -1.0])?;

    states.backup()?;
    assert_eq!(states.apply(&deltas, -0.5)?, 1);
    assert_eq!(w.weights().to_vec()?, vec![0.5, 2.5]);
    assert_eq!(b.weights().to_vec()?, vec![0.5]);

    states.restore()?;
    assert_eq!(w.weights().to_vec()?, vec![1.0, 2.0]);

    // A new backup point moves the rollback target.
    states.apply(&deltas, 1.0)?;
    states.backup()?;
    states.apply(&deltas, 1.0)?;
    states.restore()?;
    assert_eq!(w.weights().to_vec()?, vec![2.0, 1.0]);
    assert_eq!(states.get(w.id()).map(|s| s.scratch().to_vec()), Some(vec![2.0, 1.0]));
    Ok(())
}

#[test]
fn frozen_parameters_are_not_stepped() -> Result<()> {
    let w = Parameter::new("w", tensor(&[1.0])?);
    let states = StateSet::new(&[w.clone()])?;
    let deltas = DeltaSet::new();
    deltas.add_in_place(w.id(), w.shape(), &[1.0])?;

    w.freeze();
    assert_eq!(states.apply(&deltas, 1.0)?, 0);
    assert_eq!(w.weights().to_vec()?, vec![1.0]);
    Ok(())
}

#[test]
fn device_weights_follow_the_host_version() -> Result<()> {
    let pool = DeviceMemoryPool::with_host_allocator(Config::new());
    let gpu = Device::GPU(0);
    let w = Parameter::new("w", tensor(&[1.0, 2.0])?);

    let first = w.device_weights(&pool, gpu)?;
    let second = w.device_weights(&pool, gpu)?;
    assert_eq!(first.id(), second.id());
    assert_eq!(pool.cache().len(), 1);
    assert_eq!(pool.stats(gpu).allocations, 1);
    drop((first, second));

    w.weights().write_from(&[3.0, 4.0])?;
    let third = w.device_weights(&pool, gpu)?;
    assert_eq!(third.to_vec()?, vec![3.0, 4.0]);
    assert_eq!(pool.cache().len(), 1);
    // The stale copy was evicted and its block recycled for the new upload.
    assert_eq!(pool.stats(gpu).allocations, 1);
    Ok(())
}
