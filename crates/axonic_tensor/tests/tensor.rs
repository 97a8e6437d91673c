mod utils;

use axonic_core::{
    device::{set_default_device, Device},
    error::{Error, Result},
};
use axonic_tensor::Tensor;
use rand::{rngs::StdRng, SeedableRng};
use utils::setup_pool;

#[test]
fn get_and_set() -> Result<()> {
    let x = Tensor::from_vec(&[2, 3], vec![3.0, 4.0, 5.0, 9.0, 7.0, 3.0])?;
    assert_eq!(x.get(&[1, 1])?, 7.0);

    x.set(&[1, 1], 2.0)?;
    assert_eq!(x.to_vec()?, vec![3.0, 4.0, 5.0, 9.0, 2.0, 3.0]);
    assert!(matches!(x.get(&[2, 0]), Err(Error::IndexOutOfBounds { index: 2, size: 2 })));
    assert!(matches!(x.set(&[0, 0], f64::NAN), Err(Error::CorruptValue { .. })));
    Ok(())
}

#[test]
fn mutation_bumps_version_on_every_clone() -> Result<()> {
    let x = Tensor::zeros(&[3])?;
    let shared = x.clone();
    assert_eq!(x.share_count(), 2);

    shared.write_from(&[1.0, 2.0, 3.0])?;
    assert_eq!(x.version(), 1);
    assert_eq!(x.to_vec()?, vec![1.0, 2.0, 3.0]);

    x.add_assign(&Tensor::ones(&[3])?)?;
    assert_eq!(shared.version(), 2);
    assert_eq!(shared.to_vec()?, vec![2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn write_from_checks_length() -> Result<()> {
    let x = Tensor::zeros(&[2])?;
    assert!(matches!(x.write_from(&[1.0]), Err(Error::DimensionMismatch { .. })));
    assert_eq!(x.version(), 0);
    Ok(())
}

#[test]
fn device_round_trip_releases_block() -> Result<()> {
    let pool = setup_pool();
    let gpu = Device::GPU(0);
    let x = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0])?;

    let on_device = x.to_device(&pool, gpu)?;
    assert!(on_device.is_device());
    assert_eq!(on_device.device(), gpu);
    assert_eq!(on_device.get(&[1, 0])?, 3.0);
    on_device.set(&[1, 0], 5.0)?;
    assert_eq!(pool.live_blocks(gpu)?, 1);

    let back = on_device.to_host()?;
    assert_eq!(back.to_vec()?, vec![1.0, 2.0, 5.0, 4.0]);
    assert_eq!(x.get(&[1, 0])?, 3.0);

    drop(on_device);
    assert_eq!(pool.live_blocks(gpu)?, 0);
    assert_eq!(pool.stats(gpu).parked_bytes, 32);
    Ok(())
}

#[test]
fn default_device_placement() -> Result<()> {
    let pool = setup_pool();
    set_default_device(Device::GPU(1));
    let x = Tensor::from_vec_in(&pool, &[2], vec![1.0, 2.0])?;
    set_default_device(Device::CPU);

    assert_eq!(x.device(), Device::GPU(1));
    assert_eq!(x.to_vec()?, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn arithmetic() -> Result<()> {
    let a = Tensor::new(vec![1.0, 2.0, 3.0])?;
    let b = Tensor::new(vec![4.0, 5.0, 6.0])?;

    assert_eq!(a.add(&b)?.to_vec()?, vec![5.0, 7.0, 9.0]);
    assert_eq!(b.sub(&a)?.to_vec()?, vec![3.0, 3.0, 3.0]);
    assert_eq!(a.mul(&b)?.to_vec()?, vec![4.0, 10.0, 18.0]);
    assert_eq!(a.scale(-2.0)?.to_vec()?, vec![-2.0, -4.0, -6.0]);
    assert_eq!(a.dot(&b)?, 32.0);
    assert_eq!(b.sum()?, 15.0);
    Ok(())
}

#[test]
fn randn_is_finite_and_seeded() -> Result<()> {
    let a = Tensor::randn_with_rng(&[4, 4], &mut StdRng::seed_from_u64(7))?;
    let b = Tensor::randn_with_rng(&[4, 4], &mut StdRng::seed_from_u64(7))?;
    assert_eq!(a.to_vec()?, b.to_vec()?);
    assert!(Tensor::randn(&[8])?.to_vec()?.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn concurrent_add_assign_loses_no_updates() -> Result<()> {
    let pool = setup_pool();
    let one = Tensor::ones(&[3])?;
    let host = Tensor::zeros(&[3])?;
    let device = Tensor::zeros(&[3])?.to_device(&pool, Device::GPU(0))?;

    for target in [&host, &device] {
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let (target, one) = (target.clone(), &one);
                scope.spawn(move || {
                    for _ in 0..50 {
                        target.add_assign(one).unwrap();
                    }
                });
            }
        });
        assert_eq!(target.to_vec()?, vec![400.0; 3]);
        assert_eq!(target.version(), 400);
    }
    Ok(())
}

#[test]
fn overflowing_add_assign_leaves_tensor_untouched() -> Result<()> {
    let pool = setup_pool();
    let big = Tensor::full(&[2], f64::MAX)?;
    let host = Tensor::full(&[2], f64::MAX)?;
    let device = host.to_device(&pool, Device::GPU(0))?;

    for target in [&host, &device] {
        let version = target.version();
        assert!(matches!(target.add_assign(&big), Err(Error::CorruptValue { .. })));
        assert_eq!(target.to_vec()?, vec![f64::MAX; 2]);
        assert_eq!(target.version(), version);
    }
    Ok(())
}
