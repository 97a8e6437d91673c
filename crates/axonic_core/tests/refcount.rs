use axonic_core::{
    config::RefcountPolicy,
    error::{Error, Result},
    refcount::{Arena, Handle, Released},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

// Payload whose drop is the observable finalizer.
struct Tracked {
    finalized: Arc<AtomicUsize>,
    children: Vec<Handle>,
}

impl Tracked {
    fn new(finalized: &Arc<AtomicUsize>) -> Self {
        Self {
            finalized: Arc::clone(finalized),
            children: vec![],
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn random_interleavings_finalize_exactly_once() -> Result<()> {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..200 {
        let mut arena = Arena::new("tracked", RefcountPolicy::Strict);
        let finalized = Arc::new(AtomicUsize::new(0));
        let handle = arena.insert(Tracked::new(&finalized));

        let mut add_refs = 0usize;
        let mut releases = 0usize;
        let mut outstanding = 1usize;

        while outstanding > 0 {
            if rng.gen_bool(0.45) {
                arena.add_ref(handle)?;
                add_refs += 1;
                outstanding += 1;
            } else {
                let released = arena.release(handle)?;
                releases += 1;
                outstanding -= 1;

                if outstanding == 0 {
                    assert!(released.is_finalized());
                    drop(released);
                } else {
                    assert!(matches!(released, Released::Retained(n) if n == outstanding));
                    assert_eq!(finalized.load(Ordering::SeqCst), 0);
                }
            }
        }

        assert_eq!(releases, add_refs + 1);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert!(!arena.assert_alive(handle));
        assert!(matches!(arena.add_ref(handle), Err(Error::UseAfterFree { .. })));
        assert!(matches!(arena.release(handle), Err(Error::DoubleFree { .. })));
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    Ok(())
}

#[test]
fn many_resources_interleaved() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut arena = Arena::new("tracked", RefcountPolicy::Strict);
    let finalized = Arc::new(AtomicUsize::new(0));

    let mut owners: Vec<(Handle, usize)> = (0..32).map(|_| (arena.insert(Tracked::new(&finalized)), 1)).collect();

    while !owners.is_empty() {
        let pick = rng.gen_range(0..owners.len());
        let (handle, count) = owners[pick];
        if rng.gen_bool(0.3) {
            arena.add_ref(handle)?;
            owners[pick].1 = count + 1;
        } else {
            arena.release(handle)?;
            if count == 1 {
                owners.swap_remove(pick);
            } else {
                owners[pick].1 = count - 1;
            }
        }
        // New resources reuse finalized slots while old handles stay dead.
        if rng.gen_bool(0.05) {
            owners.push((arena.insert(Tracked::new(&finalized)), 1));
        }
    }

    assert_eq!(arena.live_count(), 0);
    assert_eq!(finalized.load(Ordering::SeqCst) as u64, arena.finalized_count());
    Ok(())
}

#[test]
fn cascade_releases_shared_children_once() -> Result<()> {
    let mut arena = Arena::new("tracked", RefcountPolicy::Strict);
    let finalized = Arc::new(AtomicUsize::new(0));

    let child = arena.insert(Tracked::new(&finalized));
    arena.add_ref(child)?;

    let mut left = Tracked::new(&finalized);
    left.children.push(child);
    let mut right = Tracked::new(&finalized);
    right.children.push(child);
    let left = arena.insert(left);
    let right = arena.insert(right);

    let dropped = arena.release_cascade(left, |t: &Tracked| t.children.clone())?;
    assert_eq!(dropped.len(), 1);
    assert!(arena.assert_alive(child));
    drop(dropped);

    let dropped = arena.release_cascade(right, |t: &Tracked| t.children.clone())?;
    assert_eq!(dropped.len(), 2);
    drop(dropped);

    assert!(!arena.assert_alive(child));
    assert_eq!(finalized.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn lenient_policy_logs_and_ignores() -> Result<()> {
    init_logger();
    let mut arena = Arena::new("tracked", RefcountPolicy::Lenient);
    let h = arena.insert(1u8);
    assert!(arena.release(h)?.is_finalized());

    assert!(matches!(arena.release(h)?, Released::Ignored));
    assert!(arena.add_ref(h).is_ok());
    // Accessors never pretend a finalized resource exists.
    assert!(arena.get(h).is_err());
    assert_eq!(arena.finalized_count(), 1);
    Ok(())
}

#[test]
fn drain_finalizes_everything() {
    let mut arena = Arena::new("tracked", RefcountPolicy::Strict);
    let finalized = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4).map(|_| arena.insert(Tracked::new(&finalized))).collect();
    let _ = arena.add_ref(handles[0]);

    drop(arena.drain());
    assert_eq!(finalized.load(Ordering::SeqCst), 4);
    assert!(handles.iter().all(|h| !arena.assert_alive(*h)));
}
