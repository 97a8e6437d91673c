//! Generation-tagged arena implementing the once-only finalization contract.
//!
//! Every resource lives in a slot with a reference count that starts at 1.
//! A [`Handle`] names a slot *and* the generation it was issued for, so a
//! handle kept after its resource was finalized can never alias whatever
//! reuses the slot later: the arena reports `UseAfterFree` / `DoubleFree`
//! instead.
//!
//! The finalizer is the hand-off of the payload: [`Arena::release`] returns
//! the payload exactly once, when the count reaches zero, and the caller
//! drops or recycles it.

use crate::{
    config::RefcountPolicy,
    error::{Error, Result},
};
use log::{error, trace};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

impl Handle {
    /// Opaque identity, unique for the lifetime of the arena.
    pub fn id(&self) -> u64 {
        (self.generation << 32) | self.index as u64
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Outcome of a [`Arena::release`] call.
#[derive(Debug)]
pub enum Released<T> {
    /// Other owners remain.
    Retained(usize),
    /// This was the last owner; the payload is handed out for finalization.
    Finalized(T),
    /// A lenient-mode protocol violation was logged and ignored.
    Ignored,
}

impl<T> Released<T> {
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized(_))
    }

    pub fn into_payload(self) -> Option<T> {
        match self {
            Self::Finalized(payload) => Some(payload),
            _ => None,
        }
    }
}

struct Slot<T> {
    generation: u64,
    count: usize,
    payload: Option<T>,
}

pub struct Arena<T> {
    name: &'static str,
    policy: RefcountPolicy,
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
    finalized: u64,
}

impl<T> Arena<T> {
    pub fn new(name: &'static str, policy: RefcountPolicy) -> Self {
        Self {
            name,
            policy,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            finalized: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> RefcountPolicy {
        self.policy
    }

    /// Registers a new resource owned once by the caller.
    pub fn insert(&mut self, payload: T) -> Handle {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.count = 1;
                slot.payload = Some(payload);
                Handle {
                    index,
                    generation: slot.generation,
                }
            },
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    count: 1,
                    payload: Some(payload),
                });
                Handle {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            },
        }
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation && slot.payload.is_some())
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation && slot.payload.is_some())
    }

    fn use_after_free(&self, handle: Handle) -> Error {
        Error::UseAfterFree {
            resource: self.name,
            id: handle.id(),
        }
    }

    pub fn assert_alive(&self, handle: Handle) -> bool {
        self.slot(handle).is_some()
    }

    pub fn add_ref(&mut self, handle: Handle) -> Result<Handle> {
        match self.slot_mut(handle) {
            Some(slot) => {
                slot.count += 1;
                Ok(handle)
            },
            None => {
                let err = self.use_after_free(handle);
                match self.policy {
                    RefcountPolicy::Strict => Err(err),
                    RefcountPolicy::Lenient => {
                        error!("ignoring add_ref: {}", err);
                        Ok(handle)
                    },
                }
            },
        }
    }

    pub fn release(&mut self, handle: Handle) -> Result<Released<T>> {
        let Some(slot) = self.slot_mut(handle) else {
            let err = Error::DoubleFree {
                resource: self.name,
                id: handle.id(),
            };
            return match self.policy {
                RefcountPolicy::Strict => Err(err),
                RefcountPolicy::Lenient => {
                    error!("ignoring release: {}", err);
                    Ok(Released::Ignored)
                },
            };
        };

        slot.count -= 1;
        if slot.count > 0 {
            return Ok(Released::Retained(slot.count));
        }

        let payload = slot.payload.take();
        slot.generation += 1;
        self.free.push(handle.index);
        self.live -= 1;
        self.finalized += 1;
        trace!("{} #{} finalized", self.name, handle.id());

        payload.map(Released::Finalized).ok_or_else(|| Error::Internal {
            message: format!("{} #{} lost its payload", self.name, handle.id()),
        })
    }

    /// Releases `handle` and, when it finalizes, every child handle reported by
    /// `children`, depth first. Each child is released exactly once per
    /// reference reported, so shared children survive until their last parent goes.
    pub fn release_cascade<F>(&mut self, handle: Handle, children: F) -> Result<Vec<T>>
    where
        F: Fn(&T) -> Vec<Handle>,
    {
        let mut finalized = Vec::new();
        let mut pending = vec![handle];
        while let Some(next) = pending.pop() {
            if let Released::Finalized(payload) = self.release(next)? {
                pending.extend(children(&payload));
                finalized.push(payload);
            }
        }
        Ok(finalized)
    }

    pub fn ref_count(&self, handle: Handle) -> Result<usize> {
        self.slot(handle)
            .map(|slot| slot.count)
            .ok_or_else(|| self.use_after_free(handle))
    }

    pub fn get(&self, handle: Handle) -> Result<&T> {
        self.slot(handle)
            .and_then(|slot| slot.payload.as_ref())
            .ok_or_else(|| self.use_after_free(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        let err = self.use_after_free(handle);
        self.slot_mut(handle).and_then(|slot| slot.payload.as_mut()).ok_or(err)
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn finalized_count(&self) -> u64 {
        self.finalized
    }

    /// Finalizes every live resource regardless of its count, for teardown.
    pub fn drain(&mut self) -> Vec<T> {
        let mut payloads = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(payload) = slot.payload.take() {
                slot.count = 0;
                slot.generation += 1;
                self.free.push(index);
                self.finalized += 1;
                payloads.push(payload);
            }
        }
        self.live = 0;
        payloads
    }
}
