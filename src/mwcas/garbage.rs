//! A bounded ring of to-be-reclaimed items stamped with removal epochs.
//!
//! The list is owned by one descriptor partition and pushed to only by the
//! partition's owning thread; the tail cursor is still atomic so that an
//! unlikely concurrent scavenge cannot tear it. Each slot is reclaimed (its
//! destroy callback run) either when a later push lands on it and its epoch
//! has become safe, or by an explicit [`GarbageList::scavenge`] sweep.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::error::{QuarryError, Result};
use crate::mwcas::epoch::{Epoch, EpochManager};

/// Reclaims `item`; `context` threads per-list state through.
pub(crate) type DestroyCallback = fn(context: *mut u8, item: *mut u8);

/// Epoch value marking a slot that is being rewritten.
const EPOCH_IN_PROGRESS: Epoch = Epoch::MAX;

#[derive(Clone, Copy)]
struct Payload {
    destroy: Option<DestroyCallback>,
    context: *mut u8,
    item: *mut u8,
}

impl Payload {
    const EMPTY: Payload = Payload {
        destroy: None,
        context: std::ptr::null_mut(),
        item: std::ptr::null_mut(),
    };
}

struct Slot {
    removal_epoch: AtomicU64,
    payload: UnsafeCell<Payload>,
}

/// Power-of-two ring of garbage items bound to an [`EpochManager`].
pub(crate) struct GarbageList {
    epoch: Arc<EpochManager>,
    slots: Box<[Slot]>,
    tail: AtomicU64,
}

// Payload pointers are only dereferenced through the registered callbacks,
// which the single owning thread (or a quiesced recovery pass) runs.
unsafe impl Send for GarbageList {}
unsafe impl Sync for GarbageList {}

impl GarbageList {
    pub fn new(epoch: Arc<EpochManager>, capacity: usize) -> Result<GarbageList> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(QuarryError::InvalidArgument(
                "garbage list capacity must be a nonzero power of two",
            ));
        }
        Ok(GarbageList {
            epoch,
            slots: (0..capacity)
                .map(|_| Slot {
                    removal_epoch: AtomicU64::new(0),
                    payload: UnsafeCell::new(Payload::EMPTY),
                })
                .collect(),
            tail: AtomicU64::new(0),
        })
    }

    pub fn epoch_manager(&self) -> &Arc<EpochManager> {
        &self.epoch
    }

    /// Enqueues `item`, stamped with the current epoch. Every quarter of
    /// the ring the global epoch is bumped so stamps eventually become
    /// reclaimable. If the chosen slot still holds an older item, that item
    /// is reclaimed first (or the push moves on when its epoch is not yet
    /// safe).
    pub fn push(&self, item: *mut u8, destroy: DestroyCallback, context: *mut u8) {
        let removal_epoch = self.epoch.current_epoch();
        let mask = (self.slots.len() - 1) as u64;
        loop {
            let slot_idx = self.tail.fetch_add(1, Ordering::Relaxed) & mask;
            if (slot_idx << 2) & mask == 0 {
                self.epoch.bump_current_epoch();
            }
            let slot = &self.slots[slot_idx as usize];

            let prior = slot.removal_epoch.load(Ordering::Acquire);
            if prior == EPOCH_IN_PROGRESS {
                continue;
            }
            slot.removal_epoch.store(EPOCH_IN_PROGRESS, Ordering::Release);

            if prior != 0 {
                if !self.epoch.is_safe_to_reclaim(prior) {
                    // Not yet reclaimable; put it back and try elsewhere.
                    slot.removal_epoch.store(prior, Ordering::Release);
                    continue;
                }
                Self::destroy(unsafe { *slot.payload.get() });
            }

            unsafe {
                *slot.payload.get() = Payload {
                    destroy: Some(destroy),
                    context,
                    item,
                };
            }
            slot.removal_epoch.store(removal_epoch, Ordering::Release);
            return;
        }
    }

    /// Sweeps the whole ring, reclaiming every item whose epoch is safe.
    /// Returns the number reclaimed.
    pub fn scavenge(&self) -> usize {
        let mut reclaimed = 0;
        for slot in self.slots.iter() {
            let prior = slot.removal_epoch.load(Ordering::Acquire);
            if prior == 0 || prior == EPOCH_IN_PROGRESS {
                continue;
            }
            slot.removal_epoch.store(EPOCH_IN_PROGRESS, Ordering::Release);
            if !self.epoch.is_safe_to_reclaim(prior) {
                slot.removal_epoch.store(prior, Ordering::Release);
                continue;
            }
            Self::destroy(unsafe { *slot.payload.get() });
            unsafe { *slot.payload.get() = Payload::EMPTY };
            slot.removal_epoch.store(0, Ordering::Release);
            reclaimed += 1;
        }
        if reclaimed == 0 {
            warn!("garbage scavenge reclaimed nothing");
        }
        reclaimed
    }

    /// Drops every slot without running callbacks. Used by pool recovery,
    /// which reinitializes the items wholesale itself.
    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.removal_epoch.store(0, Ordering::Release);
            unsafe { *slot.payload.get() = Payload::EMPTY };
        }
        self.tail.store(0, Ordering::Release);
    }

    /// Destroys every remaining item without consulting the epoch. Callers
    /// must have stopped all threads that could touch the items.
    pub fn uninitialize(&self) {
        for slot in self.slots.iter() {
            let prior = slot.removal_epoch.swap(0, Ordering::AcqRel);
            if prior == 0 {
                continue;
            }
            let payload = unsafe { *slot.payload.get() };
            if !payload.item.is_null() {
                Self::destroy(payload);
            }
            unsafe { *slot.payload.get() = Payload::EMPTY };
        }
    }

    fn destroy(payload: Payload) {
        if let Some(destroy) = payload.destroy {
            destroy(payload.context, payload.item);
        }
    }
}
