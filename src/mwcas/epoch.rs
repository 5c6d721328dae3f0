//! Epoch-based protection for lock-free memory reclamation.
//!
//! Threads bracket their accesses with [`EpochManager::protect`] and
//! [`EpochManager::unprotect`]. An object unlinked at epoch `e` may be
//! reclaimed only once every thread's protected epoch has moved past `e`.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::{QuarryError, Result};

/// Logical timestamp bounding reclamation.
pub type Epoch = u64;

const DEFAULT_TABLE_SIZE: usize = 128;

/// One thread's protection record. Entries are claimed with a CAS on
/// `thread_id` and kept for the life of the manager.
struct Entry {
    /// Epoch snapshot taken at `protect`; zero while unprotected.
    protected_epoch: AtomicU64,
    /// Rough epoch of the last `unprotect`, kept for diagnostics.
    last_unprotected_epoch: AtomicU64,
    /// Owning thread's key; zero marks a free entry.
    thread_id: AtomicU64,
}

impl Entry {
    fn new() -> Entry {
        Entry {
            protected_epoch: AtomicU64::new(0),
            last_unprotected_epoch: AtomicU64::new(0),
            thread_id: AtomicU64::new(0),
        }
    }
}

/// Tracks the current epoch, the safe-to-reclaim epoch, and which threads
/// are inside the protected region.
pub struct EpochManager {
    current_epoch: CachePadded<AtomicU64>,
    safe_to_reclaim: CachePadded<AtomicU64>,
    entries: Box<[CachePadded<Entry>]>,
}

impl EpochManager {
    /// Creates a manager able to track `table_size` distinct threads.
    pub fn with_capacity(table_size: usize) -> Result<EpochManager> {
        if !table_size.is_power_of_two() {
            return Err(QuarryError::InvalidArgument(
                "epoch table size must be a power of two",
            ));
        }
        Ok(EpochManager {
            current_epoch: CachePadded::new(AtomicU64::new(1)),
            safe_to_reclaim: CachePadded::new(AtomicU64::new(0)),
            entries: (0..table_size)
                .map(|_| CachePadded::new(Entry::new()))
                .collect(),
        })
    }

    pub fn new() -> EpochManager {
        Self::with_capacity(DEFAULT_TABLE_SIZE).expect("default table size is a power of two")
    }

    /// Snapshot of the global epoch.
    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch.load(Ordering::SeqCst)
    }

    /// True when an item removed at `epoch` can no longer be observed by
    /// any thread.
    pub fn is_safe_to_reclaim(&self, epoch: Epoch) -> bool {
        epoch <= self.safe_to_reclaim.load(Ordering::Relaxed)
    }

    /// Enters the protected region. Must not be called while already
    /// protected.
    ///
    /// # Panics
    ///
    /// Panics when more distinct threads than the table size ever call
    /// `protect`; sizing the table is a configuration decision.
    pub fn protect(&self) {
        let entry = self.entry_for_thread();
        entry.last_unprotected_epoch.store(0, Ordering::Relaxed);
        entry
            .protected_epoch
            .store(self.current_epoch.load(Ordering::SeqCst), Ordering::Release);
        std::sync::atomic::fence(Ordering::Acquire);
    }

    /// Leaves the protected region. No pointers into protected structures
    /// may be retained past this call.
    pub fn unprotect(&self) {
        let entry = self.entry_for_thread();
        entry
            .last_unprotected_epoch
            .store(self.current_epoch.load(Ordering::Relaxed), Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Release);
        entry.protected_epoch.store(0, Ordering::Relaxed);
    }

    /// True when the calling thread is inside the protected region.
    pub fn is_protected(&self) -> bool {
        self.entry_for_thread().protected_epoch.load(Ordering::Relaxed) != 0
    }

    /// Advances the global epoch and recomputes the safe-to-reclaim bound.
    pub fn bump_current_epoch(&self) {
        let bumped = self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.compute_safe_to_reclaim(bumped);
    }

    /// The safe bound is one before the oldest protected epoch (or the
    /// current epoch when nobody is protected): an item removed in some
    /// epoch is never reclaimed within that same epoch.
    fn compute_safe_to_reclaim(&self, current: Epoch) {
        let mut oldest = current;
        for entry in self.entries.iter() {
            let protected = entry.protected_epoch.load(Ordering::Acquire);
            if protected != 0 && protected < oldest {
                oldest = protected;
            }
        }
        self.safe_to_reclaim.store(oldest - 1, Ordering::Release);
    }

    /// Finds (or claims) the calling thread's entry. Claims always happen
    /// at the first free slot along the probe sequence, so lookups find
    /// the entry before any free slot.
    fn entry_for_thread(&self) -> &Entry {
        let id = thread_key();
        let mask = self.entries.len() - 1;
        let start = hash_key(id) as usize;
        for i in 0..self.entries.len() {
            let entry = &*self.entries[(start + i) & mask];
            let owner = entry.thread_id.load(Ordering::Relaxed);
            if owner == id {
                return entry;
            }
            if owner == 0
                && entry
                    .thread_id
                    .compare_exchange(0, id, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                return entry;
            }
            // Occupied by another thread; keep probing.
        }
        panic!("epoch table exhausted: raise the epoch table size");
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Protects on construction, unprotects on drop.
pub struct EpochGuard<'a> {
    manager: &'a EpochManager,
    unprotect_on_drop: bool,
}

impl<'a> EpochGuard<'a> {
    pub fn new(manager: &'a EpochManager) -> EpochGuard<'a> {
        manager.protect();
        EpochGuard {
            manager,
            unprotect_on_drop: true,
        }
    }

    /// Attaches to an existing protection without re-entering: the guard
    /// becomes a no-op.
    pub fn attach(manager: &'a EpochManager) -> EpochGuard<'a> {
        EpochGuard {
            manager,
            unprotect_on_drop: false,
        }
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        if self.unprotect_on_drop {
            self.manager.unprotect();
        }
    }
}

/// Nonzero key for the calling thread.
fn thread_key() -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() | 1
}

fn hash_key(mut h: u64) -> u64 {
    // Fibonacci-style mix so consecutive keys spread across the table.
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn protect_blocks_reclamation_until_unprotect() {
        let epoch = EpochManager::new();
        epoch.protect();
        let removal = epoch.current_epoch();
        epoch.bump_current_epoch();
        assert!(!epoch.is_safe_to_reclaim(removal));
        epoch.unprotect();
        epoch.bump_current_epoch();
        assert!(epoch.is_safe_to_reclaim(removal));
    }

    #[test]
    fn unprotected_threads_do_not_hold_back_the_bound() {
        let epoch = EpochManager::new();
        let removal = epoch.current_epoch();
        epoch.bump_current_epoch();
        assert!(epoch.is_safe_to_reclaim(removal));
    }

    #[test]
    fn is_protected_tracks_bracketing() {
        let epoch = EpochManager::new();
        assert!(!epoch.is_protected());
        epoch.protect();
        assert!(epoch.is_protected());
        epoch.unprotect();
        assert!(!epoch.is_protected());
    }

    #[test]
    fn other_threads_pin_the_safe_epoch() {
        let epoch = Arc::new(EpochManager::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let worker = {
            let epoch = Arc::clone(&epoch);
            std::thread::spawn(move || {
                epoch.protect();
                entered_tx.send(epoch.current_epoch()).unwrap();
                release_rx.recv().unwrap();
                epoch.unprotect();
            })
        };
        let protected_at = entered_rx.recv().unwrap();
        epoch.bump_current_epoch();
        epoch.bump_current_epoch();
        assert!(!epoch.is_safe_to_reclaim(protected_at));
        release_tx.send(()).unwrap();
        worker.join().unwrap();
        epoch.bump_current_epoch();
        assert!(epoch.is_safe_to_reclaim(protected_at));
    }

    #[test]
    fn rejects_non_power_of_two_tables() {
        assert!(EpochManager::with_capacity(100).is_err());
    }
}
