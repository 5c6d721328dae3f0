//! Descriptor-based persistent multi-word compare-and-swap.
//!
//! The operation atomically swaps up to [`DESC_CAP`] independent 8-byte
//! words from expected old values to new values, lock-free and with
//! cooperative helping. Control flow is carried in the top three bits of
//! each target word:
//!
//! ```text
//! |-- 63 --|--- 62 ---|-- 61 --|-- 60..0 --|
//! | MwCAS  | CondCAS  | Dirty  |  value    |
//! ```
//!
//! so application values must fit in bits `0..=60` and target words must be
//! 8-byte aligned. Descriptors are installed with a conditional CAS (the
//! RDCSS of Harris et al.): a word first receives a pointer to its
//! `WordDescriptor`, which is promoted to the parent descriptor pointer
//! only while the parent's status is still undecided. The durable variant
//! writes every control value with the dirty bit set, flushes, then clears
//! the bit, so that recovery can always decide whether a value reached the
//! persistence domain.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{QuarryError, Result};
use crate::mwcas::epoch::{EpochGuard, EpochManager};
use crate::mwcas::garbage::GarbageList;
use crate::mwcas::persist;

/// Maximum words per descriptor.
pub const DESC_CAP: usize = 4;

/// Bit 63: the word holds a pointer to an in-flight MwCAS descriptor.
pub const MWCAS_FLAG: u64 = 1 << 63;

/// Bit 62: the word holds a pointer to a word descriptor (CondCAS phase).
pub const CONDCAS_FLAG: u64 = 1 << 62;

/// Bit 61: the word may not have reached the persistence domain yet.
pub const DIRTY_FLAG: u64 = 1 << 61;

/// In old/new value slots, bit 63 marks the value for the free callback.
const RECYCLE_FLAG: u64 = 1 << 63;

const STATUS_FINISHED: u32 = 0;
const STATUS_SUCCEEDED: u32 = 1;
const STATUS_FAILED: u32 = 2;
const STATUS_UNDECIDED: u32 = 3;
const STATUS_DIRTY: u32 = 1 << 31;

const FLAG_DURABLE: u32 = 1;

/// How many distinct threads may use one pool.
const THREAD_SLOTS: usize = 256;

/// Registered free callbacks per pool.
const MAX_FREE_CALLBACKS: usize = 16;

/// Strips the control bits off a target-word value.
pub fn clean_value(value: u64) -> u64 {
    value & !(MWCAS_FLAG | CONDCAS_FLAG | DIRTY_FLAG)
}

/// True when no control bit is set.
pub fn is_clean_value(value: u64) -> bool {
    value & (MWCAS_FLAG | CONDCAS_FLAG | DIRTY_FLAG) == 0
}

/// Policy for handing old/new values to the pool's free callback when the
/// descriptor is reclaimed or recovered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecyclePolicy {
    /// Leave both values alone.
    Never,
    /// Leave runtime reclamation to the allocator's own recovery scan.
    OnRecovery,
    /// Free the old value on success, the new value on failure.
    Always,
    /// Free only the old value, and only on success.
    OldOnSuccess,
    /// Free only the new value, and only on failure.
    NewOnFailure,
}

/// Whether the pool runs the durable (flush-and-dirty-bit) protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Durability {
    Volatile,
    Durable,
}

/// A free callback receives the descriptor slot holding the value to
/// reclaim (bit 63 of the slot is the recycle flag) and should clear it.
pub type FreeCallback = fn(&AtomicU64);

/// Index of a registered free callback.
pub type CallbackIdx = u32;

/// The default callback merely clears the slot.
fn default_free_callback(slot: &AtomicU64) {
    slot.store(0, Ordering::SeqCst);
}

/// Counters reported by [`DescriptorPool::recover`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryStats {
    /// Descriptors found already finished.
    pub finished: u64,
    /// Descriptors rolled back (undecided or failed at the crash).
    pub rolled_back: u64,
    /// Descriptors rolled forward (succeeded at the crash).
    pub rolled_forward: u64,
    /// Individual words restored to their old value.
    pub rolled_back_words: u64,
    /// Individual words advanced to their new value.
    pub rolled_forward_words: u64,
}

/// One target word's before/after images, sized to half a cache line so
/// two words share a line without splitting either.
#[repr(C)]
pub(crate) struct WordDescriptor {
    /// Target address (0 while the slot is unused).
    address: AtomicU64,
    /// Expected value; bit 63 is the recycle flag.
    old_value: AtomicU64,
    /// Replacement value; bit 63 is the recycle flag.
    new_value: AtomicU64,
    /// Address of the owning [`Descriptor`].
    parent: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<WordDescriptor>() == 32);

impl WordDescriptor {
    fn new() -> WordDescriptor {
        WordDescriptor {
            address: AtomicU64::new(0),
            old_value: AtomicU64::new(0),
            new_value: AtomicU64::new(0),
            parent: AtomicU64::new(0),
        }
    }

    fn old_clean(&self) -> u64 {
        self.old_value.load(Ordering::Relaxed) & !RECYCLE_FLAG
    }

    fn new_clean(&self) -> u64 {
        self.new_value.load(Ordering::Relaxed) & !RECYCLE_FLAG
    }

    fn should_recycle_old(&self) -> bool {
        self.old_value.load(Ordering::Relaxed) & RECYCLE_FLAG != 0
    }

    fn should_recycle_new(&self) -> bool {
        self.new_value.load(Ordering::Relaxed) & RECYCLE_FLAG != 0
    }

    fn tag(&self) -> u64 {
        self as *const WordDescriptor as u64 | CONDCAS_FLAG
    }

    /// The target word, rebuilt from the recorded address.
    ///
    /// Safety: `add_entry` captured the address from a live `&AtomicU64`,
    /// and the caller (protocol or recovery) runs while the target is
    /// still live.
    unsafe fn target(&self) -> &AtomicU64 {
        &*(self.address.load(Ordering::Relaxed) as *const AtomicU64)
    }

    fn persist_target(&self) {
        persist::flush(unsafe { self.target() });
    }
}

/// The record of one in-flight multi-word CAS.
///
/// Status transitions `Undecided -> Succeeded | Failed -> Finished` and
/// back to `Undecided` on reuse. The word array starts at a cache-line
/// boundary, as does the descriptor itself.
#[repr(C, align(64))]
pub struct Descriptor {
    status: AtomicU32,
    count: AtomicU32,
    callback_idx: AtomicU32,
    flags: AtomicU32,
    /// Address of the owning partition (stable for the pool's lifetime).
    partition: AtomicU64,
    /// Address of the pool's callback registry.
    callbacks: AtomicU64,
    /// Install order: word indexes sorted by target address.
    order: [AtomicU8; DESC_CAP],
    _pad: [u8; 28],
    words: [WordDescriptor; DESC_CAP],
}

const _: () = assert!(std::mem::size_of::<Descriptor>() == 192);

impl Descriptor {
    fn new() -> Descriptor {
        Descriptor {
            status: AtomicU32::new(STATUS_FINISHED),
            count: AtomicU32::new(0),
            callback_idx: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            partition: AtomicU64::new(0),
            callbacks: AtomicU64::new(0),
            order: std::array::from_fn(|_| AtomicU8::new(0)),
            _pad: [0; 28],
            words: std::array::from_fn(|_| WordDescriptor::new()),
        }
    }

    fn addr(&self) -> u64 {
        self as *const Descriptor as u64
    }

    fn tag(&self) -> u64 {
        self.addr() | MWCAS_FLAG
    }

    fn is_durable(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_DURABLE != 0
    }

    fn stable_status(&self) -> u32 {
        self.status.load(Ordering::SeqCst) & !STATUS_DIRTY
    }

    /// Binds the descriptor to its partition and registry. Called once per
    /// pool (re-)initialization.
    fn bind(&self, partition: u64, callbacks: u64, durable: bool) {
        self.status.store(STATUS_FINISHED, Ordering::SeqCst);
        self.count.store(0, Ordering::SeqCst);
        self.callback_idx.store(0, Ordering::SeqCst);
        self.flags
            .store(if durable { FLAG_DURABLE } else { 0 }, Ordering::SeqCst);
        self.partition.store(partition, Ordering::SeqCst);
        self.callbacks.store(callbacks, Ordering::SeqCst);
        for wd in &self.words {
            wd.address.store(0, Ordering::SeqCst);
            wd.old_value.store(0, Ordering::SeqCst);
            wd.new_value.store(0, Ordering::SeqCst);
            wd.parent.store(self.addr(), Ordering::SeqCst);
        }
    }

    /// Reopens a finished descriptor for a new operation. Persisting the
    /// undecided status first lets recovery undo entries added before a
    /// crash mid-preparation.
    fn initialize(&self, callback_idx: CallbackIdx) {
        debug_assert_eq!(self.stable_status(), STATUS_FINISHED);
        self.count.store(0, Ordering::SeqCst);
        self.callback_idx.store(callback_idx, Ordering::SeqCst);
        self.status.store(STATUS_UNDECIDED, Ordering::SeqCst);
        if self.is_durable() {
            persist::flush(&self.status);
        }
    }

    /// Clears a concluded descriptor before it returns to the free list.
    fn finalize(&self) {
        let status = self.stable_status();
        debug_assert!(status == STATUS_SUCCEEDED || status == STATUS_FAILED);
        self.status.store(STATUS_FINISHED, Ordering::SeqCst);
        let count = self.count.load(Ordering::SeqCst) as usize;
        for wd in &self.words[..count] {
            wd.address.store(0, Ordering::SeqCst);
            wd.old_value.store(0, Ordering::SeqCst);
            wd.new_value.store(0, Ordering::SeqCst);
        }
        if self.is_durable() {
            persist::flush_range(
                self.words.as_ptr() as *const u8,
                std::mem::size_of::<WordDescriptor>() * count,
            );
        }
    }

    /// Records a target word. Entries are installed in address order at
    /// execution time; a duplicate address is rejected because the outcome
    /// of two writes to one word would be ambiguous.
    fn add_entry(&self, addr: u64, old: u64, new: u64, policy: RecyclePolicy) -> Result<usize> {
        if self.stable_status() != STATUS_UNDECIDED {
            return Err(QuarryError::InvalidArgument(
                "descriptor is not open for entries",
            ));
        }
        if addr == 0 || addr % 8 != 0 {
            return Err(QuarryError::InvalidArgument(
                "target word must be 8-byte aligned",
            ));
        }
        if !is_clean_value(old) || !is_clean_value(new) {
            return Err(QuarryError::InvalidArgument(
                "values must leave the top three bits clear",
            ));
        }
        let count = self.count.load(Ordering::Relaxed) as usize;
        if count >= DESC_CAP {
            return Err(QuarryError::DescriptorFull);
        }
        for wd in &self.words[..count] {
            if wd.address.load(Ordering::Relaxed) == addr {
                return Err(QuarryError::DuplicateAddress);
            }
        }
        let mut old = old;
        let mut new = new;
        if matches!(policy, RecyclePolicy::Always | RecyclePolicy::OldOnSuccess) {
            old |= RECYCLE_FLAG;
        }
        if matches!(policy, RecyclePolicy::Always | RecyclePolicy::NewOnFailure) {
            new |= RECYCLE_FLAG;
        }
        let wd = &self.words[count];
        wd.address.store(addr, Ordering::Relaxed);
        wd.old_value.store(old, Ordering::Relaxed);
        wd.new_value.store(new, Ordering::Relaxed);
        self.count.store(count as u32 + 1, Ordering::Release);
        Ok(count)
    }

    fn set_new_value(&self, index: usize, value: u64) {
        debug_assert!(is_clean_value(value));
        let slot = &self.words[index].new_value;
        let recycle = slot.load(Ordering::Relaxed) & RECYCLE_FLAG;
        slot.store(value | recycle, Ordering::Release);
    }

    /// Sorts the install order by target address and persists the entry
    /// array before the descriptor becomes visible on any word. Sorted
    /// installation bounds recursive helping: two operations sharing words
    /// always collide on the lowest shared address first.
    fn prepare(&self) {
        let count = self.count.load(Ordering::Acquire) as usize;
        let mut order: [u8; DESC_CAP] = [0; DESC_CAP];
        for (i, slot) in order.iter_mut().enumerate().take(count) {
            *slot = i as u8;
        }
        order[..count].sort_by_key(|&i| self.words[i as usize].address.load(Ordering::Relaxed));
        for (i, &slot) in order.iter().enumerate().take(count) {
            self.order[i].store(slot, Ordering::Relaxed);
        }
        if self.is_durable() {
            persist::flush_range(
                self as *const Descriptor as *const u8,
                std::mem::size_of::<Descriptor>(),
            );
        }
    }

    /// Reads the status, persisting it first when its dirty bit is set.
    fn read_persist_status(&self) -> u32 {
        let current = self.status.load(Ordering::SeqCst);
        let stable = current & !STATUS_DIRTY;
        if current & STATUS_DIRTY != 0 {
            persist::flush(&self.status);
            let _ = self
                .status
                .compare_exchange(current, stable, Ordering::SeqCst, Ordering::SeqCst);
        }
        stable
    }

    /// The conditional CAS installing this descriptor on word `index`.
    ///
    /// Returns the pre-CAS value of the target: the old value on a
    /// successful install (ours or a helper's), or whatever unexpected
    /// content caused the install to stop.
    fn cond_cas(&self, index: usize) -> u64 {
        let wd = &self.words[index];
        let durable = self.is_durable();
        let target = unsafe { wd.target() };
        let cond_tag = wd.tag();
        let old = wd.old_clean();
        loop {
            match target.compare_exchange(old, cond_tag, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => {
                    complete_cond_cas(wd);
                    return old;
                }
                Err(current) => {
                    if durable && current & DIRTY_FLAG != 0 {
                        persist::flush(target);
                        let _ = target.compare_exchange(
                            current,
                            current & !DIRTY_FLAG,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        );
                        continue;
                    }
                    if current & CONDCAS_FLAG != 0 {
                        // Another operation's install is in flight on this
                        // word; complete it and retry ours.
                        complete_cond_cas(unsafe { word_from_value(current) });
                        continue;
                    }
                    return current;
                }
            }
        }
    }

    /// Runs the operation (or helps one along when `depth > 0`).
    fn execute_internal(&self, depth: u32) -> bool {
        debug_assert_ne!(self.stable_status(), STATUS_FINISHED);
        let durable = self.is_durable();
        if depth == 0 {
            self.prepare();
        }
        let count = self.count.load(Ordering::Acquire) as usize;

        let status_now = if durable {
            self.read_persist_status()
        } else {
            self.stable_status()
        };
        if status_now == STATUS_UNDECIDED {
            // Phase 1: install on every word in address order.
            let mut my_status = STATUS_SUCCEEDED;
            for k in 0..count {
                if my_status != STATUS_SUCCEEDED {
                    break;
                }
                let index = self.order[k].load(Ordering::Relaxed) as usize;
                let wd = &self.words[index];
                if wd.address.load(Ordering::Relaxed) == 0 {
                    continue;
                }
                loop {
                    let rval = self.cond_cas(index);
                    if rval == wd.old_clean() || clean_value(rval) == self.addr() {
                        // Installed by us, or a helper already put our
                        // descriptor there.
                        break;
                    }
                    if rval & MWCAS_FLAG != 0 {
                        let other = unsafe { descriptor_from_value(rval) };
                        other.execute_internal(depth + 1);
                        continue;
                    }
                    my_status = STATUS_FAILED;
                    break;
                }
            }

            // Phase 1.5: decide. Whoever wins this CAS fixes the outcome;
            // the durable variant publishes it dirty, flushes, then clears.
            if durable {
                let _ = self.status.compare_exchange(
                    STATUS_UNDECIDED,
                    my_status | STATUS_DIRTY,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                persist::flush(&self.status);
                self.status.fetch_and(!STATUS_DIRTY, Ordering::SeqCst);
            } else {
                let _ = self.status.compare_exchange(
                    STATUS_UNDECIDED,
                    my_status,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }

        // Phase 2: replace descriptor pointers with the final values.
        let succeeded = self.stable_status() == STATUS_SUCCEEDED;
        let desc_tag = self.tag();
        for k in 0..count {
            let index = self.order[k].load(Ordering::Relaxed) as usize;
            let wd = &self.words[index];
            if wd.address.load(Ordering::Relaxed) == 0 {
                continue;
            }
            let target = unsafe { wd.target() };
            let final_value = if succeeded {
                wd.new_clean()
            } else {
                wd.old_clean()
            };
            if durable {
                let dirty_value = final_value | DIRTY_FLAG;
                let result = target.compare_exchange(
                    desc_tag,
                    dirty_value,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                if result.is_ok() || result == Err(dirty_value) {
                    wd.persist_target();
                    let _ = target.compare_exchange(
                        dirty_value,
                        final_value,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
            } else {
                let _ = target.compare_exchange(
                    desc_tag,
                    final_value,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }

        if depth == 0 {
            self.cleanup()
        } else {
            succeeded
        }
    }

    /// Retires the descriptor: only the owning call (depth 0) pushes it to
    /// the partition garbage list, after which no new helper can reach it
    /// through any target word.
    fn cleanup(&self) -> bool {
        let status = self.status.load(Ordering::SeqCst);
        debug_assert_eq!(status & STATUS_DIRTY, 0);
        let success = status == STATUS_SUCCEEDED;
        self.partition_ref().garbage.push(
            self as *const Descriptor as *mut u8,
            free_descriptor,
            std::ptr::null_mut(),
        );
        success
    }

    /// Abandons an operation that never ran. Legal only while undecided.
    fn abort(&self) {
        debug_assert_eq!(self.stable_status(), STATUS_UNDECIDED);
        self.status.store(STATUS_FAILED, Ordering::SeqCst);
        self.partition_ref().garbage.push(
            self as *const Descriptor as *mut u8,
            free_descriptor,
            std::ptr::null_mut(),
        );
    }

    /// Hands recycled values to the registered free callback, per the
    /// outcome and each word's recycle flags.
    fn deallocate_memory(&self) {
        let status = self.stable_status();
        let callback = self.free_callback();
        let count = self.count.load(Ordering::SeqCst) as usize;
        for wd in &self.words[..count] {
            match status {
                STATUS_SUCCEEDED if wd.should_recycle_old() => callback(&wd.old_value),
                STATUS_FAILED if wd.should_recycle_new() => callback(&wd.new_value),
                _ => {}
            }
        }
    }

    fn free_callback(&self) -> FreeCallback {
        let registry =
            unsafe { &*(self.callbacks.load(Ordering::Relaxed) as *const CallbackRegistry) };
        registry.get(self.callback_idx.load(Ordering::Relaxed))
    }

    fn partition_ref(&self) -> &Partition {
        unsafe { &*(self.partition.load(Ordering::Relaxed) as *const Partition) }
    }
}

/// Promotes (or rolls back) a CondCAS: the word-descriptor tag becomes the
/// parent descriptor tag while the parent is still undecided, and reverts
/// to the old value otherwise.
fn complete_cond_cas(wd: &WordDescriptor) {
    let desc = unsafe { &*(wd.parent.load(Ordering::Relaxed) as *const Descriptor) };
    let durable = desc.is_durable();
    let expected = wd.tag();
    let status = if durable {
        desc.read_persist_status()
    } else {
        desc.stable_status()
    };
    let mut desired = if status == STATUS_UNDECIDED {
        desc.tag()
    } else {
        wd.old_clean()
    };
    let target = unsafe { wd.target() };
    if durable {
        desired |= DIRTY_FLAG;
        let result = target.compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst);
        if result.is_ok() || result == Err(desired) {
            wd.persist_target();
            let _ = target.compare_exchange(
                desired,
                desired & !DIRTY_FLAG,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    } else {
        let _ = target.compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Safety: `value` carries the CondCAS tag over a word-descriptor address
/// inside a live pool, and the caller holds epoch protection.
unsafe fn word_from_value<'a>(value: u64) -> &'a WordDescriptor {
    &*(clean_value(value) as *const WordDescriptor)
}

/// Safety: `value` carries the MwCAS tag over a descriptor address inside
/// a live pool, and the caller holds epoch protection.
unsafe fn descriptor_from_value<'a>(value: u64) -> &'a Descriptor {
    &*(clean_value(value) as *const Descriptor)
}

/// Garbage-list callback returning a retired descriptor to its partition.
fn free_descriptor(_context: *mut u8, item: *mut u8) {
    let desc = unsafe { &*(item as *const Descriptor) };
    desc.deallocate_memory();
    desc.finalize();
    desc.partition_ref().push_free(desc.addr());
}

/// A partition: a free list and garbage list owned by (at most) one thread
/// in steady state.
pub(crate) struct Partition {
    free_list: Mutex<Vec<u64>>,
    garbage: GarbageList,
}

impl Partition {
    fn push_free(&self, addr: u64) {
        self.free_list.lock().push(addr);
    }
}

struct CallbackRegistry {
    slots: [std::sync::atomic::AtomicUsize; MAX_FREE_CALLBACKS],
    len: std::sync::atomic::AtomicUsize,
}

impl CallbackRegistry {
    fn new() -> CallbackRegistry {
        let registry = CallbackRegistry {
            slots: std::array::from_fn(|_| std::sync::atomic::AtomicUsize::new(0)),
            len: std::sync::atomic::AtomicUsize::new(0),
        };
        registry
            .register(default_free_callback)
            .expect("registry starts empty");
        registry
    }

    fn register(&self, callback: FreeCallback) -> Result<CallbackIdx> {
        let idx = self.len.load(Ordering::Acquire);
        if idx >= MAX_FREE_CALLBACKS {
            return Err(QuarryError::InvalidArgument("free callback table is full"));
        }
        self.slots[idx].store(callback as usize, Ordering::Release);
        self.len.store(idx + 1, Ordering::Release);
        Ok(idx as CallbackIdx)
    }

    fn get(&self, idx: CallbackIdx) -> FreeCallback {
        let len = self.len.load(Ordering::Acquire);
        let idx = (idx as usize).min(len.saturating_sub(1));
        let raw = self.slots[idx].load(Ordering::Acquire);
        // Function pointers round-trip through usize on all supported
        // targets; slot 0 is always populated.
        unsafe { std::mem::transmute::<usize, FreeCallback>(raw) }
    }
}

struct ThreadSlot {
    thread_id: AtomicU64,
    partition: AtomicU32,
}

/// Bounded registry binding each OS thread to a partition, round-robin on
/// first use. Owned by the pool; no global thread-local state.
struct ThreadSlots {
    entries: Box<[ThreadSlot]>,
}

impl ThreadSlots {
    fn new() -> ThreadSlots {
        ThreadSlots {
            entries: (0..THREAD_SLOTS)
                .map(|_| ThreadSlot {
                    thread_id: AtomicU64::new(0),
                    partition: AtomicU32::new(0),
                })
                .collect(),
        }
    }

    fn partition_index(&self, assign: impl Fn() -> u32) -> u32 {
        let id = thread_key();
        let mask = self.entries.len() - 1;
        let start = id as usize;
        for i in 0..self.entries.len() {
            let entry = &self.entries[(start + i) & mask];
            let owner = entry.thread_id.load(Ordering::Acquire);
            if owner == id {
                return entry.partition.load(Ordering::Relaxed);
            }
            if owner == 0
                && entry
                    .thread_id
                    .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                let partition = assign();
                entry.partition.store(partition, Ordering::Relaxed);
                return partition;
            }
        }
        panic!("thread registry exhausted: too many threads on one descriptor pool");
    }
}

fn thread_key() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() | 1
}

/// Pool configuration.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorPoolConfig {
    /// Total descriptors; rounded up to a power of two.
    pub pool_size: u32,
    /// Requested partitions; rounded to a power of two, capped at 1024.
    pub partitions: u32,
    /// Volatile or durable protocol.
    pub durability: Durability,
    /// Epoch table capacity (power of two).
    pub epoch_table_size: usize,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1024,
            partitions: 32,
            durability: Durability::Volatile,
            epoch_table_size: 128,
        }
    }
}

/// A partitioned pool of pre-allocated descriptors with an epoch manager
/// governing reuse.
pub struct DescriptorPool {
    descriptors: Box<[Descriptor]>,
    partitions: Box<[Partition]>,
    registry: Box<CallbackRegistry>,
    epoch: Arc<EpochManager>,
    thread_slots: ThreadSlots,
    next_partition: CachePadded<AtomicU32>,
    durability: Durability,
    desc_per_partition: u32,
}

impl DescriptorPool {
    pub fn new(config: DescriptorPoolConfig) -> Result<DescriptorPool> {
        let pool_size = config.pool_size.max(1).next_power_of_two();
        let partition_count = config
            .partitions
            .clamp(1, 1024)
            .next_power_of_two()
            .min(1024);
        let desc_per_partition = pool_size / partition_count;
        if desc_per_partition == 0 {
            return Err(QuarryError::InvalidArgument(
                "pool size must be at least the partition count",
            ));
        }
        let epoch = Arc::new(EpochManager::with_capacity(config.epoch_table_size)?);
        let garbage_capacity = (desc_per_partition as usize).next_power_of_two().max(4);
        let partitions: Box<[Partition]> = (0..partition_count)
            .map(|_| {
                Ok(Partition {
                    free_list: Mutex::new(Vec::with_capacity(desc_per_partition as usize)),
                    garbage: GarbageList::new(Arc::clone(&epoch), garbage_capacity)?,
                })
            })
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();
        let descriptors: Box<[Descriptor]> = (0..pool_size).map(|_| Descriptor::new()).collect();
        let pool = DescriptorPool {
            descriptors,
            partitions,
            registry: Box::new(CallbackRegistry::new()),
            epoch,
            thread_slots: ThreadSlots::new(),
            next_partition: CachePadded::new(AtomicU32::new(0)),
            durability: config.durability,
            desc_per_partition,
        };
        pool.init_descriptors();
        debug!(
            pool_size,
            partition_count,
            durable = pool.durability == Durability::Durable,
            "descriptor pool created"
        );
        Ok(pool)
    }

    /// Number of descriptors each partition owns.
    pub fn desc_per_partition(&self) -> u32 {
        self.desc_per_partition
    }

    /// The epoch manager protecting descriptor reuse. Readers that manage
    /// their own protection bracket operations with it.
    pub fn epoch(&self) -> &EpochManager {
        &self.epoch
    }

    /// Registers a free callback, returning its index for
    /// [`DescriptorPool::allocate_with_callback`].
    pub fn register_free_callback(&self, callback: FreeCallback) -> Result<CallbackIdx> {
        self.registry.register(callback)
    }

    /// Allocates a descriptor with the default free callback.
    pub fn allocate(&self) -> DescriptorGuard<'_> {
        self.allocate_with_callback(0)
    }

    /// Allocates a descriptor from the calling thread's partition,
    /// scavenging its garbage list when the free list runs dry.
    ///
    /// Do not call while holding a long-lived epoch protection: scavenging
    /// cannot reclaim anything the calling thread itself still pins.
    pub fn allocate_with_callback(&self, callback_idx: CallbackIdx) -> DescriptorGuard<'_> {
        let partition = self.partition_for_thread();
        let desc = loop {
            if let Some(addr) = partition.free_list.lock().pop() {
                break unsafe { &*(addr as *const Descriptor) };
            }
            self.epoch.bump_current_epoch();
            if partition.garbage.scavenge() == 0 {
                std::hint::spin_loop();
            }
        };
        desc.initialize(callback_idx);
        DescriptorGuard {
            pool: self,
            desc,
            finished: Cell::new(false),
        }
    }

    /// Reads a target word, entering epoch protection unless the thread
    /// already holds it. See [`DescriptorPool::read_protected`].
    pub fn read(&self, target: &AtomicU64) -> u64 {
        let _guard = if self.epoch.is_protected() {
            EpochGuard::attach(&self.epoch)
        } else {
            EpochGuard::new(&self.epoch)
        };
        self.read_protected(target)
    }

    /// Reads a target word under the caller's epoch protection: in-flight
    /// CondCAS installs are completed, dirty values persisted and cleaned,
    /// and in-flight operations helped to completion before the stable
    /// value is returned.
    pub fn read_protected(&self, target: &AtomicU64) -> u64 {
        let durable = self.durability == Durability::Durable;
        loop {
            let value = target.load(Ordering::SeqCst);
            if value & CONDCAS_FLAG != 0 {
                debug_assert_eq!(value & DIRTY_FLAG, 0, "dirty CondCAS pointer");
                complete_cond_cas(unsafe { word_from_value(value) });
                continue;
            }
            if durable && value & DIRTY_FLAG != 0 {
                persist::flush(target);
                let _ = target.compare_exchange(
                    value,
                    value & !DIRTY_FLAG,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }
            if value & MWCAS_FLAG != 0 {
                unsafe { descriptor_from_value(value) }.execute_internal(1);
                continue;
            }
            return value;
        }
    }

    /// Rolls every in-flight descriptor forward or back after a restart.
    ///
    /// Must run before any new operation starts, with every target word
    /// recorded by a non-finished descriptor still live. Running recovery
    /// twice is the same as running it once.
    pub fn recover(&self) -> RecoveryStats {
        let mut stats = RecoveryStats::default();
        for desc in self.descriptors.iter() {
            let status = desc.stable_status();
            match status {
                STATUS_FINISHED => stats.finished += 1,
                STATUS_UNDECIDED | STATUS_FAILED => {
                    stats.rolled_back += 1;
                    self.roll_back(desc, &mut stats);
                }
                STATUS_SUCCEEDED => {
                    stats.rolled_forward += 1;
                    self.roll_forward(desc, &mut stats);
                }
                other => {
                    error!(status = other, "descriptor with invalid status; skipping");
                    continue;
                }
            }
            self.check_no_residual_tags(desc);
        }
        for partition in self.partitions.iter() {
            partition.free_list.lock().clear();
            partition.garbage.reset();
        }
        self.init_descriptors();
        info!(
            finished = stats.finished,
            rolled_back = stats.rolled_back,
            rolled_forward = stats.rolled_forward,
            rolled_back_words = stats.rolled_back_words,
            rolled_forward_words = stats.rolled_forward_words,
            "descriptor pool recovery complete"
        );
        stats
    }

    /// An undecided or failed descriptor never published a new value, so
    /// any word still carrying one of its tags reverts to the old value.
    fn roll_back(&self, desc: &Descriptor, stats: &mut RecoveryStats) {
        for wd in &desc.words {
            let addr = wd.address.load(Ordering::SeqCst);
            if addr == 0 {
                continue;
            }
            let target = unsafe { wd.target() };
            let value = self.strip_dirty(target);
            let ours = (value & CONDCAS_FLAG != 0 && clean_value(value) == wd as *const _ as u64)
                || (value & MWCAS_FLAG != 0 && clean_value(value) == desc.addr());
            if ours {
                target.store(wd.old_clean(), Ordering::SeqCst);
                persist::flush(target);
                stats.rolled_back_words += 1;
                info!(address = addr, old = wd.old_clean(), "rolled word back");
            }
        }
        let callback = desc.free_callback();
        for wd in &desc.words {
            if wd.should_recycle_new() {
                callback(&wd.new_value);
            }
        }
    }

    /// A succeeded descriptor is rolled forward: words still holding its
    /// MwCAS tag receive the new value. A word still in CondCAS state had
    /// not been promoted, so its new value was never observable; it rolls
    /// back individually.
    fn roll_forward(&self, desc: &Descriptor, stats: &mut RecoveryStats) {
        for wd in &desc.words {
            let addr = wd.address.load(Ordering::SeqCst);
            if addr == 0 {
                continue;
            }
            let target = unsafe { wd.target() };
            let value = self.strip_dirty(target);
            if value & MWCAS_FLAG != 0 && clean_value(value) == desc.addr() {
                target.store(wd.new_clean(), Ordering::SeqCst);
                persist::flush(target);
                stats.rolled_forward_words += 1;
                info!(address = addr, new = wd.new_clean(), "rolled word forward");
            } else if value & CONDCAS_FLAG != 0 && clean_value(value) == wd as *const _ as u64 {
                target.store(wd.old_clean(), Ordering::SeqCst);
                persist::flush(target);
                stats.rolled_back_words += 1;
                info!(address = addr, old = wd.old_clean(), "rolled word back");
            }
        }
        let callback = desc.free_callback();
        for wd in &desc.words {
            if wd.should_recycle_old() {
                callback(&wd.old_value);
            }
        }
    }

    fn strip_dirty(&self, target: &AtomicU64) -> u64 {
        let value = target.load(Ordering::SeqCst);
        if value & DIRTY_FLAG != 0 {
            let stripped = value & !DIRTY_FLAG;
            target.store(stripped, Ordering::SeqCst);
            persist::flush(target);
            return stripped;
        }
        value
    }

    fn check_no_residual_tags(&self, desc: &Descriptor) {
        for wd in &desc.words {
            if wd.address.load(Ordering::SeqCst) == 0 {
                continue;
            }
            let value = unsafe { wd.target() }.load(Ordering::SeqCst) & !DIRTY_FLAG;
            if value == desc.tag() || value == wd.tag() {
                error!(
                    address = wd.address.load(Ordering::SeqCst),
                    "recovery left a descriptor tag behind"
                );
                debug_assert!(false, "recovery left a descriptor tag behind");
            }
        }
    }

    /// Distributes descriptors to partitions and resets every one to the
    /// free state.
    fn init_descriptors(&self) {
        let durable = self.durability == Durability::Durable;
        let registry_addr = &*self.registry as *const CallbackRegistry as u64;
        let per = self.desc_per_partition as usize;
        for (i, desc) in self.descriptors.iter().enumerate() {
            let partition = &self.partitions[i / per];
            desc.bind(partition as *const Partition as u64, registry_addr, durable);
            partition.push_free(desc.addr());
        }
        if durable {
            persist::flush_range(
                self.descriptors.as_ptr() as *const u8,
                std::mem::size_of::<Descriptor>() * self.descriptors.len(),
            );
        }
    }

    fn partition_for_thread(&self) -> &Partition {
        let count = self.partitions.len() as u32;
        let index = self
            .thread_slots
            .partition_index(|| self.next_partition.fetch_add(1, Ordering::SeqCst) % count);
        &self.partitions[index as usize]
    }
}

/// Owner handle for one allocated descriptor. Dropping the guard without
/// executing aborts the operation; the descriptor always returns to its
/// partition through the garbage list.
pub struct DescriptorGuard<'pool> {
    pool: &'pool DescriptorPool,
    desc: &'pool Descriptor,
    finished: Cell<bool>,
}

impl DescriptorGuard<'_> {
    /// Adds one target word: swap `old` for `new` at `target`. Values must
    /// leave bits 61..=63 clear. Returns the entry index.
    pub fn add_entry(
        &self,
        target: &AtomicU64,
        old: u64,
        new: u64,
        policy: RecyclePolicy,
    ) -> Result<usize> {
        self.desc
            .add_entry(target as *const AtomicU64 as u64, old, new, policy)
    }

    /// Reserves an entry whose new value is not known yet; fill it in with
    /// [`DescriptorGuard::set_new_value`]. Only the policies that recycle
    /// the new value make sense here.
    pub fn reserve_entry(
        &self,
        target: &AtomicU64,
        old: u64,
        policy: RecyclePolicy,
    ) -> Result<usize> {
        if !matches!(
            policy,
            RecyclePolicy::Always | RecyclePolicy::NewOnFailure
        ) {
            return Err(QuarryError::InvalidArgument(
                "reserved entries need a new-value recycle policy",
            ));
        }
        self.add_entry(target, old, 0, policy)
    }

    /// Fills in the new value of a reserved entry.
    pub fn set_new_value(&self, index: usize, value: u64) {
        self.desc.set_new_value(index, value);
    }

    /// Runs the multi-word CAS. Returns `true` when every word moved from
    /// its old to its new value; `false` leaves every word logically
    /// untouched.
    pub fn execute(self) -> bool {
        self.finished.set(true);
        let epoch = &self.pool.epoch;
        let _guard = if epoch.is_protected() {
            EpochGuard::attach(epoch)
        } else {
            EpochGuard::new(epoch)
        };
        self.desc.execute_internal(0)
    }

    /// Abandons the operation before execution.
    pub fn abort(self) {
        self.finished.set(true);
        self.desc.abort();
    }
}

impl Drop for DescriptorGuard<'_> {
    fn drop(&mut self) {
        if !self.finished.get() {
            warn!("descriptor guard dropped without execute; aborting");
            self.desc.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn durable_pool() -> DescriptorPool {
        DescriptorPool::new(DescriptorPoolConfig {
            pool_size: 8,
            partitions: 1,
            durability: Durability::Durable,
            epoch_table_size: 128,
        })
        .unwrap()
    }

    fn volatile_pool() -> DescriptorPool {
        DescriptorPool::new(DescriptorPoolConfig {
            pool_size: 8,
            partitions: 1,
            durability: Durability::Volatile,
            epoch_table_size: 128,
        })
        .unwrap()
    }

    #[test]
    fn two_word_swap_succeeds() {
        let pool = volatile_pool();
        let a = AtomicU64::new(10);
        let b = AtomicU64::new(20);
        let guard = pool.allocate();
        guard.add_entry(&a, 10, 11, RecyclePolicy::Never).unwrap();
        guard.add_entry(&b, 20, 21, RecyclePolicy::Never).unwrap();
        assert!(guard.execute());
        assert_eq!(pool.read(&a), 11);
        assert_eq!(pool.read(&b), 21);
    }

    #[test]
    fn stale_old_value_fails_and_restores_every_word() {
        let pool = volatile_pool();
        let a = AtomicU64::new(11);
        let b = AtomicU64::new(21);
        let guard = pool.allocate();
        // Wrong expectation for `a`, correct for `b`.
        guard.add_entry(&a, 10, 12, RecyclePolicy::Never).unwrap();
        guard.add_entry(&b, 21, 22, RecyclePolicy::Never).unwrap();
        assert!(!guard.execute());
        assert_eq!(pool.read(&a), 11);
        assert_eq!(pool.read(&b), 21);
    }

    #[test]
    fn add_entry_rejects_duplicates_tagged_values_and_overflow() {
        let pool = volatile_pool();
        let words: Vec<AtomicU64> = (0..6).map(|_| AtomicU64::new(0)).collect();
        let guard = pool.allocate();
        guard.add_entry(&words[0], 0, 1, RecyclePolicy::Never).unwrap();
        assert!(matches!(
            guard.add_entry(&words[0], 0, 2, RecyclePolicy::Never),
            Err(QuarryError::DuplicateAddress)
        ));
        assert!(matches!(
            guard.add_entry(&words[1], DIRTY_FLAG, 1, RecyclePolicy::Never),
            Err(QuarryError::InvalidArgument(_))
        ));
        for word in &words[1..DESC_CAP] {
            guard.add_entry(word, 0, 1, RecyclePolicy::Never).unwrap();
        }
        assert!(matches!(
            guard.add_entry(&words[4], 0, 1, RecyclePolicy::Never),
            Err(QuarryError::DescriptorFull)
        ));
        guard.abort();
    }

    #[test]
    fn aborted_guard_leaves_targets_untouched() {
        let pool = volatile_pool();
        let a = AtomicU64::new(5);
        {
            let guard = pool.allocate();
            guard.add_entry(&a, 5, 6, RecyclePolicy::Never).unwrap();
            // Dropped without execute: abort path.
        }
        assert_eq!(a.load(Ordering::SeqCst), 5);
        // The descriptor must become allocatable again.
        let guard = pool.allocate();
        guard.add_entry(&a, 5, 6, RecyclePolicy::Never).unwrap();
        assert!(guard.execute());
        assert_eq!(pool.read(&a), 6);
    }

    #[test]
    fn recovery_rolls_back_partial_install() {
        // S5: crash between word installs; target A carries the CondCAS
        // tag, B was never touched, status is still undecided.
        let pool = durable_pool();
        let a = AtomicU64::new(1);
        let b = AtomicU64::new(3);
        let guard = pool.allocate();
        let ia = guard.add_entry(&a, 1, 2, RecyclePolicy::Never).unwrap();
        guard.add_entry(&b, 3, 4, RecyclePolicy::Never).unwrap();
        let desc = guard.desc;
        desc.prepare();
        a.store(desc.words[ia].tag(), Ordering::SeqCst);
        std::mem::forget(guard);

        let stats = pool.recover();
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 3);
        assert_eq!(stats.rolled_back, 1);
        assert_eq!(stats.rolled_back_words, 1);
        assert_eq!(stats.finished, 7);
    }

    #[test]
    fn recovery_rolls_forward_after_commit() {
        // S6: crash after the decide point; A already finalized, B still
        // carries the MwCAS descriptor tag.
        let pool = durable_pool();
        let a = AtomicU64::new(1);
        let b = AtomicU64::new(3);
        let guard = pool.allocate();
        guard.add_entry(&a, 1, 2, RecyclePolicy::Never).unwrap();
        guard.add_entry(&b, 3, 4, RecyclePolicy::Never).unwrap();
        let desc = guard.desc;
        desc.prepare();
        a.store(2, Ordering::SeqCst);
        b.store(desc.tag(), Ordering::SeqCst);
        desc.status.store(STATUS_SUCCEEDED, Ordering::SeqCst);
        std::mem::forget(guard);

        let stats = pool.recover();
        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 4);
        assert_eq!(stats.rolled_forward, 1);
        assert_eq!(stats.rolled_forward_words, 1);
    }

    #[test]
    fn recovery_rolls_back_unpromoted_word_of_committed_op() {
        // A succeeded descriptor with one word still in CondCAS state:
        // that install was never promoted, so only that word reverts.
        let pool = durable_pool();
        let a = AtomicU64::new(1);
        let b = AtomicU64::new(3);
        let guard = pool.allocate();
        let ia = guard.add_entry(&a, 1, 2, RecyclePolicy::Never).unwrap();
        guard.add_entry(&b, 3, 4, RecyclePolicy::Never).unwrap();
        let desc = guard.desc;
        desc.prepare();
        a.store(desc.words[ia].tag(), Ordering::SeqCst);
        b.store(desc.tag(), Ordering::SeqCst);
        desc.status.store(STATUS_SUCCEEDED, Ordering::SeqCst);
        std::mem::forget(guard);

        let stats = pool.recover();
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 4);
        assert_eq!(stats.rolled_forward_words, 1);
        assert_eq!(stats.rolled_back_words, 1);
    }

    #[test]
    fn recovery_is_idempotent() {
        let pool = durable_pool();
        let a = AtomicU64::new(1);
        let b = AtomicU64::new(3);
        let guard = pool.allocate();
        let ia = guard.add_entry(&a, 1, 2, RecyclePolicy::Never).unwrap();
        guard.add_entry(&b, 3, 4, RecyclePolicy::Never).unwrap();
        let desc = guard.desc;
        desc.prepare();
        a.store(desc.words[ia].tag(), Ordering::SeqCst);
        std::mem::forget(guard);

        pool.recover();
        let a_after = a.load(Ordering::SeqCst);
        let b_after = b.load(Ordering::SeqCst);
        let second = pool.recover();
        assert_eq!(a.load(Ordering::SeqCst), a_after);
        assert_eq!(b.load(Ordering::SeqCst), b_after);
        assert_eq!(second.rolled_back, 0);
        assert_eq!(second.rolled_forward, 0);
        assert_eq!(second.finished, 8);
        // The pool is usable after recovery.
        let guard = pool.allocate();
        guard.add_entry(&a, 1, 9, RecyclePolicy::Never).unwrap();
        assert!(guard.execute());
        assert_eq!(pool.read(&a), 9);
    }

    static FREED: AtomicUsize = AtomicUsize::new(0);

    fn counting_callback(slot: &AtomicU64) {
        FREED.fetch_add(1, Ordering::SeqCst);
        slot.store(0, Ordering::SeqCst);
    }

    #[test]
    fn failed_operation_recycles_new_values() {
        let pool = volatile_pool();
        let a = AtomicU64::new(5);
        let idx = pool.register_free_callback(counting_callback).unwrap();
        let guard = pool.allocate_with_callback(idx);
        guard
            .add_entry(&a, 999, 7, RecyclePolicy::NewOnFailure)
            .unwrap();
        assert!(!guard.execute());
        pool.epoch().bump_current_epoch();
        let reclaimed = pool.partitions[0].garbage.scavenge();
        assert!(reclaimed >= 1);
        assert_eq!(FREED.load(Ordering::SeqCst), 1);
        assert_eq!(a.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn reserved_entry_takes_a_late_new_value() {
        let pool = volatile_pool();
        let a = AtomicU64::new(1);
        let guard = pool.allocate();
        let idx = guard
            .reserve_entry(&a, 1, RecyclePolicy::NewOnFailure)
            .unwrap();
        guard.set_new_value(idx, 2);
        assert!(guard.execute());
        assert_eq!(pool.read(&a), 2);
    }
}
