//! Persistent multi-word compare-and-swap with epoch-based reclamation.
//!
//! [`DescriptorPool`] owns a fixed set of operation descriptors partitioned
//! per thread. An operation is built through a [`DescriptorGuard`] (add up
//! to [`DESC_CAP`] target words, then execute) and is lock-free: any thread
//! that observes an in-flight descriptor helps complete it. The durable
//! variant flushes control values through a dirty-bit discipline so that
//! [`DescriptorPool::recover`] can roll every in-flight operation forward
//! or back after a restart.

mod descriptor;
pub mod epoch;
mod garbage;
mod persist;

pub use descriptor::{
    clean_value, is_clean_value, CallbackIdx, Descriptor, DescriptorGuard, DescriptorPool,
    DescriptorPoolConfig, Durability, FreeCallback, RecoveryStats, RecyclePolicy, CONDCAS_FLAG,
    DESC_CAP, DIRTY_FLAG, MWCAS_FLAG,
};
pub use epoch::{Epoch, EpochGuard, EpochManager};
