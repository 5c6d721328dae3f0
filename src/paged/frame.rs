use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{PageBuf, PageNum};

/// An in-memory slot holding one page image plus replacement metadata.
///
/// The metadata is guarded by the pool's interior mutex; the page bytes sit
/// behind their own lock so callers can hold several distinct pages mutably
/// at once (a B-tree split touches three).
pub(crate) struct Frame {
    pub id: Option<PageNum>,
    pub pin_count: u32,
    pub referenced: bool,
    pub dirty: bool,
    pub buf: Arc<RwLock<Box<PageBuf>>>,
}

impl Frame {
    pub fn new() -> Frame {
        Frame {
            id: None,
            pin_count: 0,
            referenced: false,
            dirty: false,
            buf: Arc::new(RwLock::new(PageBuf::zeroed())),
        }
    }

    /// Clears the slot after eviction or an explicit page free.
    pub fn reset(&mut self) {
        self.id = None;
        self.pin_count = 0;
        self.referenced = false;
        self.dirty = false;
    }
}
