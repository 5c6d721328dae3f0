use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

use crate::error::{QuarryError, Result};
use crate::paged::file::PagedFile;
use crate::paged::frame::Frame;
use crate::types::{FileId, PageBuf, PageId, PageNum, MAX_PAGE_NUM};

/// Declared access intent for a pin. Write intent does not imply dirtiness;
/// callers must still [`PageRef::mark_dirty`] after mutating.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Counters describing pool behavior since construction.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    /// Pins satisfied from a resident frame.
    pub hits: u64,
    /// Pins that had to load the page from the file.
    pub misses: u64,
    /// Frames whose previous occupant was displaced.
    pub evictions: u64,
    /// Dirty pages written back (eviction or flush).
    pub dirty_writebacks: u64,
}

struct PoolInner {
    file: PagedFile,
    frames: Vec<Frame>,
    page_table: HashMap<PageNum, usize>,
    hand: usize,
    stats: PoolStats,
}

/// A fixed-capacity cache of page frames over one [`PagedFile`], with CLOCK
/// replacement and a pin-count discipline.
///
/// Instances are single-threaded by contract (one index instance per worker
/// thread); the interior locks exist so that [`PageRef`] handles can release
/// themselves without a mutable borrow of the pool.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    id: FileId,
    capacity: usize,
}

impl BufferPool {
    /// Creates a pool of `capacity` frames bound to `file`.
    pub fn new(file: PagedFile, capacity: usize) -> Result<BufferPool> {
        if capacity == 0 || capacity > MAX_PAGE_NUM as usize {
            return Err(QuarryError::InvalidArgument(
                "buffer pool capacity must be in [1, 2^24]",
            ));
        }
        let id = file.file_id();
        let frames = (0..capacity).map(|_| Frame::new()).collect();
        debug!(capacity, file_id = id, "buffer pool created");
        Ok(BufferPool {
            inner: Mutex::new(PoolInner {
                file,
                frames,
                page_table: HashMap::with_capacity(capacity),
                hand: 0,
                stats: PoolStats::default(),
            }),
            id,
            capacity,
        })
    }

    /// File id of the backing file.
    pub fn file_id(&self) -> FileId {
        self.id
    }

    /// Number of frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats
    }

    /// Pins a page by its packed id, checking that it belongs to this
    /// pool's file.
    pub fn pin_page(&self, id: PageId, mode: AccessMode) -> Result<PageRef<'_>> {
        if !id.is_valid() || id.file_id() != self.id {
            return Err(QuarryError::InvalidPageId(id.raw()));
        }
        self.pin(id.page_num(), mode)
    }

    /// Pins page `n`, loading it from the file on a miss. The returned
    /// handle unpins on drop.
    pub fn pin(&self, n: PageNum, mode: AccessMode) -> Result<PageRef<'_>> {
        PageId::new(self.id, n)?;
        let _ = mode;
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.page_table.get(&n) {
            let frame = &mut inner.frames[idx];
            frame.referenced = true;
            frame.pin_count += 1;
            let buf = Arc::clone(&frame.buf);
            inner.stats.hits += 1;
            return Ok(PageRef::new(self, idx, n, buf));
        }

        inner.stats.misses += 1;
        let idx = self.evict_victim(&mut inner)?;
        {
            let buf = Arc::clone(&inner.frames[idx].buf);
            let mut guard = buf.write();
            inner.file.read_page(n, &mut guard)?;
        }
        let frame = &mut inner.frames[idx];
        frame.id = Some(n);
        frame.referenced = true;
        frame.dirty = false;
        frame.pin_count = 1;
        let buf = Arc::clone(&frame.buf);
        inner.page_table.insert(n, idx);
        Ok(PageRef::new(self, idx, n, buf))
    }

    /// Allocates a page number from the backing file's free list.
    pub fn allocate(&self) -> Result<PageNum> {
        self.inner.lock().file.allocate_page()
    }

    /// Zeroes a page directly on disk (the page must not be resident).
    pub fn trunc_page(&self, n: PageNum) -> Result<()> {
        let inner = self.inner.lock();
        debug_assert!(!inner.page_table.contains_key(&n));
        inner.file.trunc_page(n)
    }

    /// Logically deallocates the page held by `page`: drops its mapping and
    /// returns the page number to the file's free list. The caller must
    /// hold the only pin.
    pub fn free_page(&self, page: PageRef<'_>) -> Result<()> {
        let mut inner = self.inner.lock();
        let frame = &inner.frames[page.frame_idx];
        if frame.pin_count != 1 {
            return Err(QuarryError::InvalidArgument(
                "freeing a page that is pinned elsewhere",
            ));
        }
        inner.page_table.remove(&page.page);
        inner.frames[page.frame_idx].reset();
        inner.file.free_page(page.page)?;
        drop(inner);
        page.released.set(true);
        Ok(())
    }

    /// The header's user field (shared with the backing file).
    pub fn user_field(&self) -> u64 {
        self.inner.lock().file.user_field()
    }

    /// Updates the header's user field in the cached header.
    pub fn set_user_field(&self, value: u64) {
        self.inner.lock().file.set_user_field(value);
    }

    /// Highest page number allocated in the backing file.
    pub fn highest_page(&self) -> PageNum {
        self.inner.lock().file.highest_page()
    }

    /// Writes every dirty frame back and persists the file header.
    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for idx in 0..inner.frames.len() {
            Self::flush_frame(&mut inner, idx)?;
        }
        inner.file.flush()
    }

    /// Flushes everything and consumes the pool.
    pub fn finalize(self) -> Result<()> {
        self.flush_all()
    }

    fn flush_frame(inner: &mut PoolInner, idx: usize) -> Result<()> {
        if !inner.frames[idx].dirty {
            return Ok(());
        }
        let n = inner.frames[idx]
            .id
            .ok_or(QuarryError::Corruption("dirty frame without a page id"))?;
        let buf = Arc::clone(&inner.frames[idx].buf);
        let guard = buf.read();
        inner.file.write_page(n, &guard)?;
        inner.frames[idx].dirty = false;
        inner.stats.dirty_writebacks += 1;
        Ok(())
    }

    /// CLOCK victim selection. The hand stops on the victim frame (it is
    /// not advanced past it), matching the second-chance discipline: a
    /// just-refilled frame gets its referenced bit back and is skipped on
    /// the next pass.
    fn evict_victim(&self, inner: &mut PoolInner) -> Result<usize> {
        let capacity = inner.frames.len();
        let mut scanned = 0usize;
        loop {
            let hand = inner.hand;
            let frame = &mut inner.frames[hand];
            if frame.pin_count == 0 {
                if frame.referenced {
                    frame.referenced = false;
                } else {
                    break;
                }
            }
            inner.hand = (hand + 1) % capacity;
            scanned += 1;
            if scanned > 2 * capacity {
                return Err(QuarryError::PoolExhausted);
            }
        }
        let idx = inner.hand;
        if inner.frames[idx].dirty {
            Self::flush_frame(inner, idx)?;
        }
        if let Some(old) = inner.frames[idx].id {
            inner.page_table.remove(&old);
            inner.stats.evictions += 1;
        }
        inner.frames[idx].reset();
        Ok(idx)
    }

    fn unpin(&self, frame_idx: usize) {
        let mut inner = self.inner.lock();
        let frame = &mut inner.frames[frame_idx];
        debug_assert!(frame.pin_count > 0, "unpin of an unpinned frame");
        frame.pin_count = frame.pin_count.saturating_sub(1);
    }

    fn mark_dirty(&self, frame_idx: usize) {
        self.inner.lock().frames[frame_idx].dirty = true;
    }

    fn repin(&self, frame_idx: usize) {
        self.inner.lock().frames[frame_idx].pin_count += 1;
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(err) = self.flush_all() {
            error!(error = %err, "failed to flush buffer pool on drop");
        }
    }
}

/// A pinned page. Dropping the handle releases the pin; the frame cannot be
/// evicted while any handle to it lives.
pub struct PageRef<'pool> {
    pool: &'pool BufferPool,
    frame_idx: usize,
    page: PageNum,
    buf: Arc<RwLock<Box<PageBuf>>>,
    released: Cell<bool>,
}

impl<'pool> fmt::Debug for PageRef<'pool> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRef")
            .field("frame_idx", &self.frame_idx)
            .field("page", &self.page)
            .finish()
    }
}

impl<'pool> PageRef<'pool> {
    fn new(
        pool: &'pool BufferPool,
        frame_idx: usize,
        page: PageNum,
        buf: Arc<RwLock<Box<PageBuf>>>,
    ) -> Self {
        PageRef {
            pool,
            frame_idx,
            page,
            buf,
            released: Cell::new(false),
        }
    }

    /// Page number this handle is pinned to.
    pub fn page_num(&self) -> PageNum {
        self.page
    }

    /// Shared view of the page bytes.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<PageBuf>> {
        self.buf.read()
    }

    /// Exclusive view of the page bytes. Mutations are not persisted until
    /// the frame is flushed; call [`PageRef::mark_dirty`] after writing.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<PageBuf>> {
        self.buf.write()
    }

    /// Flags the frame for write-back.
    pub fn mark_dirty(&self) {
        self.pool.mark_dirty(self.frame_idx);
    }

    /// Takes an additional pin on the same page.
    pub fn clone_ref(&self) -> PageRef<'pool> {
        self.pool.repin(self.frame_idx);
        PageRef::new(self.pool, self.frame_idx, self.page, Arc::clone(&self.buf))
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        if !self.released.get() {
            self.pool.unpin(self.frame_idx);
        }
    }
}
