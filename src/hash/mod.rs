//! A chained, direct-addressed hash table over the buffer pool.
//!
//! The bucket count is fixed at creation and persisted in the file header's
//! user field. A directory of chain heads occupies the pages after the
//! header; each bucket chains bucket pages holding 253 slots tracked by an
//! in-page bitmap. Chain walks opportunistically unlink and free pages that
//! have become empty.

pub mod bucket;


use std::hash::{Hash, Hasher};

use tracing::debug;

use crate::error::{QuarryError, Result};
use crate::paged::{AccessMode, BufferPool, PageRef, PagedFile, PagedFileOptions};
use crate::types::PageNum;

use bucket::{
    dir_head, dir_page_for, set_dir_head, BucketView, BucketViewMut, BUCKETS_PER_DIR,
    ENTRIES_PER_BUCKET,
};

/// Fewest frames the chain walk can need at once (directory, predecessor,
/// current, memoized free slot, and a freshly linked page).
const MIN_CACHE_PAGES: usize = 8;

/// Shape of one page in a bucket chain, for inspection and tests.
#[derive(Clone, Copy, Debug)]
pub struct BucketSummary {
    /// Page number of the bucket page.
    pub page: PageNum,
    /// The page's `n_entries` field.
    pub n_entries: u64,
    /// Popcount of the occupancy bitmap.
    pub live_slots: u64,
}

/// The predecessor of the chain page being examined: either the directory
/// slot (for the head) or the previous bucket page.
enum Link<'pool> {
    Dir { page: PageRef<'pool>, bucket: u64 },
    Bucket(PageRef<'pool>),
}

impl Link<'_> {
    fn set_next(&self, next: PageNum) {
        match self {
            Link::Dir { page, bucket } => {
                set_dir_head(&mut page.data_mut()[..], *bucket, next);
                page.mark_dirty();
            }
            Link::Bucket(page) => {
                BucketViewMut::new(&mut page.data_mut()[..]).set_next(next);
                page.mark_dirty();
            }
        }
    }
}

/// A persistent hash index with a fixed bucket count. One instance per
/// worker thread; instances are not thread-safe.
pub struct PagedHashTable {
    pool: BufferPool,
    n_buckets: u64,
}

impl PagedHashTable {
    /// Creates a fresh table with `n_buckets` buckets, truncating any
    /// existing file and zeroing the directory pages.
    pub fn create(
        path: impl AsRef<std::path::Path>,
        n_buckets: u64,
        cache_pages: usize,
        options: PagedFileOptions,
    ) -> Result<PagedHashTable> {
        if n_buckets == 0 {
            return Err(QuarryError::InvalidArgument("bucket count must be nonzero"));
        }
        check_cache(cache_pages)?;
        let mut options = options;
        options.truncate = true;
        let file = PagedFile::open(path, options)?;
        let pool = BufferPool::new(file, cache_pages)?;
        pool.set_user_field(n_buckets);
        let dir_pages = n_buckets / BUCKETS_PER_DIR + 1;
        for _ in 0..dir_pages {
            let page = pool.allocate()?;
            pool.trunc_page(page)?;
        }
        pool.flush_all()?;
        debug!(n_buckets, dir_pages, "hash table created");
        Ok(PagedHashTable { pool, n_buckets })
    }

    /// Opens an existing table, reading the bucket count from the header.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        cache_pages: usize,
        options: PagedFileOptions,
    ) -> Result<PagedHashTable> {
        check_cache(cache_pages)?;
        let mut options = options;
        options.truncate = false;
        let file = PagedFile::open(path, options)?;
        let n_buckets = file.user_field();
        if n_buckets == 0 {
            return Err(QuarryError::Corruption("file has no bucket count"));
        }
        let pool = BufferPool::new(file, cache_pages)?;
        Ok(PagedHashTable { pool, n_buckets })
    }

    /// Fixed bucket count chosen at creation.
    pub fn bucket_count(&self) -> u64 {
        self.n_buckets
    }

    /// Buffer-pool counters.
    pub fn pool_stats(&self) -> crate::paged::PoolStats {
        self.pool.stats()
    }

    /// Inserts `key -> value`. Returns `false` when the key already exists
    /// anywhere in its bucket chain; no free slot is consumed in that case.
    pub fn insert(&self, key: u64, value: u64) -> Result<bool> {
        match self.probe_for_insert(key)? {
            None => Ok(false),
            Some((page, slot)) => {
                BucketViewMut::new(&mut page.data_mut()[..]).put(slot, key, value);
                page.mark_dirty();
                Ok(true)
            }
        }
    }

    /// Looks up `key`.
    pub fn search(&self, key: u64) -> Result<Option<u64>> {
        match self.probe_for_key(key)? {
            None => Ok(None),
            Some((page, slot)) => {
                let value = BucketView::new(&page.data()[..]).value(slot);
                Ok(Some(value))
            }
        }
    }

    /// Removes `key`, zeroing its slot. Returns `false` when absent.
    pub fn erase(&self, key: u64) -> Result<bool> {
        match self.probe_for_key(key)? {
            None => Ok(false),
            Some((page, slot)) => {
                BucketViewMut::new(&mut page.data_mut()[..]).remove(slot);
                page.mark_dirty();
                Ok(true)
            }
        }
    }

    /// Walks `bucket`'s chain without compacting, returning one summary per
    /// page. Also checks the bitmap/count invariant on each page.
    pub fn bucket_chain(&self, bucket: u64) -> Result<Vec<BucketSummary>> {
        if bucket >= self.n_buckets {
            return Err(QuarryError::InvalidArgument("bucket out of range"));
        }
        let mut out = Vec::new();
        let dir = self.pool.pin(dir_page_for(bucket), AccessMode::Read)?;
        let mut next = dir_head(&dir.data()[..], bucket);
        drop(dir);
        while next != 0 {
            let page = self.pool.pin(next, AccessMode::Read)?;
            let guard = page.data();
            let view = BucketView::new(&guard[..]);
            out.push(BucketSummary {
                page: next,
                n_entries: view.n_entries(),
                live_slots: view.occupied_count(),
            });
            next = view.next();
        }
        Ok(out)
    }

    /// Flushes all state and releases the pool.
    pub fn finalize(self) -> Result<()> {
        self.pool.finalize()
    }

    fn bucket_of(&self, key: u64) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() % self.n_buckets
    }

    /// Allocates and zeroes a bucket page, returning it pinned.
    fn fresh_bucket(&self) -> Result<PageRef<'_>> {
        let n = self.pool.allocate()?;
        self.pool.trunc_page(n)?;
        self.pool.pin(n, AccessMode::Write)
    }

    /// Finds a slot for a new key: `None` means the key is already present.
    ///
    /// The walk unlinks and frees empty pages as it encounters them,
    /// remembers the first free slot seen (keeping that page pinned), and
    /// appends a fresh page at chain end when no slot turned up.
    fn probe_for_insert(&self, key: u64) -> Result<Option<(PageRef<'_>, usize)>> {
        let bucket = self.bucket_of(key);
        let dir = self.pool.pin(dir_page_for(bucket), AccessMode::Write)?;
        let head = dir_head(&dir.data()[..], bucket);
        if head == 0 {
            let fresh = self.fresh_bucket()?;
            set_dir_head(&mut dir.data_mut()[..], bucket, fresh.page_num());
            dir.mark_dirty();
            return Ok(Some((fresh, 0)));
        }

        let mut prev = Link::Dir { page: dir, bucket };
        let mut cur = self.pool.pin(head, AccessMode::Write)?;
        let mut memo: Option<(PageRef<'_>, usize)> = None;
        loop {
            // Unlink pages that have drained to zero entries.
            if BucketView::new(&cur.data()[..]).n_entries() == 0 {
                let next = BucketView::new(&cur.data()[..]).next();
                prev.set_next(next);
                self.pool.free_page(cur)?;
                if next == 0 {
                    if let Some(found) = memo {
                        return Ok(Some(found));
                    }
                    let fresh = self.fresh_bucket()?;
                    prev.set_next(fresh.page_num());
                    return Ok(Some((fresh, 0)));
                }
                cur = self.pool.pin(next, AccessMode::Write)?;
                continue;
            }

            {
                let guard = cur.data();
                let view = BucketView::new(&guard[..]);
                let live = view.n_entries();
                let mut seen = 0u64;
                for slot in 0..ENTRIES_PER_BUCKET {
                    if view.is_occupied(slot) {
                        if view.key(slot) == key {
                            return Ok(None);
                        }
                        seen += 1;
                    } else if memo.is_none() {
                        memo = Some((cur.clone_ref(), slot));
                    }
                    if memo.is_some() && seen == live {
                        break;
                    }
                }
            }

            let next = BucketView::new(&cur.data()[..]).next();
            if next == 0 {
                if let Some(found) = memo {
                    return Ok(Some(found));
                }
                let fresh = self.fresh_bucket()?;
                BucketViewMut::new(&mut cur.data_mut()[..]).set_next(fresh.page_num());
                cur.mark_dirty();
                return Ok(Some((fresh, 0)));
            }
            prev = Link::Bucket(cur);
            cur = self.pool.pin(next, AccessMode::Write)?;
        }
    }

    /// Finds the slot holding `key`, compacting empty pages along the way.
    fn probe_for_key(&self, key: u64) -> Result<Option<(PageRef<'_>, usize)>> {
        let bucket = self.bucket_of(key);
        let dir = self.pool.pin(dir_page_for(bucket), AccessMode::Write)?;
        let head = dir_head(&dir.data()[..], bucket);
        if head == 0 {
            return Ok(None);
        }

        let mut prev = Link::Dir { page: dir, bucket };
        let mut cur = self.pool.pin(head, AccessMode::Write)?;
        loop {
            if BucketView::new(&cur.data()[..]).n_entries() == 0 {
                let next = BucketView::new(&cur.data()[..]).next();
                prev.set_next(next);
                self.pool.free_page(cur)?;
                if next == 0 {
                    return Ok(None);
                }
                cur = self.pool.pin(next, AccessMode::Write)?;
                continue;
            }

            let mut hit = None;
            {
                let guard = cur.data();
                let view = BucketView::new(&guard[..]);
                let live = view.n_entries();
                let mut seen = 0u64;
                for slot in 0..ENTRIES_PER_BUCKET {
                    if view.is_occupied(slot) {
                        if view.key(slot) == key {
                            hit = Some(slot);
                            break;
                        }
                        seen += 1;
                        if seen == live {
                            break;
                        }
                    }
                }
            }
            if let Some(slot) = hit {
                return Ok(Some((cur, slot)));
            }

            let next = BucketView::new(&cur.data()[..]).next();
            if next == 0 {
                return Ok(None);
            }
            prev = Link::Bucket(cur);
            cur = self.pool.pin(next, AccessMode::Write)?;
        }
    }
}

fn check_cache(cache_pages: usize) -> Result<()> {
    if cache_pages < MIN_CACHE_PAGES {
        return Err(QuarryError::InvalidArgument(
            "hash table cache must hold at least 8 pages",
        ));
    }
    Ok(())
}
