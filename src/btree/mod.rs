//! A clustered B+-tree of fixed order laid out over the buffer pool.
//!
//! Keys and values are `u64`; each node is exactly one page. The backing
//! file's header doubles as the tree header: the highest-page field is the
//! allocated-page count and the user field holds the record count. The root
//! always lives at [`ROOT_PAGE_NUM`].

pub mod node;


use smallvec::SmallVec;
use tracing::debug;

use crate::error::{QuarryError, Result};
use crate::paged::{AccessMode, BufferPool, PageRef, PagedFile, PagedFileOptions};
use crate::types::PageNum;

use node::{NodeView, NodeViewMut, MIN_CHILDREN};

/// The root's page number is fixed for the lifetime of the tree.
pub const ROOT_PAGE_NUM: PageNum = 1;

/// Maximum tree depth supported by the explicit insert stack.
pub const MAX_LEVEL: usize = 8;

/// A persistent ordered index. One instance per worker thread; instances
/// are not thread-safe.
pub struct PagedBTree {
    pool: BufferPool,
}

impl PagedBTree {
    /// Opens (or creates) a B-tree at `path` with a `cache_pages`-frame
    /// buffer pool. The pool must be able to pin a full root-to-leaf path
    /// plus split scratch pages, so `cache_pages >= MAX_LEVEL + 3`.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        cache_pages: usize,
        options: PagedFileOptions,
    ) -> Result<PagedBTree> {
        if cache_pages < MAX_LEVEL + 3 {
            return Err(QuarryError::InvalidArgument(
                "btree cache must hold at least MAX_LEVEL + 3 pages",
            ));
        }
        let file = PagedFile::open(path, options)?;
        let fresh = file.highest_page() == 0;
        let pool = BufferPool::new(file, cache_pages)?;
        let tree = PagedBTree { pool };
        if fresh {
            let root = tree.pool.allocate()?;
            if root != ROOT_PAGE_NUM {
                return Err(QuarryError::Corruption("fresh btree root is not page 1"));
            }
            let page = tree.pool.pin(root, AccessMode::Write)?;
            NodeViewMut::new(&mut page.data_mut()[..]).init(root);
            page.mark_dirty();
            drop(page);
            tree.pool.flush_all()?;
        }
        Ok(tree)
    }

    /// Number of records inserted.
    pub fn record_count(&self) -> u64 {
        self.pool.user_field()
    }

    /// Number of pages allocated in the backing file.
    pub fn allocated_pages(&self) -> PageNum {
        self.pool.highest_page()
    }

    /// Buffer-pool counters (hits, misses, evictions, write-backs).
    pub fn pool_stats(&self) -> crate::paged::PoolStats {
        self.pool.stats()
    }

    /// Looks up `key`, returning its value when present.
    pub fn find(&self, key: u64) -> Result<Option<u64>> {
        let mut page_num = ROOT_PAGE_NUM;
        for _ in 0..=MAX_LEVEL {
            let page = self.pool.pin(page_num, AccessMode::Read)?;
            let guard = page.data();
            let node = NodeView::new(&guard[..]);
            if node.is_leaf() {
                let pos = node.lower_bound(key);
                if pos < node.count() && node.key(pos) == key {
                    return Ok(Some(node.value(pos)));
                }
                return Ok(None);
            }
            let next = node.child(node.descend_pos(key));
            if next == 0 {
                return Err(QuarryError::Corruption("internal node with a null child"));
            }
            page_num = next;
        }
        Err(QuarryError::Corruption("btree deeper than MAX_LEVEL"))
    }

    /// Inserts `key -> value`. Returns `false` (without mutating) when the
    /// key is already present.
    pub fn insert(&self, key: u64, value: u64) -> Result<bool> {
        // Pass 1: descend to the leaf, recording the position followed at
        // each level. The whole path stays pinned for the unwind.
        let mut path: SmallVec<[(PageRef<'_>, usize); MAX_LEVEL]> = SmallVec::new();
        let mut page_num = ROOT_PAGE_NUM;
        loop {
            if path.len() >= MAX_LEVEL {
                return Err(QuarryError::Corruption("btree deeper than MAX_LEVEL"));
            }
            let page = self.pool.pin(page_num, AccessMode::Write)?;
            enum Step {
                Leaf(usize),
                Descend(usize, PageNum),
            }
            let step = {
                let guard = page.data();
                let node = NodeView::new(&guard[..]);
                if node.is_leaf() {
                    let pos = node.lower_bound(key);
                    if pos < node.count() && node.key(pos) == key {
                        return Ok(false);
                    }
                    Step::Leaf(pos)
                } else {
                    let pos = node.descend_pos(key);
                    Step::Descend(pos, node.child(pos))
                }
            };
            match step {
                Step::Leaf(pos) => {
                    NodeViewMut::new(&mut page.data_mut()[..]).insert_entry_at(pos, key, value);
                    page.mark_dirty();
                    path.push((page, pos));
                    break;
                }
                Step::Descend(pos, next) => {
                    if next == 0 {
                        return Err(QuarryError::Corruption("internal node with a null child"));
                    }
                    path.push((page, pos));
                    page_num = next;
                }
            }
        }

        // Pass 2: unwind, splitting any overflowed child with the position
        // recorded at its parent.
        for i in (1..path.len()).rev() {
            let overflowed = NodeView::new(&path[i].0.data()[..]).is_overflowed();
            if overflowed {
                let (upper, lower) = path.split_at(i);
                let (parent, pos) = &upper[i - 1];
                self.split_child(parent, *pos, &lower[0].0)?;
            }
        }
        if NodeView::new(&path[0].0.data()[..]).is_overflowed() {
            self.split_root(&path[0].0)?;
        }
        drop(path);

        self.pool.set_user_field(self.pool.user_field() + 1);
        Ok(true)
    }

    /// Collects up to `len` entries with keys `>= start_key`, in key order,
    /// walking leaf right-sibling links.
    pub fn scan(&self, start_key: u64, len: usize) -> Result<Vec<(u64, u64)>> {
        let mut out = Vec::with_capacity(len);
        if len == 0 {
            return Ok(out);
        }
        let mut page_num = ROOT_PAGE_NUM;
        let mut leaf = loop {
            let page = self.pool.pin(page_num, AccessMode::Read)?;
            let next = {
                let guard = page.data();
                let node = NodeView::new(&guard[..]);
                if node.is_leaf() {
                    None
                } else {
                    Some(node.child(node.descend_pos(start_key)))
                }
            };
            match next {
                None => break page,
                Some(0) => {
                    return Err(QuarryError::Corruption("internal node with a null child"))
                }
                Some(n) => page_num = n,
            }
        };
        loop {
            let right = {
                let guard = leaf.data();
                let node = NodeView::new(&guard[..]);
                let mut pos = node.lower_bound(start_key);
                while pos < node.count() && out.len() < len {
                    out.push(node.entry(pos));
                    pos += 1;
                }
                node.right()
            };
            if out.len() >= len || right == 0 {
                return Ok(out);
            }
            leaf = self.pool.pin(right, AccessMode::Read)?;
        }
    }

    /// Flushes all state and releases the pool.
    pub fn finalize(self) -> Result<()> {
        self.pool.finalize()
    }

    /// Splits the overflowed child at `parent.children[pos]` into two
    /// nodes, promoting the separator into the parent. Leaf separators are
    /// copied into the new right sibling; internal separators move up.
    fn split_child(&self, parent: &PageRef<'_>, pos: usize, child: &PageRef<'_>) -> Result<()> {
        let new_num = self.pool.allocate()?;
        let new_page = self.pool.pin(new_num, AccessMode::Write)?;
        {
            let mut left_guard = child.data_mut();
            let mut left = NodeViewMut::new(&mut left_guard[..]);
            let mut right_guard = new_page.data_mut();
            let mut right = NodeViewMut::new(&mut right_guard[..]);
            right.init(new_num);
            let mut parent_guard = parent.data_mut();
            let mut par = NodeViewMut::new(&mut parent_guard[..]);

            let old_count = left.view().count();
            let was_leaf = left.view().is_leaf();
            let (sep_key, sep_value) = left.view().entry(MIN_CHILDREN);
            left.set_count(MIN_CHILDREN);
            par.insert_entry_at(pos, sep_key, sep_value);

            let mut from = MIN_CHILDREN;
            if was_leaf {
                right.set_right(left.view().right());
                left.set_right(new_num);
            } else {
                from += 1;
            }
            let mut to = 0;
            while from < old_count {
                right.set_child(to, left.view().child(from));
                let (k, v) = left.view().entry(from);
                right.set_entry(to, k, v);
                to += 1;
                from += 1;
            }
            right.set_child(to, left.view().child(from));
            right.set_count(to);

            par.set_child(pos, left.view().page_num());
            par.set_child(pos + 1, new_num);
            debug!(
                parent_page = par.view().page_num(),
                left = left.view().page_num(),
                right = new_num,
                separator = sep_key,
                leaf = was_leaf,
                "btree node split"
            );
        }
        parent.mark_dirty();
        child.mark_dirty();
        new_page.mark_dirty();
        Ok(())
    }

    /// Splits an overflowed root in place: the root's contents move into
    /// two fresh children and the root becomes an internal node with a
    /// single separator. The root's page number never changes.
    fn split_root(&self, root: &PageRef<'_>) -> Result<()> {
        let left_num = self.pool.allocate()?;
        let right_num = self.pool.allocate()?;
        let left_page = self.pool.pin(left_num, AccessMode::Write)?;
        let right_page = self.pool.pin(right_num, AccessMode::Write)?;
        {
            let mut root_guard = root.data_mut();
            let mut rootv = NodeViewMut::new(&mut root_guard[..]);
            let mut left_guard = left_page.data_mut();
            let mut left = NodeViewMut::new(&mut left_guard[..]);
            left.init(left_num);
            let mut right_guard = right_page.data_mut();
            let mut right = NodeViewMut::new(&mut right_guard[..]);
            right.init(right_num);

            let old_count = rootv.view().count();
            let was_leaf = rootv.view().is_leaf();

            for i in 0..MIN_CHILDREN {
                left.set_child(i, rootv.view().child(i));
                let (k, v) = rootv.view().entry(i);
                left.set_entry(i, k, v);
            }
            left.set_child(MIN_CHILDREN, rootv.view().child(MIN_CHILDREN));
            left.set_count(MIN_CHILDREN);
            left.set_right(right_num);

            let (sep_key, sep_value) = rootv.view().entry(MIN_CHILDREN);
            let mut from = if was_leaf {
                MIN_CHILDREN
            } else {
                MIN_CHILDREN + 1
            };
            let mut to = 0;
            while from < old_count {
                right.set_child(to, rootv.view().child(from));
                let (k, v) = rootv.view().entry(from);
                right.set_entry(to, k, v);
                to += 1;
                from += 1;
            }
            right.set_child(to, rootv.view().child(from));
            right.set_count(to);

            rootv.set_entry(0, sep_key, sep_value);
            rootv.set_child(0, left_num);
            rootv.set_child(1, right_num);
            rootv.set_count(1);
            debug!(
                left = left_num,
                right = right_num,
                separator = sep_key,
                leaf = was_leaf,
                "btree root split"
            );
        }
        root.mark_dirty();
        left_page.mark_dirty();
        right_page.mark_dirty();
        Ok(())
    }
}
