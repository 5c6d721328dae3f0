//! End-to-end scenarios over the paged storage stack.

use quarry::btree::PagedBTree;
use quarry::hash::PagedHashTable;
use quarry::paged::{AccessMode, BufferPool, PagedFile, PagedFileOptions};
use quarry::{PageBuf, PAGE_SIZE};
use tempfile::tempdir;

fn file_options() -> PagedFileOptions {
    PagedFileOptions {
        initial_size: 256 * PAGE_SIZE as u64,
        truncate: true,
        direct_io: false,
        fsync_on_write: false,
        file_id: 1,
    }
}

/// S1: insert out of order, find everything, miss on both sides, and
/// observe at least one split once the tree outgrows a single page.
#[test]
fn btree_round_trip_with_split_evidence() {
    let dir = tempdir().unwrap();
    let tree = PagedBTree::open(dir.path().join("s1.db"), 32, file_options()).unwrap();
    for key in [1u64, 3, 5, 7, 9, 2, 4, 6, 8, 10] {
        assert!(tree.insert(key, key).unwrap());
    }
    for key in 1..=10u64 {
        assert_eq!(tree.find(key).unwrap(), Some(key));
    }
    assert_eq!(tree.find(0).unwrap(), None);
    assert_eq!(tree.find(11).unwrap(), None);

    // Grow past one node so a split provably happened.
    for key in 11..=2_000u64 {
        assert!(tree.insert(key, key).unwrap());
    }
    assert!(tree.allocated_pages() > 1);
    for key in 1..=2_000u64 {
        assert_eq!(tree.find(key).unwrap(), Some(key));
    }
}

/// S2: with two frames, the access pattern 1, 2, 1, 3 must evict page 2
/// (page 1 had its reference bit refreshed) and keep page 1 resident.
#[test]
fn clock_eviction_prefers_unreferenced_page() {
    let dir = tempdir().unwrap();
    let file = PagedFile::open(dir.path().join("s2.db"), file_options()).unwrap();
    let pool = BufferPool::new(file, 2).unwrap();
    for page in [1u32, 2, 1, 3] {
        pool.pin(page, AccessMode::Read).unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 3);

    pool.pin(1, AccessMode::Read).unwrap();
    assert_eq!(pool.stats().hits, 2, "page 1 should still be resident");
    pool.pin(2, AccessMode::Read).unwrap();
    assert_eq!(pool.stats().misses, 4, "page 2 should have been evicted");
}

/// S3: a single-bucket table loaded with 1000 keys and drained to one
/// collapses its chain to a single page holding exactly the survivor.
#[test]
fn hash_chain_compacts_to_one_page() {
    let dir = tempdir().unwrap();
    let table = PagedHashTable::create(dir.path().join("s3.db"), 1, 16, file_options()).unwrap();
    for key in 1..=1_000u64 {
        assert!(table.insert(key, key * 7).unwrap());
    }
    for key in 1..=999u64 {
        assert!(table.erase(key).unwrap());
    }
    let chain = table.bucket_chain(0).unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].n_entries, 1);
    assert_eq!(chain[0].live_slots, 1);
    assert_eq!(table.search(1_000).unwrap(), Some(7_000));
    assert_eq!(table.search(999).unwrap(), None);
}

/// Buffer-pool durability: every page ever marked dirty is on disk with
/// its last bytes after finalize.
#[test]
fn finalize_makes_dirty_pages_durable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("durable.db");
    {
        let file = PagedFile::open(&path, file_options()).unwrap();
        let pool = BufferPool::new(file, 4).unwrap();
        for page in 1..=16u32 {
            let handle = pool.pin(page, AccessMode::Write).unwrap();
            handle.data_mut()[7] = page as u8;
            handle.mark_dirty();
        }
        pool.finalize().unwrap();
    }
    let mut reopen = file_options();
    reopen.truncate = false;
    let file = PagedFile::open(&path, reopen).unwrap();
    let mut buf = PageBuf::zeroed();
    for page in 1..=16u32 {
        file.read_page(page, &mut buf).unwrap();
        assert_eq!(buf[7], page as u8);
    }
}

/// Free-list soundness: allocations never hand out a live page twice, and
/// every page is either live, free, or beyond the high-water mark.
#[test]
fn free_list_never_duplicates_live_pages() {
    let dir = tempdir().unwrap();
    let mut file = PagedFile::open(dir.path().join("freelist.db"), file_options()).unwrap();
    let mut live = std::collections::HashSet::new();
    for _ in 0..64 {
        assert!(live.insert(file.allocate_page().unwrap()));
    }
    let mut freed = Vec::new();
    for page in live.iter().copied().take(32).collect::<Vec<_>>() {
        live.remove(&page);
        file.free_page(page).unwrap();
        freed.push(page);
    }
    for _ in 0..48 {
        let page = file.allocate_page().unwrap();
        assert!(live.insert(page), "page {page} was handed out twice");
    }
    for page in &live {
        assert!(*page <= file.highest_page());
    }
}
