//! In-process ordered table
//!
//! A `BTreeSet` of items behind a `parking_lot::RwLock`. Search handles
//! keep an owned cursor and take a short read lock per step, so writers
//! and compaction interleave with long scans instead of blocking behind
//! them.
//!
//! Compaction holds the write lock for the whole rewrite: the merge
//! callback sees one consistent sorted run and no concurrently added item
//! can be lost between snapshot and replacement. An auto-compaction
//! threshold bounds how many un-merged items accumulate between explicit
//! `compact` calls.

use crate::{MergeBlock, Table, TableCallbacks, TableSearch};
use parking_lot::RwLock;
use series_core::{Error, Result};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Items inserted since the last compaction before one is triggered
pub const DEFAULT_AUTO_COMPACT_ITEMS: usize = 64 * 1024;

/// In-memory ordered table backing one index generation
pub struct MemTable {
    path: PathBuf,
    items: Arc<RwLock<BTreeSet<Vec<u8>>>>,
    callbacks: TableCallbacks,
    pending_since_compact: AtomicUsize,
    auto_compact_items: usize,
}

impl MemTable {
    /// Open a table rooted at `path`, creating the directory
    ///
    /// The directory is the unit of generation: the shell that owns this
    /// table removes it on drop-on-close.
    pub fn open(path: &Path, callbacks: TableCallbacks) -> Result<Arc<MemTable>> {
        std::fs::create_dir_all(path)?;
        Ok(Arc::new(MemTable {
            path: path.to_path_buf(),
            items: Arc::new(RwLock::new(BTreeSet::new())),
            callbacks,
            pending_since_compact: AtomicUsize::new(0),
            auto_compact_items: DEFAULT_AUTO_COMPACT_ITEMS,
        }))
    }

    /// Open with a custom auto-compaction threshold
    pub fn open_with_auto_compact(
        path: &Path,
        callbacks: TableCallbacks,
        auto_compact_items: usize,
    ) -> Result<Arc<MemTable>> {
        std::fs::create_dir_all(path)?;
        Ok(Arc::new(MemTable {
            path: path.to_path_buf(),
            items: Arc::new(RwLock::new(BTreeSet::new())),
            callbacks,
            pending_since_compact: AtomicUsize::new(0),
            auto_compact_items,
        }))
    }
}

impl Table for MemTable {
    fn add_items(&self, items: Vec<Vec<u8>>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let added = items.len();
        {
            let mut set = self.items.write();
            for item in items {
                set.insert(item);
            }
        }
        // The batch is visible to new searches; notify before auto-compact
        // so flush-driven cache versioning sees every insert.
        if let Some(flush) = &self.callbacks.flush {
            flush();
        }
        let pending = self.pending_since_compact.fetch_add(added, Ordering::AcqRel) + added;
        if pending >= self.auto_compact_items {
            self.compact()?;
        }
        Ok(())
    }

    fn search(&self) -> Box<dyn TableSearch> {
        Box::new(MemTableSearch {
            items: Arc::clone(&self.items),
            cur: Vec::new(),
            lower_bound: Some(Vec::new()),
            err: None,
        })
    }

    fn compact(&self) -> Result<()> {
        let Some(merge) = self.callbacks.merge.clone() else {
            self.pending_since_compact.store(0, Ordering::Release);
            return Ok(());
        };
        let mut set = self.items.write();
        let before = set.len();
        let mut block = MergeBlock::from_items(set.iter().cloned());
        merge(&mut block);
        let mut rewritten = BTreeSet::new();
        for item in block.iter() {
            rewritten.insert(item.to_vec());
        }
        let after = rewritten.len();
        *set = rewritten;
        drop(set);
        self.pending_since_compact.store(0, Ordering::Release);
        debug!(path = %self.path.display(), before, after, "compacted table");
        Ok(())
    }

    fn len(&self) -> usize {
        self.items.read().len()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn must_close(&self) {
        self.items.write().clear();
    }
}

/// Cursor over a [`MemTable`]
///
/// `cur` holds an owned copy of the current item; each step re-enters the
/// set under a read lock and finds the next item past `cur`, so the cursor
/// stays valid across concurrent inserts and compactions.
struct MemTableSearch {
    items: Arc<RwLock<BTreeSet<Vec<u8>>>>,
    cur: Vec<u8>,
    /// Inclusive lower bound set by `seek`; `None` once iteration started
    lower_bound: Option<Vec<u8>>,
    err: Option<Error>,
}

impl TableSearch for MemTableSearch {
    fn seek(&mut self, prefix: &[u8]) {
        self.lower_bound = Some(prefix.to_vec());
        self.cur.clear();
        self.err = None;
    }

    fn next_item(&mut self) -> bool {
        let set = self.items.read();
        let next = match self.lower_bound.take() {
            Some(lb) => set
                .range::<[u8], _>((Bound::Included(lb.as_slice()), Bound::Unbounded))
                .next()
                .cloned(),
            None => set
                .range::<[u8], _>((Bound::Excluded(self.cur.as_slice()), Bound::Unbounded))
                .next()
                .cloned(),
        };
        match next {
            Some(item) => {
                self.cur = item;
                true
            }
            None => false,
        }
    }

    fn current_item(&self) -> &[u8] {
        &self.cur
    }

    fn first_item_with_prefix(&mut self, prefix: &[u8]) -> bool {
        self.seek(prefix);
        self.next_item() && self.cur.starts_with(prefix)
    }

    fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_plain(dir: &Path) -> Arc<MemTable> {
        MemTable::open(dir, TableCallbacks::default()).unwrap()
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gen-1");
        let table = open_plain(&path);
        assert!(path.is_dir());
        assert!(table.is_empty());
    }

    #[test]
    fn test_items_iterate_in_sorted_order() {
        let dir = tempdir().unwrap();
        let table = open_plain(dir.path());
        table
            .add_items(vec![b"b".to_vec(), b"a".to_vec(), b"c".to_vec()])
            .unwrap();

        let mut search = table.search();
        search.seek(b"");
        let mut seen = Vec::new();
        while search.next_item() {
            seen.push(search.current_item().to_vec());
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(search.error().is_none());
    }

    #[test]
    fn test_seek_positions_at_first_ge_item() {
        let dir = tempdir().unwrap();
        let table = open_plain(dir.path());
        table
            .add_items(vec![b"aa".to_vec(), b"ab".to_vec(), b"b".to_vec()])
            .unwrap();

        let mut search = table.search();
        search.seek(b"ab");
        assert!(search.next_item());
        assert_eq!(search.current_item(), b"ab");
        assert!(search.next_item());
        assert_eq!(search.current_item(), b"b");
        assert!(!search.next_item());
    }

    #[test]
    fn test_first_item_with_prefix() {
        let dir = tempdir().unwrap();
        let table = open_plain(dir.path());
        table
            .add_items(vec![b"key1".to_vec(), b"key2".to_vec()])
            .unwrap();

        let mut search = table.search();
        assert!(search.first_item_with_prefix(b"key"));
        assert_eq!(search.current_item(), b"key1");
        assert!(!search.first_item_with_prefix(b"nope"));
    }

    #[test]
    fn test_duplicate_items_are_deduplicated() {
        let dir = tempdir().unwrap();
        let table = open_plain(dir.path());
        table.add_items(vec![b"x".to_vec(), b"x".to_vec()]).unwrap();
        table.add_items(vec![b"x".to_vec()]).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_flush_callback_fires_per_batch() {
        use std::sync::atomic::AtomicU64;

        let dir = tempdir().unwrap();
        let flushes = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&flushes);
        let callbacks = TableCallbacks {
            flush: Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            })),
            merge: None,
        };
        let table = MemTable::open(dir.path(), callbacks).unwrap();

        table.add_items(vec![b"a".to_vec()]).unwrap();
        table.add_items(vec![b"b".to_vec(), b"c".to_vec()]).unwrap();
        table.add_items(Vec::new()).unwrap(); // empty batch: no flush
        assert_eq!(flushes.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_compact_applies_merge_callback() {
        let dir = tempdir().unwrap();
        // Merge callback that drops every item starting with '_'.
        let callbacks = TableCallbacks {
            flush: None,
            merge: Some(Arc::new(|block: &mut MergeBlock| {
                let kept: Vec<Vec<u8>> = block
                    .iter()
                    .filter(|item| !item.starts_with(b"_"))
                    .map(|item| item.to_vec())
                    .collect();
                *block = MergeBlock::from_items(kept);
            })),
        };
        let table = MemTable::open(dir.path(), callbacks).unwrap();
        table
            .add_items(vec![b"_tmp".to_vec(), b"live".to_vec()])
            .unwrap();

        table.compact().unwrap();
        assert_eq!(table.len(), 1);
        let mut search = table.search();
        assert!(search.first_item_with_prefix(b"live"));
    }

    #[test]
    fn test_auto_compact_triggers_at_threshold() {
        let dir = tempdir().unwrap();
        let callbacks = TableCallbacks {
            flush: None,
            merge: Some(Arc::new(|block: &mut MergeBlock| {
                let kept: Vec<Vec<u8>> = block
                    .iter()
                    .filter(|item| !item.starts_with(b"_"))
                    .map(|item| item.to_vec())
                    .collect();
                *block = MergeBlock::from_items(kept);
            })),
        };
        let table = MemTable::open_with_auto_compact(dir.path(), callbacks, 2).unwrap();
        table
            .add_items(vec![b"_a".to_vec(), b"b".to_vec()])
            .unwrap();
        // Threshold reached: the '_' item is already gone without an
        // explicit compact call.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_randomized_inserts_iterate_sorted() {
        use rand::seq::SliceRandom;

        let dir = tempdir().unwrap();
        let table = open_plain(dir.path());
        let mut items: Vec<Vec<u8>> = (0..500u32).map(|i| i.to_be_bytes().to_vec()).collect();
        items.shuffle(&mut rand::thread_rng());
        for chunk in items.chunks(37) {
            table.add_items(chunk.to_vec()).unwrap();
        }

        let mut search = table.search();
        search.seek(b"");
        let mut prev: Option<Vec<u8>> = None;
        let mut count = 0;
        while search.next_item() {
            let item = search.current_item().to_vec();
            if let Some(prev) = &prev {
                assert!(prev < &item);
            }
            prev = Some(item);
            count += 1;
        }
        assert_eq!(count, 500);
    }

    #[test]
    fn test_cursor_survives_concurrent_insert() {
        let dir = tempdir().unwrap();
        let table = open_plain(dir.path());
        table.add_items(vec![b"a".to_vec(), b"c".to_vec()]).unwrap();

        let mut search = table.search();
        search.seek(b"");
        assert!(search.next_item());
        assert_eq!(search.current_item(), b"a");

        // Insert between the cursor and the next item mid-iteration.
        table.add_items(vec![b"b".to_vec()]).unwrap();
        assert!(search.next_item());
        assert_eq!(search.current_item(), b"b");
        assert!(search.next_item());
        assert_eq!(search.current_item(), b"c");
    }
}
