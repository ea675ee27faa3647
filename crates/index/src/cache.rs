//! Bounded working-set caches
//!
//! All index caches share one shape: a byte-budgeted map split into a
//! current and a previous generation. Inserts land in the current
//! generation; once it reaches half the budget the generations rotate and
//! the old previous generation is dropped wholesale. Entries that keep
//! being read survive rotation through promotion; everything else ages
//! out without per-entry bookkeeping.
//!
//! Values are immutable `Arc<[u8]>` blobs, so readers never copy and the
//! caches never lock around user data.

use dashmap::DashMap;
use parking_lot::RwLock;
use series_core::{Error, Result, Tsid, TSID_LEN};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Approximate per-entry overhead added to the byte accounting
const ENTRY_OVERHEAD: usize = 40;

struct Generations {
    cur: DashMap<Vec<u8>, Arc<[u8]>>,
    prev: DashMap<Vec<u8>, Arc<[u8]>>,
}

/// Byte-budgeted two-generation cache
pub struct WorkingSetCache {
    gens: RwLock<Generations>,
    max_bytes: usize,
    cur_bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl WorkingSetCache {
    /// Create a cache with the given byte budget
    pub fn new(max_bytes: usize) -> Self {
        WorkingSetCache {
            gens: RwLock::new(Generations {
                cur: DashMap::new(),
                prev: DashMap::new(),
            }),
            max_bytes: max_bytes.max(ENTRY_OVERHEAD * 2),
            cur_bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a key, promoting previous-generation hits
    pub fn get(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        let gens = self.gens.read();
        if let Some(entry) = gens.cur.get(key) {
            let value = Arc::clone(entry.value());
            drop(entry);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }
        if let Some(entry) = gens.prev.get(key) {
            let value = Arc::clone(entry.value());
            drop(entry);
            gens.cur.insert(key.to_vec(), Arc::clone(&value));
            self.cur_bytes
                .fetch_add(key.len() + value.len() + ENTRY_OVERHEAD, Ordering::AcqRel);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace an entry
    ///
    /// Replacement does not reclaim the old entry's bytes from the
    /// accounting; the rotation budget absorbs the drift.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        let added = key.len() + value.len() + ENTRY_OVERHEAD;
        {
            let gens = self.gens.read();
            gens.cur.insert(key.to_vec(), Arc::from(value));
        }
        let bytes = self.cur_bytes.fetch_add(added, Ordering::AcqRel) + added;
        if bytes >= self.max_bytes / 2 {
            self.rotate();
        }
    }

    /// Whether a key is present in either generation, without promotion
    pub fn contains(&self, key: &[u8]) -> bool {
        let gens = self.gens.read();
        gens.cur.contains_key(key) || gens.prev.contains_key(key)
    }

    /// Entries across both generations; keys in both count twice
    pub fn len(&self) -> usize {
        let gens = self.gens.read();
        gens.cur.len() + gens.prev.len()
    }

    /// Whether both generations are empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Drop every entry in both generations
    ///
    /// Used on deletion, where version-free keys (the external
    /// generation's) cannot be orphaned by a counter bump.
    pub fn reset(&self) {
        let mut gens = self.gens.write();
        gens.cur = DashMap::new();
        gens.prev = DashMap::new();
        self.cur_bytes.store(0, Ordering::Release);
    }

    fn rotate(&self) {
        let mut gens = self.gens.write();
        // Re-check under the write lock; a racing rotation already reset
        // the byte counter.
        if self.cur_bytes.load(Ordering::Acquire) < self.max_bytes / 2 {
            return;
        }
        let dropped = gens.prev.len();
        gens.prev = std::mem::replace(&mut gens.cur, DashMap::new());
        self.cur_bytes.store(0, Ordering::Release);
        debug!(dropped, "rotated working-set cache generation");
    }
}

/// Compress a sorted TSID list for the tag-filters cache
pub fn compress_tsids(tsids: &[Tsid]) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(tsids.len() * TSID_LEN);
    for tsid in tsids {
        tsid.marshal(&mut raw);
    }
    Ok(zstd::encode_all(raw.as_slice(), 1)?)
}

/// Decompress a tag-filters cache value back into TSIDs
pub fn decompress_tsids(data: &[u8]) -> Result<Vec<Tsid>> {
    let raw = zstd::decode_all(data)
        .map_err(|err| Error::corruption(format!("cannot decompress TSID list: {err}")))?;
    if raw.len() % TSID_LEN != 0 {
        return Err(Error::corruption(format!(
            "decompressed TSID list length {} is not a multiple of {}",
            raw.len(),
            TSID_LEN
        )));
    }
    let mut tsids = Vec::with_capacity(raw.len() / TSID_LEN);
    let mut tail: &[u8] = &raw;
    while !tail.is_empty() {
        let (tsid, rest) = Tsid::unmarshal(tail)?;
        tsids.push(tsid);
        tail = rest;
    }
    Ok(tsids)
}
