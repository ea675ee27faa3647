//! Generation shell and public operations
//!
//! An [`IndexDb`] is one on-disk generation: a table plus its tag-filter
//! cache, tombstone set and reference count. During retention rollover
//! two generations coexist; the newer one holds the older behind
//! [`set_ext_db`](IndexDb::set_ext_db) and consults it read-only to
//! preserve metric ids and serve queries over not-yet-migrated series.
//!
//! Reference counting governs teardown, not memory: the last `dec_ref`
//! closes the table and, when the drop flag is set, removes the
//! generation directory. Every access to the external generation borrows
//! a temporary reference under a short lock — the only serialization
//! point between rollover and readers.

use crate::cache::{compress_tsids, decompress_tsids, WorkingSetCache};
use crate::config::IndexConfig;
use crate::counters::IndexCounters;
use crate::deleted::DeletedSet;
use crate::filters::TagFilters;
use crate::hour_index::RecentHourIndex;
use crate::idset::MetricIdSet;
use crate::key::{
    escaped_component_len, increment_trailing_separator, marshal_tag_bytes,
    unmarshal_tag_bytes, write_common_prefix, IndexKind, TAG_SEPARATOR,
};
use crate::row::merge_tag_rows;
use crate::writer;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use series_core::encoding::{marshal_u64, unmarshal_u64};
use series_core::{
    Error, MetricId, MetricName, Result, TenantId, TimeRange, Tsid, MSECS_PER_DAY,
};
use series_table::{MemTable, MergeBlock, Table, TableCallbacks};
use std::cell::Cell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Consecutive name-lookup misses before a thread starts skipping the probe
const LOOKUP_SKIP_AFTER_MISSES: u32 = 100;

/// Skipped probes before a thread resumes looking names up
const LOOKUP_SKIP_BUDGET: u32 = 10_000;

/// Upper bound used when resolving ids for deletion
const DELETE_SEARCH_MAX: usize = 1 << 30;

thread_local! {
    /// (consecutive misses, skips spent) for the bulk-insert heuristic
    static CREATE_LOOKUP_STATE: Cell<(u32, u32)> = const { Cell::new((0, 0)) };
}

/// Wall clock in Unix milliseconds
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// State shared by every generation of one index
///
/// Metric-id allocation, the id→TSID/name caches and the hour sets
/// outlive any single generation, so rollover cannot reassign ids or
/// drop the recent-hour window.
pub struct IndexShared {
    pub(crate) config: IndexConfig,
    id_seq: AtomicU64,
    pub(crate) metric_id_to_tsid_cache: WorkingSetCache,
    pub(crate) metric_id_to_name_cache: WorkingSetCache,
    pub(crate) useless_filter_cache: WorkingSetCache,
    pub(crate) date_presence_cache: WorkingSetCache,
    pub(crate) recent_hours: RecentHourIndex,
    pub(crate) counters: IndexCounters,
}

impl IndexShared {
    /// Create shared state; the id sequence is seeded from the wall clock
    /// in nanoseconds so a restarted process cannot reuse ids
    pub fn new(config: IndexConfig) -> Arc<IndexShared> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Arc::new(IndexShared {
            id_seq: AtomicU64::new(seed),
            metric_id_to_tsid_cache: WorkingSetCache::new(config.metric_id_cache_bytes()),
            metric_id_to_name_cache: WorkingSetCache::new(config.metric_name_cache_bytes()),
            useless_filter_cache: WorkingSetCache::new(config.useless_filter_cache_bytes()),
            date_presence_cache: WorkingSetCache::new(config.date_presence_cache_bytes()),
            recent_hours: RecentHourIndex::new(now_ms()),
            counters: IndexCounters::default(),
            config,
        })
    }

    /// Allocate the next metric id
    pub fn next_metric_id(&self) -> MetricId {
        self.id_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The shared operational counters
    pub fn counters(&self) -> &IndexCounters {
        &self.counters
    }

    /// The configuration this index runs with
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }
}

/// One index generation
pub struct IndexDb {
    path: PathBuf,
    pub(crate) table: Arc<dyn Table>,
    pub(crate) shared: Arc<IndexShared>,
    pub(crate) deleted: DeletedSet,
    tag_filters_cache: WorkingSetCache,
    cache_version: Arc<AtomicU64>,
    ref_count: AtomicI32,
    must_drop: AtomicBool,
    ext_db: Mutex<Option<Arc<IndexDb>>>,
}

impl IndexDb {
    /// Open a generation rooted at `path`
    ///
    /// The table's flush callback advances the tag-cache version, so
    /// every insert makes previously cached filter results unreachable.
    pub fn open(path: &Path, shared: Arc<IndexShared>) -> Result<Arc<IndexDb>> {
        let cache_version = Arc::new(AtomicU64::new(1));
        let flush_version = Arc::clone(&cache_version);
        let callbacks = TableCallbacks {
            flush: Some(Arc::new(move || {
                flush_version.fetch_add(1, Ordering::AcqRel);
            })),
            merge: Some(Arc::new(|block: &mut MergeBlock| merge_tag_rows(block))),
        };
        let table: Arc<dyn Table> = MemTable::open(path, callbacks)?;
        let db = IndexDb {
            path: path.to_path_buf(),
            table,
            tag_filters_cache: WorkingSetCache::new(shared.config.tag_filters_cache_bytes()),
            shared,
            deleted: DeletedSet::default(),
            cache_version,
            ref_count: AtomicI32::new(1),
            must_drop: AtomicBool::new(false),
            ext_db: Mutex::new(None),
        };
        db.load_deleted_metric_ids()?;
        info!(path = %path.display(), "opened index generation");
        Ok(Arc::new(db))
    }

    /// The generation directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Reference counting & rollover
    // ========================================================================

    /// Borrow the generation for out-of-band use
    pub fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a borrow; the last release tears the generation down
    pub fn dec_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "ref count underflow");
        if prev != 1 {
            return;
        }
        let ext = self.ext_db.lock().take();
        if let Some(ext) = ext {
            ext.dec_ref();
        }
        self.table.must_close();
        if self.must_drop.load(Ordering::Acquire) {
            match std::fs::remove_dir_all(&self.path) {
                Ok(()) => info!(path = %self.path.display(), "dropped index generation"),
                Err(err) => {
                    warn!(path = %self.path.display(), %err, "cannot drop index generation")
                }
            }
        }
    }

    /// Release the owner's reference
    pub fn must_close(&self) {
        self.dec_ref();
    }

    /// Remove the generation directory once the last reference is gone
    pub fn set_must_drop(&self) {
        self.must_drop.store(true, Ordering::Release);
    }

    /// Swap the previous-generation pointer
    ///
    /// The new external generation's tombstones merge into this one's
    /// in-memory set, so deletes survive rollover; the replaced external
    /// reference is released.
    pub fn set_ext_db(&self, ext: Option<Arc<IndexDb>>) {
        if let Some(ext) = &ext {
            let ext_deleted = ext.deleted.snapshot();
            if !ext_deleted.is_empty() {
                self.deleted.add_all(&ext_deleted);
            }
            ext.inc_ref();
        }
        let old = {
            let mut guard = self.ext_db.lock();
            std::mem::replace(&mut *guard, ext)
        };
        if let Some(old) = old {
            old.dec_ref();
        }
    }

    /// Run `f` against the external generation, if any, under a borrow
    pub(crate) fn with_ext_db<R>(&self, f: impl FnOnce(&IndexDb) -> R) -> Option<R> {
        let ext = {
            let guard = self.ext_db.lock();
            guard.as_ref().map(|db| {
                db.inc_ref();
                Arc::clone(db)
            })
        };
        let ext = ext?;
        let result = f(&ext);
        ext.dec_ref();
        Some(result)
    }

    /// Advance the tag-cache version, making cached filter results stale
    pub(crate) fn bump_cache_version(&self) {
        self.cache_version.fetch_add(1, Ordering::AcqRel);
    }

    /// Run a compaction pass over the generation's table
    pub fn compact(&self) -> Result<()> {
        self.table.compact()
    }

    // ========================================================================
    // Series creation
    // ========================================================================

    /// Resolve the TSID for a metric name, creating the series on miss
    ///
    /// The external generation is probed before allocating so ids survive
    /// rollover; a hit there re-emits the series' rows into this
    /// generation. Duplicate creation under a race is tolerated: readers
    /// deduplicate by metric id.
    pub fn get_or_create_tsid_by_name(&self, mn: &MetricName) -> Result<Tsid> {
        let mut canonical = mn.clone();
        canonical.sort_tags();

        if !should_skip_name_lookup() {
            if let Some(tsid) = self.tsid_by_name(&canonical)? {
                note_name_lookup_hit();
                return Ok(tsid);
            }
            note_name_lookup_miss();
        }

        if let Some(tsid) = self
            .with_ext_db(|ext| ext.tsid_by_name(&canonical))
            .transpose()?
            .flatten()
        {
            self.create_series_with_tsid(&canonical, tsid)?;
            return Ok(tsid);
        }

        let metric_id = self.shared.next_metric_id();
        let tsid = Tsid::for_metric_name(&canonical, metric_id);
        self.create_series_with_tsid(&canonical, tsid)?;
        Ok(tsid)
    }

    fn create_series_with_tsid(&self, mn: &MetricName, tsid: Tsid) -> Result<()> {
        let rows = writer::index_rows_for_series(&tsid, mn)?;
        self.table.add_items(rows)
    }

    /// Exact name→TSID lookup; tombstoned series read as absent
    fn tsid_by_name(&self, mn: &MetricName) -> Result<Option<Tsid>> {
        let mut key = vec![IndexKind::MetricNameToTsid.as_byte()];
        mn.marshal(&mut key)?;
        key.push(TAG_SEPARATOR);

        let mut search = self.table.search();
        if !search.first_item_with_prefix(&key) {
            if let Some(err) = search.error() {
                return Err(err.clone());
            }
            return Ok(None);
        }
        let (tsid, tail) = Tsid::unmarshal(&search.current_item()[key.len()..])?;
        if !tail.is_empty() {
            return Err(Error::corruption(
                "trailing bytes after TSID in name index row",
            ));
        }
        if self.deleted.contains(tsid.metric_id) {
            return Ok(None);
        }
        Ok(Some(tsid))
    }

    // ========================================================================
    // Per-day and recent-hour registration
    // ========================================================================

    /// Record that a series received a sample at `timestamp_ms`
    ///
    /// Feeds the hour sets and lazily writes the (tenant, day, id) row,
    /// guarded by the presence cache so steady-state ingestion stays
    /// write-free.
    pub fn register_metric_id(
        &self,
        tenant: TenantId,
        metric_id: MetricId,
        timestamp_ms: i64,
    ) -> Result<()> {
        self.shared.recent_hours.register(tenant, metric_id, timestamp_ms);

        let day = timestamp_ms / MSECS_PER_DAY;
        let mut presence_key = Vec::with_capacity(24);
        tenant.marshal(&mut presence_key);
        marshal_u64(&mut presence_key, day as u64);
        marshal_u64(&mut presence_key, metric_id);
        if self.shared.date_presence_cache.get(&presence_key).is_some() {
            return Ok(());
        }
        if !self.has_date_metric_id(tenant, day, metric_id)? {
            self.table
                .add_items(vec![writer::date_row(tenant, day, metric_id)])?;
        }
        self.shared.date_presence_cache.put(&presence_key, &[1]);
        Ok(())
    }

    /// Exact (tenant, day, id) existence check
    fn has_date_metric_id(&self, tenant: TenantId, day: i64, metric_id: MetricId) -> Result<bool> {
        let mut key = Vec::new();
        write_common_prefix(&mut key, IndexKind::DateToMetricId, tenant);
        marshal_u64(&mut key, day as u64);
        marshal_u64(&mut key, metric_id);

        let mut search = self.table.search();
        if !search.first_item_with_prefix(&key) {
            if let Some(err) = search.error() {
                return Err(err.clone());
            }
            return Ok(false);
        }
        // A row extending past the full key should be impossible: date
        // rows carry nothing after the id.
        if search.current_item() != key.as_slice() {
            return Err(Error::corruption(format!(
                "unexpected item found for (date, metric id) key; got {} bytes, want {}",
                search.current_item().len(),
                key.len()
            )));
        }
        Ok(true)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Resolve the marshaled metric name for an id
    ///
    /// Falls back to the previous generation; hits are cached either way.
    pub fn search_metric_name(
        &self,
        metric_id: MetricId,
        tenant: TenantId,
    ) -> Result<Option<Vec<u8>>> {
        let mut cache_key = Vec::with_capacity(16);
        tenant.marshal(&mut cache_key);
        marshal_u64(&mut cache_key, metric_id);
        if let Some(name) = self.shared.metric_id_to_name_cache.get(&cache_key) {
            return Ok(Some(name.to_vec()));
        }

        let mut key = Vec::new();
        write_common_prefix(&mut key, IndexKind::MetricIdToMetricName, tenant);
        marshal_u64(&mut key, metric_id);
        let mut search = self.table.search();
        if search.first_item_with_prefix(&key) {
            let name = search.current_item()[key.len()..].to_vec();
            // Validate before caching: a corrupt row must not poison the
            // cache.
            MetricName::unmarshal(&name)?;
            self.shared.metric_id_to_name_cache.put(&cache_key, &name);
            return Ok(Some(name));
        }
        if let Some(err) = search.error() {
            return Err(err.clone());
        }

        match self.with_ext_db(|ext| ext.search_metric_name(metric_id, tenant)) {
            Some(result) => result,
            None => Ok(None),
        }
    }

    /// (tenant, id) → TSID lookup within this generation
    pub(crate) fn tsid_by_metric_id(
        &self,
        tenant: TenantId,
        metric_id: MetricId,
    ) -> Result<Option<Tsid>> {
        let mut cache_key = Vec::with_capacity(16);
        tenant.marshal(&mut cache_key);
        marshal_u64(&mut cache_key, metric_id);
        if let Some(blob) = self.shared.metric_id_to_tsid_cache.get(&cache_key) {
            let (tsid, _) = Tsid::unmarshal(&blob)?;
            return Ok(Some(tsid));
        }

        let mut key = Vec::new();
        write_common_prefix(&mut key, IndexKind::MetricIdToTsid, tenant);
        marshal_u64(&mut key, metric_id);
        let mut search = self.table.search();
        if !search.first_item_with_prefix(&key) {
            if let Some(err) = search.error() {
                return Err(err.clone());
            }
            return Ok(None);
        }
        let (tsid, tail) = Tsid::unmarshal(&search.current_item()[key.len()..])?;
        if !tail.is_empty() {
            return Err(Error::corruption(
                "trailing bytes after TSID in id index row",
            ));
        }
        let mut blob = Vec::with_capacity(32);
        tsid.marshal(&mut blob);
        self.shared.metric_id_to_tsid_cache.put(&cache_key, &blob);
        Ok(Some(tsid))
    }

    /// Assemble TSIDs for resolved ids, tolerating missing rows
    pub(crate) fn tsids_for_metric_ids(
        &self,
        tenant: TenantId,
        ids: &MetricIdSet,
    ) -> Result<Vec<Tsid>> {
        let mut tsids = Vec::with_capacity(ids.len());
        for metric_id in ids.iter() {
            match self.tsid_by_metric_id(tenant, metric_id)? {
                Some(tsid) => tsids.push(tsid),
                None => {
                    // Transiently absent after snapshot or before flush;
                    // skip and count, this is not corruption.
                    IndexCounters::inc(&self.shared.counters.missing_tsids_for_metric_id);
                }
            }
        }
        Ok(tsids)
    }

    // ========================================================================
    // Query operations
    // ========================================================================

    /// Resolve filter clauses to sorted TSIDs over both generations
    pub fn search_tsids(
        &self,
        tfss: &[TagFilters],
        tr: TimeRange,
        max_metrics: usize,
    ) -> Result<Vec<Tsid>> {
        let local = self.search_tsids_in_db(tfss, tr, max_metrics, true)?;
        let ext = self
            .with_ext_db(|ext| ext.search_tsids_in_db(tfss, tr, max_metrics, false))
            .transpose()?;
        let mut merged = match ext {
            Some(ext_tsids) if !ext_tsids.is_empty() => merge_tsids(&local, &ext_tsids),
            _ => local,
        };
        merged.sort();
        Ok(merged)
    }

    /// One generation's share of `search_tsids`, memoized in the
    /// tag-filters cache
    fn search_tsids_in_db(
        &self,
        tfss: &[TagFilters],
        tr: TimeRange,
        max_metrics: usize,
        versioned: bool,
    ) -> Result<Vec<Tsid>> {
        let cache_key = self.tag_filters_cache_key(tfss, tr, versioned);
        if let Some(blob) = self.tag_filters_cache.get(&cache_key) {
            return decompress_tsids(&blob);
        }

        let per_tenant = self.search_metric_ids(tfss, tr, max_metrics)?;
        let mut tsids = Vec::new();
        for (tenant, ids) in &per_tenant {
            tsids.extend(self.tsids_for_metric_ids(*tenant, ids)?);
        }
        tsids.sort();

        let blob = compress_tsids(&tsids)?;
        self.tag_filters_cache.put(&cache_key, &blob);
        Ok(tsids)
    }

    /// Cache key for one generation's filter results
    ///
    /// The current generation includes the flush-driven version, so
    /// inserts orphan old entries. The external generation is read-only
    /// and keeps version-free keys.
    fn tag_filters_cache_key(&self, tfss: &[TagFilters], tr: TimeRange, versioned: bool) -> Vec<u8> {
        let mut key = Vec::new();
        if versioned {
            key.push(1);
            marshal_u64(&mut key, self.cache_version.load(Ordering::Acquire));
        } else {
            key.push(0);
        }
        marshal_u64(&mut key, tr.min_timestamp as u64);
        marshal_u64(&mut key, tr.max_timestamp as u64);
        for tfs in tfss {
            tfs.marshal_shape(&mut key);
        }
        key
    }

    /// List the tag keys of a tenant across both generations
    pub fn search_tag_keys(&self, tenant: TenantId, max_keys: usize) -> Result<Vec<Vec<u8>>> {
        let mut keys = BTreeSet::new();
        self.collect_tag_keys(tenant, max_keys, &mut keys)?;
        if let Some(result) =
            self.with_ext_db(|ext| ext.collect_tag_keys(tenant, max_keys, &mut keys))
        {
            result?;
        }
        Ok(keys.into_iter().take(max_keys).collect())
    }

    fn collect_tag_keys(
        &self,
        tenant: TenantId,
        max_keys: usize,
        out: &mut BTreeSet<Vec<u8>>,
    ) -> Result<()> {
        let mut common = Vec::new();
        write_common_prefix(&mut common, IndexKind::TagToMetricIds, tenant);
        let mut search = self.table.search();
        let mut seek_key = common.clone();
        loop {
            if out.len() >= max_keys {
                break;
            }
            search.seek(&seek_key);
            if !search.next_item() {
                break;
            }
            let next = {
                let item = search.current_item();
                if !item.starts_with(&common) {
                    None
                } else {
                    let tail = &item[common.len()..];
                    let (key, _) = unmarshal_tag_bytes(tail)?;
                    let escaped_len = escaped_component_len(tail)?;
                    out.insert(key);
                    // Skip every value and id row of this key.
                    let mut next = item[..common.len() + escaped_len].to_vec();
                    increment_trailing_separator(&mut next)?;
                    Some(next)
                }
            };
            match next {
                Some(next) => seek_key = next,
                None => break,
            }
        }
        if let Some(err) = search.error() {
            return Err(err.clone());
        }
        Ok(())
    }

    /// List the values of one tag key across both generations
    pub fn search_tag_values(
        &self,
        tenant: TenantId,
        tag_key: &[u8],
        max_values: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let mut values = BTreeSet::new();
        self.collect_tag_values(tenant, tag_key, max_values, &mut values)?;
        if let Some(result) =
            self.with_ext_db(|ext| ext.collect_tag_values(tenant, tag_key, max_values, &mut values))
        {
            result?;
        }
        Ok(values.into_iter().take(max_values).collect())
    }

    fn collect_tag_values(
        &self,
        tenant: TenantId,
        tag_key: &[u8],
        max_values: usize,
        out: &mut BTreeSet<Vec<u8>>,
    ) -> Result<()> {
        let mut prefix = Vec::new();
        write_common_prefix(&mut prefix, IndexKind::TagToMetricIds, tenant);
        marshal_tag_bytes(&mut prefix, tag_key);
        let mut search = self.table.search();
        let mut seek_key = prefix.clone();
        loop {
            if out.len() >= max_values {
                break;
            }
            search.seek(&seek_key);
            if !search.next_item() {
                break;
            }
            let next = {
                let item = search.current_item();
                if !item.starts_with(&prefix) {
                    None
                } else {
                    let tail = &item[prefix.len()..];
                    let (value, _) = unmarshal_tag_bytes(tail)?;
                    let escaped_len = escaped_component_len(tail)?;
                    out.insert(value);
                    // Skip every id row of this value.
                    let mut next = item[..prefix.len() + escaped_len].to_vec();
                    increment_trailing_separator(&mut next)?;
                    Some(next)
                }
            };
            match next {
                Some(next) => seek_key = next,
                None => break,
            }
        }
        if let Some(err) = search.error() {
            return Err(err.clone());
        }
        Ok(())
    }

    /// Approximate live-series count; generations may double-count
    pub fn get_series_count(&self, tenant: TenantId) -> Result<u64> {
        let mut count = self.count_series_rows(tenant)?;
        if let Some(ext_count) = self
            .with_ext_db(|ext| ext.count_series_rows(tenant))
            .transpose()?
        {
            count += ext_count;
        }
        Ok(count)
    }

    fn count_series_rows(&self, tenant: TenantId) -> Result<u64> {
        let mut prefix = Vec::new();
        write_common_prefix(&mut prefix, IndexKind::MetricIdToTsid, tenant);
        let mut search = self.table.search();
        search.seek(&prefix);
        let mut count = 0u64;
        while search.next_item() {
            if !search.current_item().starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        if let Some(err) = search.error() {
            return Err(err.clone());
        }
        Ok(count)
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Tombstone every series matching the clauses; returns the count
    ///
    /// The in-memory set is updated before returning, so queries in this
    /// process stop seeing the ids even before the rows flush. The
    /// useless-filter cache is left alone: surviving candidates are still
    /// filtered by tombstones later.
    pub fn delete_tsids(&self, tfss: &[TagFilters]) -> Result<u64> {
        let tr = TimeRange::new(0, i64::MAX);
        let per_tenant = self.search_metric_ids(tfss, tr, DELETE_SEARCH_MAX)?;

        let mut all = MetricIdSet::new();
        let mut rows = Vec::new();
        for ids in per_tenant.values() {
            for metric_id in ids.iter() {
                rows.push(writer::deleted_row(metric_id));
                all.add(metric_id);
            }
        }
        let count = all.len() as u64;
        if !rows.is_empty() {
            self.table.add_items(rows)?;
            self.deleted.add_all(&all);
        }
        // The version bump orphans versioned entries; the reset covers the
        // version-free ones served when this generation is external.
        self.bump_cache_version();
        self.tag_filters_cache.reset();

        let ext_count = self
            .with_ext_db(|ext| ext.delete_tsids(tfss))
            .transpose()?
            .unwrap_or(0);
        Ok(count + ext_count)
    }

    fn load_deleted_metric_ids(&self) -> Result<()> {
        let prefix = [IndexKind::DeletedMetricId.as_byte()];
        let mut search = self.table.search();
        search.seek(&prefix);
        let mut ids = MetricIdSet::new();
        while search.next_item() {
            let item = search.current_item();
            if !item.starts_with(&prefix) {
                break;
            }
            let (metric_id, tail) = unmarshal_u64(&item[1..])?;
            if !tail.is_empty() {
                return Err(Error::corruption(
                    "trailing bytes after deleted metric id row",
                ));
            }
            ids.add(metric_id);
        }
        if let Some(err) = search.error() {
            return Err(err.clone());
        }
        if !ids.is_empty() {
            self.deleted.add_all(&ids);
        }
        Ok(())
    }
}

/// Hash-union of two generations' TSIDs, keyed by metric id
///
/// The current generation wins on collision; order is restored by the
/// caller's sort.
fn merge_tsids(local: &[Tsid], ext: &[Tsid]) -> Vec<Tsid> {
    let mut by_id: FxHashMap<MetricId, Tsid> =
        FxHashMap::with_capacity_and_hasher(local.len() + ext.len(), Default::default());
    for tsid in ext.iter().chain(local.iter()) {
        by_id.insert(tsid.metric_id, *tsid);
    }
    by_id.into_values().collect()
}

fn should_skip_name_lookup() -> bool {
    CREATE_LOOKUP_STATE.with(|state| {
        let (misses, skips) = state.get();
        if misses < LOOKUP_SKIP_AFTER_MISSES {
            return false;
        }
        if skips >= LOOKUP_SKIP_BUDGET {
            state.set((0, 0));
            return false;
        }
        state.set((misses, skips + 1));
        true
    })
}

fn note_name_lookup_hit() {
    CREATE_LOOKUP_STATE.with(|state| state.set((0, 0)));
}

fn note_name_lookup_miss() {
    CREATE_LOOKUP_STATE.with(|state| {
        let (misses, skips) = state.get();
        state.set((misses.saturating_add(1), skips));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_db(dir: &Path) -> (Arc<IndexDb>, Arc<IndexShared>) {
        let shared = IndexShared::new(IndexConfig::default());
        let db = IndexDb::open(dir, Arc::clone(&shared)).unwrap();
        (db, shared)
    }

    fn metric_name(group: &[u8], tags: &[(&[u8], &[u8])]) -> MetricName {
        let mut mn = MetricName::new(TenantId::new(1, 2), group);
        for (k, v) in tags {
            mn.add_tag(*k, *v);
        }
        mn
    }

    #[test]
    fn test_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let (db, _shared) = open_db(dir.path());
        let mn = metric_name(b"cpu", &[(b"host", b"a")]);
        let a = db.get_or_create_tsid_by_name(&mn).unwrap();
        let b = db.get_or_create_tsid_by_name(&mn).unwrap();
        assert_eq!(a, b);
        db.must_close();
    }

    #[test]
    fn test_tag_order_does_not_change_identity() {
        let dir = tempdir().unwrap();
        let (db, _shared) = open_db(dir.path());
        let a = db
            .get_or_create_tsid_by_name(&metric_name(b"cpu", &[(b"host", b"a"), (b"dc", b"x")]))
            .unwrap();
        let b = db
            .get_or_create_tsid_by_name(&metric_name(b"cpu", &[(b"dc", b"x"), (b"host", b"a")]))
            .unwrap();
        assert_eq!(a.metric_id, b.metric_id);
        db.must_close();
    }

    #[test]
    fn test_metric_ids_are_distinct_and_monotonic() {
        let dir = tempdir().unwrap();
        let (db, _shared) = open_db(dir.path());
        let a = db
            .get_or_create_tsid_by_name(&metric_name(b"cpu", &[]))
            .unwrap();
        let b = db
            .get_or_create_tsid_by_name(&metric_name(b"mem", &[]))
            .unwrap();
        assert!(b.metric_id > a.metric_id);
        db.must_close();
    }

    #[test]
    fn test_search_metric_name_round_trip() {
        let dir = tempdir().unwrap();
        let (db, _shared) = open_db(dir.path());
        let mut mn = metric_name(b"cpu", &[(b"host", b"a")]);
        mn.sort_tags();
        let tsid = db.get_or_create_tsid_by_name(&mn).unwrap();

        let name = db
            .search_metric_name(tsid.metric_id, TenantId::new(1, 2))
            .unwrap()
            .expect("name row must exist");
        assert_eq!(MetricName::unmarshal(&name).unwrap(), mn);
        // Second read hits the cache.
        assert!(db
            .search_metric_name(tsid.metric_id, TenantId::new(1, 2))
            .unwrap()
            .is_some());
        db.must_close();
    }

    #[test]
    fn test_search_metric_name_unknown_id() {
        let dir = tempdir().unwrap();
        let (db, _shared) = open_db(dir.path());
        assert!(db
            .search_metric_name(12345, TenantId::new(1, 2))
            .unwrap()
            .is_none());
        db.must_close();
    }

    #[test]
    fn test_series_count_per_tenant() {
        let dir = tempdir().unwrap();
        let (db, _shared) = open_db(dir.path());
        db.get_or_create_tsid_by_name(&metric_name(b"cpu", &[]))
            .unwrap();
        db.get_or_create_tsid_by_name(&metric_name(b"mem", &[]))
            .unwrap();
        let mut other = MetricName::new(TenantId::new(9, 9), b"cpu");
        other.sort_tags();
        db.get_or_create_tsid_by_name(&other).unwrap();

        assert_eq!(db.get_series_count(TenantId::new(1, 2)).unwrap(), 2);
        assert_eq!(db.get_series_count(TenantId::new(9, 9)).unwrap(), 1);
        assert_eq!(db.get_series_count(TenantId::new(7, 7)).unwrap(), 0);
        db.must_close();
    }

    #[test]
    fn test_tag_keys_and_values() {
        let dir = tempdir().unwrap();
        let (db, _shared) = open_db(dir.path());
        db.get_or_create_tsid_by_name(&metric_name(b"cpu", &[(b"host", b"a"), (b"dc", b"x")]))
            .unwrap();
        db.get_or_create_tsid_by_name(&metric_name(b"cpu", &[(b"host", b"b")]))
            .unwrap();

        let keys = db.search_tag_keys(TenantId::new(1, 2), 100).unwrap();
        // The empty key is the metric-group pseudo-tag.
        assert_eq!(
            keys,
            vec![b"".to_vec(), b"dc".to_vec(), b"host".to_vec()]
        );

        let values = db
            .search_tag_values(TenantId::new(1, 2), b"host", 100)
            .unwrap();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);

        let none = db
            .search_tag_values(TenantId::new(1, 2), b"rack", 100)
            .unwrap();
        assert!(none.is_empty());
        db.must_close();
    }

    #[test]
    fn test_tag_values_respect_limit() {
        let dir = tempdir().unwrap();
        let (db, _shared) = open_db(dir.path());
        for i in 0..10 {
            db.get_or_create_tsid_by_name(&metric_name(
                b"cpu",
                &[(b"host", format!("h{i}").as_bytes())],
            ))
            .unwrap();
        }
        let values = db
            .search_tag_values(TenantId::new(1, 2), b"host", 3)
            .unwrap();
        assert_eq!(values.len(), 3);
        db.must_close();
    }

    #[test]
    fn test_date_rows_written_once() {
        let dir = tempdir().unwrap();
        let (db, _shared) = open_db(dir.path());
        let tenant = TenantId::new(1, 2);
        let ts = 19_000 * MSECS_PER_DAY + 42;
        let before = db.table.len();
        db.register_metric_id(tenant, 7, ts).unwrap();
        let after_first = db.table.len();
        assert_eq!(after_first, before + 1);
        db.register_metric_id(tenant, 7, ts + 1000).unwrap();
        assert_eq!(db.table.len(), after_first);
        db.must_close();
    }

    #[test]
    fn test_ref_count_drop_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gen");
        let shared = IndexShared::new(IndexConfig::default());
        let db = IndexDb::open(&path, shared).unwrap();
        assert!(path.is_dir());

        db.inc_ref(); // a borrower
        db.set_must_drop();
        db.must_close(); // owner's reference gone, borrower still holds
        assert!(path.is_dir());
        db.dec_ref(); // last reference: directory removed
        assert!(!path.is_dir());
    }

    #[test]
    fn test_merge_tsids_prefers_current_generation() {
        let mut a = Tsid::default();
        a.metric_id = 1;
        a.job_id = 10;
        let mut b = Tsid::default();
        b.metric_id = 1;
        b.job_id = 20;
        let mut c = Tsid::default();
        c.metric_id = 2;

        let merged = merge_tsids(&[a], &[b, c]);
        assert_eq!(merged.len(), 2);
        let one = merged.iter().find(|t| t.metric_id == 1).unwrap();
        assert_eq!(one.job_id, 10);
    }

    #[test]
    fn test_name_lookup_skip_heuristic() {
        note_name_lookup_hit(); // reset this thread's state
        for _ in 0..LOOKUP_SKIP_AFTER_MISSES {
            assert!(!should_skip_name_lookup());
            note_name_lookup_miss();
        }
        // After enough consecutive misses the probe is skipped...
        assert!(should_skip_name_lookup());
        // ...until a hit resets the state.
        note_name_lookup_hit();
        assert!(!should_skip_name_lookup());
    }
}
