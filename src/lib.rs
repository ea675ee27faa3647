//! # Seriesdb
//!
//! The inverted index engine of a multi-tenant time-series database:
//! metric identity (name + label set) in, sorted series identifiers out.
//!
//! # Quick start
//!
//! ```no_run
//! use seriesdb::{IndexConfig, IndexDb, IndexShared, MetricName, TagFilters, TenantId, TimeRange};
//!
//! fn main() -> seriesdb::Result<()> {
//!     let shared = IndexShared::new(IndexConfig::default());
//!     let db = IndexDb::open("./index-gen-1".as_ref(), shared)?;
//!
//!     // Ingest: resolve (or create) the series identity.
//!     let tenant = TenantId::new(1, 2);
//!     let mut mn = MetricName::new(tenant, "cpu");
//!     mn.add_tag("host", "a");
//!     let tsid = db.get_or_create_tsid_by_name(&mn)?;
//!     db.register_metric_id(tenant, tsid.metric_id, 1_700_000_000_000)?;
//!
//!     // Query: resolve a filter clause over a time range.
//!     let mut tfs = TagFilters::new(tenant);
//!     tfs.add(b"host", b"a", false, false)?;
//!     let tr = TimeRange::new(1_699_999_000_000, 1_700_001_000_000);
//!     let tsids = db.search_tsids(&[tfs], tr, 1000)?;
//!     assert_eq!(tsids[0].metric_id, tsid.metric_id);
//!
//!     db.must_close();
//!     Ok(())
//! }
//! ```
//!
//! # Crate layout
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `series-core` | Tenants, TSIDs, metric names, encoding, errors |
//! | `series-table` | Ordered table contract + in-process store |
//! | `series-index` | Key codec, row merger, caches, planner, rollover |
//!
//! Only the surface re-exported here is meant for direct use.

pub use series_core::{
    Error, MetricId, MetricName, Result, Tag, TenantId, TimeRange, Tsid, MSECS_PER_DAY,
    MSECS_PER_HOUR,
};
pub use series_index::{
    CountersSnapshot, IndexConfig, IndexDb, IndexShared, MetricIdSet, TagFilter, TagFilters,
};
pub use series_table::{MemTable, MergeBlock, Table, TableCallbacks, TableSearch};
