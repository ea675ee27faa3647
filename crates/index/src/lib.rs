//! Inverted index engine
//!
//! Maps metric identity (name + label set) to numeric ids and resolves
//! tag-filter expressions into sorted id lists over a time range. The
//! engine sits on an ordered byte-string table (`series-table`) and keeps
//! six namespaces in it, distinguished by a leading prefix byte:
//! name→TSID, tag→ids, id→TSID, id→name, tombstones, and the per-day id
//! sets.
//!
//! Queries flow cache → planner → bounded scans; ingest flows through the
//! row writer; compaction coalesces adjacent tag rows; retention rollover
//! keeps two generations alive behind a ref-counted handle.

#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod counters;
pub mod db;
pub mod deleted;
pub mod filters;
pub mod hour_index;
pub mod idset;
pub mod key;
pub mod row;
mod planner;
mod search;
mod writer;

pub use cache::WorkingSetCache;
pub use config::IndexConfig;
pub use counters::{CountersSnapshot, IndexCounters};
pub use db::{IndexDb, IndexShared};
pub use deleted::DeletedSet;
pub use filters::{TagFilter, TagFilters};
pub use hour_index::{HourMetricIds, RecentHourIndex};
pub use idset::MetricIdSet;
pub use key::{IndexKind, TAG_SEPARATOR};
pub use row::{merge_tag_rows, IdsTail, TagRow, MAX_IDS_PER_ROW};
