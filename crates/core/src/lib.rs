//! Core types for the series index engine
//!
//! This crate defines the foundational types shared by the table and index
//! layers:
//! - TenantId: the (accountID, projectID) pair isolating index namespaces
//! - Tsid / MetricId: series identifiers and their result ordering
//! - MetricName: tenant-scoped metric group + labels, canonical form
//! - TimeRange: query time intervals and day/hour bucketing
//! - encoding: big-endian marshaling shared by every persisted row
//! - Error: the error hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod error;
pub mod metric_name;
pub mod tenant;
pub mod time;
pub mod tsid;

pub use error::{Error, Result};
pub use metric_name::{MetricName, Tag};
pub use tenant::{TenantId, TENANT_ID_LEN};
pub use time::{TimeRange, MSECS_PER_DAY, MSECS_PER_HOUR};
pub use tsid::{MetricId, Tsid, TSID_LEN};
