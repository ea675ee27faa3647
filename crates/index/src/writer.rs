//! Index row writer
//!
//! One new series produces five kinds of rows, emitted in a fixed order:
//! the name→TSID row first, then id→name, id→TSID, the empty-key tag row
//! carrying the metric group, and one tag row per label. The order
//! guarantees a partially flushed batch never exposes a readable
//! name→TSID row ahead of its id→TSID counterpart in iteration order.
//! All rows of one series go into a single batch; a retried batch writes
//! harmless duplicates.

use crate::key::{marshal_tag_bytes, write_common_prefix, IndexKind, TAG_SEPARATOR};
use series_core::encoding::marshal_u64;
use series_core::{MetricId, MetricName, Result, TenantId, Tsid};

/// Build the rows representing one new series, in emission order
pub(crate) fn index_rows_for_series(tsid: &Tsid, mn: &MetricName) -> Result<Vec<Vec<u8>>> {
    let tenant = mn.tenant;
    let mut rows = Vec::with_capacity(4 + mn.tags.len());

    // Namespace 0: metric name → TSID. The marshaled name embeds the
    // tenant, so the key body carries no separate tenant column.
    let mut row = vec![IndexKind::MetricNameToTsid.as_byte()];
    mn.marshal(&mut row)?;
    row.push(TAG_SEPARATOR);
    tsid.marshal(&mut row);
    rows.push(row);

    // Namespace 3: (tenant, id) → metric name.
    let mut row = Vec::new();
    write_common_prefix(&mut row, IndexKind::MetricIdToMetricName, tenant);
    marshal_u64(&mut row, tsid.metric_id);
    mn.marshal(&mut row)?;
    rows.push(row);

    // Namespace 2: (tenant, id) → TSID.
    let mut row = Vec::new();
    write_common_prefix(&mut row, IndexKind::MetricIdToTsid, tenant);
    marshal_u64(&mut row, tsid.metric_id);
    tsid.marshal(&mut row);
    rows.push(row);

    // Namespace 1: the empty-key tag carries the metric group, then one
    // row per label.
    rows.push(tag_row(tenant, b"", &mn.metric_group, tsid.metric_id));
    for tag in &mn.tags {
        rows.push(tag_row(tenant, &tag.key, &tag.value, tsid.metric_id));
    }

    Ok(rows)
}

/// Build one namespace-1 row holding a single id
pub(crate) fn tag_row(tenant: TenantId, key: &[u8], value: &[u8], metric_id: MetricId) -> Vec<u8> {
    let mut row = Vec::new();
    write_common_prefix(&mut row, IndexKind::TagToMetricIds, tenant);
    marshal_tag_bytes(&mut row, key);
    marshal_tag_bytes(&mut row, value);
    marshal_u64(&mut row, metric_id);
    row
}

/// Build one namespace-5 row for (tenant, day, id)
pub(crate) fn date_row(tenant: TenantId, day: i64, metric_id: MetricId) -> Vec<u8> {
    let mut row = Vec::new();
    write_common_prefix(&mut row, IndexKind::DateToMetricId, tenant);
    marshal_u64(&mut row, day as u64);
    marshal_u64(&mut row, metric_id);
    row
}

/// Build one namespace-4 tombstone row
pub(crate) fn deleted_row(metric_id: MetricId) -> Vec<u8> {
    let mut row = vec![IndexKind::DeletedMetricId.as_byte()];
    marshal_u64(&mut row, metric_id);
    row
}
