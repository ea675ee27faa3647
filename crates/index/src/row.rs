//! Tag→ids row parsing and merge-time coalescing
//!
//! A namespace-1 row is `[ns][tenant][key·SEP][value·SEP][id ...]` with an
//! 8-byte-aligned id tail. The row writer emits one id per row; the merge
//! callback collapses adjacent rows sharing the (tenant, tag) prefix into
//! rows carrying the sorted union of their ids.

use crate::key::{unmarshal_tag_bytes, IndexKind};
use series_core::encoding::{marshal_u64, unmarshal_u64};
use series_core::{Error, MetricId, Result, TenantId};
use series_table::MergeBlock;
use std::collections::BTreeSet;

/// Upper bound on ids per merged row; larger unions are split
///
/// Bounds the work a single row imposes on searches and keeps rewritten
/// rows within block-sized buffers.
pub const MAX_IDS_PER_ROW: usize = 8 * 1024;

/// The 8-byte-aligned id tail of a tag row
#[derive(Debug, Clone, Copy)]
pub struct IdsTail<'a> {
    tail: &'a [u8],
}

impl<'a> IdsTail<'a> {
    /// Validate and wrap an id tail
    pub fn new(tail: &'a [u8]) -> Result<IdsTail<'a>> {
        if tail.len() % 8 != 0 {
            return Err(Error::corruption(format!(
                "tag row id tail length {} is not a multiple of 8",
                tail.len()
            )));
        }
        Ok(IdsTail { tail })
    }

    /// Number of ids in the tail
    pub fn len(&self) -> usize {
        self.tail.len() / 8
    }

    /// Whether the tail holds no ids
    pub fn is_empty(&self) -> bool {
        self.tail.is_empty()
    }

    /// First id, O(1)
    pub fn first_id(&self) -> Option<MetricId> {
        if self.tail.is_empty() {
            return None;
        }
        let (id, _) = unmarshal_u64(self.tail).ok()?;
        Some(id)
    }

    /// Last id, O(1)
    pub fn last_id(&self) -> Option<MetricId> {
        if self.tail.is_empty() {
            return None;
        }
        let (id, _) = unmarshal_u64(&self.tail[self.tail.len() - 8..]).ok()?;
        Some(id)
    }

    /// Iterate ids in row order
    pub fn iter(&self) -> impl Iterator<Item = MetricId> + 'a {
        self.tail.chunks_exact(8).map(|chunk| {
            let (id, _) = unmarshal_u64(chunk).expect("8-byte chunk");
            id
        })
    }
}

/// A parsed namespace-1 row
#[derive(Debug)]
pub struct TagRow<'a> {
    /// Owning tenant
    pub tenant: TenantId,
    /// Unescaped tag key; empty for the metric-group pseudo-tag
    pub key: Vec<u8>,
    /// Unescaped tag value
    pub value: Vec<u8>,
    /// The id tail
    pub ids: IdsTail<'a>,
    /// Byte length of the row prefix up to and including the value
    /// separator; rows with equal prefixes carry the same (tenant, tag)
    pub prefix_len: usize,
}

impl<'a> TagRow<'a> {
    /// Parse a namespace-1 item
    pub fn parse(item: &'a [u8]) -> Result<TagRow<'a>> {
        if item.first() != Some(&IndexKind::TagToMetricIds.as_byte()) {
            return Err(Error::corruption(format!(
                "not a tag row: leading byte {:?}",
                item.first()
            )));
        }
        let (tenant, tail) = TenantId::unmarshal(&item[1..])?;
        let (key, tail) = unmarshal_tag_bytes(tail)?;
        let (value, tail) = unmarshal_tag_bytes(tail)?;
        let prefix_len = item.len() - tail.len();
        Ok(TagRow {
            tenant,
            key,
            value,
            ids: IdsTail::new(tail)?,
            prefix_len,
        })
    }
}

/// Merge-callback for tag rows
///
/// Receives a sorted run of adjacent items. The first and last items pass
/// through verbatim to preserve ordering across neighbouring blocks; every
/// maximal window of tag rows sharing a (tenant, tag) prefix is replaced
/// by rows carrying the sorted, deduplicated union of the window's ids.
/// Items from other namespaces pass through untouched. Rows whose ids are
/// all tombstoned are still emitted; tombstone cleanup happens at query
/// time.
///
/// Panics on an unparseable tag row: merging corrupt rows would bake the
/// corruption into the rewritten block.
pub fn merge_tag_rows(block: &mut MergeBlock) {
    let n = block.len();
    if n < 3 {
        return;
    }
    let tag_ns = IndexKind::TagToMetricIds.as_byte();
    let mut out = MergeBlock::default();
    out.push(block.item(0));

    let mut i = 0;
    while i < n {
        let item = block.item(i);
        if item.first() != Some(&tag_ns) {
            if i != 0 && i != n - 1 {
                out.push(item);
            }
            i += 1;
            continue;
        }
        let row = match TagRow::parse(item) {
            Ok(row) => row,
            Err(err) => panic!("cannot merge corrupted tag row: {err}"),
        };
        let prefix_len = row.prefix_len;
        let prefix = &item[..prefix_len];

        // Extend the window over rows with the same (tenant, tag). Escaped
        // components are separator-free, so an equal byte prefix implies an
        // equal tag.
        let mut j = i + 1;
        while j < n && block.item(j).starts_with(prefix) {
            j += 1;
        }

        if j - i == 1 {
            if i != 0 && i != n - 1 {
                out.push(item);
            }
            i = j;
            continue;
        }

        let mut ids: BTreeSet<MetricId> = BTreeSet::new();
        for k in i..j {
            let row = match TagRow::parse(block.item(k)) {
                Ok(row) => row,
                Err(err) => panic!("cannot merge corrupted tag row: {err}"),
            };
            ids.extend(row.ids.iter());
        }
        let ids: Vec<MetricId> = ids.into_iter().collect();
        for chunk in ids.chunks(MAX_IDS_PER_ROW) {
            let mut merged = Vec::with_capacity(prefix_len + chunk.len() * 8);
            merged.extend_from_slice(prefix);
            for &id in chunk {
                marshal_u64(&mut merged, id);
            }
            out.push(&merged);
        }
        i = j;
    }

    out.push(block.item(n - 1));
    *block = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{marshal_tag_bytes, write_common_prefix};

    fn tag_row(tenant: TenantId, key: &[u8], value: &[u8], ids: &[MetricId]) -> Vec<u8> {
        let mut row = Vec::new();
        write_common_prefix(&mut row, IndexKind::TagToMetricIds, tenant);
        marshal_tag_bytes(&mut row, key);
        marshal_tag_bytes(&mut row, value);
        for &id in ids {
            marshal_u64(&mut row, id);
        }
        row
    }

    #[test]
    fn test_parse_round_trip() {
        let tenant = TenantId::new(1, 2);
        let item = tag_row(tenant, b"host", b"a", &[5, 7, 9]);
        let row = TagRow::parse(&item).unwrap();
        assert_eq!(row.tenant, tenant);
        assert_eq!(row.key, b"host");
        assert_eq!(row.value, b"a");
        assert_eq!(row.ids.len(), 3);
        assert_eq!(row.ids.first_id(), Some(5));
        assert_eq!(row.ids.last_id(), Some(9));
        assert_eq!(row.ids.iter().collect::<Vec<_>>(), vec![5, 7, 9]);
        assert_eq!(&item[..row.prefix_len], &item[..item.len() - 24]);
    }

    #[test]
    fn test_parse_rejects_misaligned_tail() {
        let tenant = TenantId::new(1, 2);
        let mut item = tag_row(tenant, b"host", b"a", &[5]);
        item.push(0);
        assert!(TagRow::parse(&item).is_err());
    }

    #[test]
    fn test_parse_rejects_wrong_namespace() {
        let mut item = tag_row(TenantId::new(1, 2), b"host", b"a", &[5]);
        item[0] = IndexKind::MetricIdToTsid.as_byte();
        assert!(TagRow::parse(&item).is_err());
    }

    #[test]
    fn test_merge_window_union() {
        // Three adjacent rows of the same (tenant, tag): first and last
        // pass through verbatim, the window collapses to the sorted union.
        let tenant = TenantId::new(1, 2);
        let rows = vec![
            tag_row(tenant, b"k", b"v", &[5]),
            tag_row(tenant, b"k", b"v", &[3, 9]),
            tag_row(tenant, b"k", b"v", &[3, 7]),
        ];
        let mut block = MergeBlock::from_items(rows.clone());
        merge_tag_rows(&mut block);

        assert_eq!(block.len(), 3);
        assert_eq!(block.item(0), rows[0].as_slice());
        assert_eq!(block.item(2), rows[2].as_slice());
        let merged = TagRow::parse(block.item(1)).unwrap();
        assert_eq!(merged.ids.iter().collect::<Vec<_>>(), vec![3, 5, 7, 9]);
        assert_eq!(merged.key, b"k");
        assert_eq!(merged.value, b"v");
        assert_eq!(merged.tenant, tenant);
    }

    #[test]
    fn test_merge_distinct_tags_untouched() {
        let tenant = TenantId::new(1, 2);
        let rows = vec![
            tag_row(tenant, b"a", b"1", &[1]),
            tag_row(tenant, b"b", b"1", &[2]),
            tag_row(tenant, b"c", b"1", &[3]),
        ];
        let mut block = MergeBlock::from_items(rows.clone());
        merge_tag_rows(&mut block);
        let items: Vec<&[u8]> = block.iter().collect();
        assert_eq!(items, rows.iter().map(|r| r.as_slice()).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_short_runs_pass_through() {
        let tenant = TenantId::new(1, 2);
        let rows = vec![
            tag_row(tenant, b"k", b"v", &[1]),
            tag_row(tenant, b"k", b"v", &[2]),
        ];
        let mut block = MergeBlock::from_items(rows.clone());
        merge_tag_rows(&mut block);
        assert_eq!(block.len(), 2);
        assert_eq!(block.item(0), rows[0].as_slice());
        assert_eq!(block.item(1), rows[1].as_slice());
    }

    #[test]
    fn test_merge_ignores_other_namespaces() {
        let tenant = TenantId::new(1, 2);
        let name_row = vec![IndexKind::MetricNameToTsid.as_byte(), b'a'];
        let tsid_row = vec![IndexKind::MetricIdToTsid.as_byte(), 0, 0, 0];
        let rows = vec![
            name_row.clone(),
            tag_row(tenant, b"k", b"v", &[4]),
            tag_row(tenant, b"k", b"v", &[2]),
            tag_row(tenant, b"k", b"v", &[6]),
            tsid_row.clone(),
        ];
        let mut block = MergeBlock::from_items(rows.clone());
        merge_tag_rows(&mut block);

        // Edges verbatim, inner window merged.
        assert_eq!(block.item(0), name_row.as_slice());
        assert_eq!(block.item(block.len() - 1), tsid_row.as_slice());
        let merged = TagRow::parse(block.item(1)).unwrap();
        assert_eq!(merged.ids.iter().collect::<Vec<_>>(), vec![2, 4, 6]);
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn test_merge_splits_oversized_unions() {
        let tenant = TenantId::new(1, 2);
        let ids_a: Vec<MetricId> = (0..MAX_IDS_PER_ROW as u64).collect();
        let ids_b: Vec<MetricId> = (MAX_IDS_PER_ROW as u64..MAX_IDS_PER_ROW as u64 + 10).collect();
        let rows = vec![
            tag_row(tenant, b"k", b"v", &[0]),
            tag_row(tenant, b"k", b"v", &ids_a),
            tag_row(tenant, b"k", b"v", &ids_b),
        ];
        let mut block = MergeBlock::from_items(rows);
        merge_tag_rows(&mut block);

        // first verbatim + two chunks + last verbatim
        assert_eq!(block.len(), 4);
        let chunk1 = TagRow::parse(block.item(1)).unwrap();
        let chunk2 = TagRow::parse(block.item(2)).unwrap();
        assert_eq!(chunk1.ids.len(), MAX_IDS_PER_ROW);
        assert_eq!(chunk2.ids.len(), 10);
    }
}
