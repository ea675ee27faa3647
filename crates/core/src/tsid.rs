//! Series identifiers
//!
//! A [`Tsid`] identifies one time series. Besides the process-global
//! [`MetricId`] it carries denormalized hashes of the metric group and the
//! first two label values; the derived lexicographic order over all fields
//! is the order query results are returned in, so series of the same group
//! and job sort next to each other.

use crate::encoding::{marshal_u32, marshal_u64, unmarshal_u32, unmarshal_u64};
use crate::error::{Error, Result};
use crate::metric_name::MetricName;
use crate::tenant::TenantId;
use xxhash_rust::xxh3::xxh3_64;

/// Process-global 64-bit series identifier; monotonic, never reused
pub type MetricId = u64;

/// Marshaled size of a [`Tsid`] in bytes
pub const TSID_LEN: usize = 32;

/// Identifier record for one time series
///
/// Field declaration order is the comparison order; do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tsid {
    /// Account part of the tenant
    pub account_id: u32,
    /// Project part of the tenant
    pub project_id: u32,
    /// xxh3 hash of the metric group (metric name without labels)
    pub metric_group_id: u64,
    /// Truncated xxh3 hash of the first label value
    pub job_id: u32,
    /// Truncated xxh3 hash of the second label value
    pub instance_id: u32,
    /// The process-global series id
    pub metric_id: MetricId,
}

impl Tsid {
    /// Build a TSID for a canonical (tags sorted) metric name
    pub fn for_metric_name(mn: &MetricName, metric_id: MetricId) -> Self {
        let mut tsid = Tsid {
            account_id: mn.tenant.account_id,
            project_id: mn.tenant.project_id,
            metric_group_id: xxh3_64(&mn.metric_group),
            job_id: 0,
            instance_id: 0,
            metric_id,
        };
        if let Some(tag) = mn.tags.first() {
            tsid.job_id = xxh3_64(&tag.value) as u32;
        }
        if let Some(tag) = mn.tags.get(1) {
            tsid.instance_id = xxh3_64(&tag.value) as u32;
        }
        tsid
    }

    /// The tenant this series belongs to
    pub fn tenant(&self) -> TenantId {
        TenantId::new(self.account_id, self.project_id)
    }

    /// Append the 32-byte marshaled form to `dst`
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        marshal_u32(dst, self.account_id);
        marshal_u32(dst, self.project_id);
        marshal_u64(dst, self.metric_group_id);
        marshal_u32(dst, self.job_id);
        marshal_u32(dst, self.instance_id);
        marshal_u64(dst, self.metric_id);
    }

    /// Decode a TSID, returning it and the remaining tail
    pub fn unmarshal(src: &[u8]) -> Result<(Tsid, &[u8])> {
        if src.len() < TSID_LEN {
            return Err(Error::corruption(format!(
                "cannot unmarshal TSID from {} bytes; need at least {}",
                src.len(),
                TSID_LEN
            )));
        }
        let (account_id, tail) = unmarshal_u32(src)?;
        let (project_id, tail) = unmarshal_u32(tail)?;
        let (metric_group_id, tail) = unmarshal_u64(tail)?;
        let (job_id, tail) = unmarshal_u32(tail)?;
        let (instance_id, tail) = unmarshal_u32(tail)?;
        let (metric_id, tail) = unmarshal_u64(tail)?;
        Ok((
            Tsid {
                account_id,
                project_id,
                metric_group_id,
                job_id,
                instance_id,
                metric_id,
            },
            tail,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tsid {
        Tsid {
            account_id: 1,
            project_id: 2,
            metric_group_id: 0xABCD,
            job_id: 3,
            instance_id: 4,
            metric_id: 100,
        }
    }

    #[test]
    fn test_round_trip() {
        let tsid = sample();
        let mut buf = Vec::new();
        tsid.marshal(&mut buf);
        assert_eq!(buf.len(), TSID_LEN);
        let (tsid2, tail) = Tsid::unmarshal(&buf).unwrap();
        assert_eq!(tsid, tsid2);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_unmarshal_short() {
        let mut buf = Vec::new();
        sample().marshal(&mut buf);
        buf.truncate(TSID_LEN - 1);
        assert!(Tsid::unmarshal(&buf).is_err());
    }

    #[test]
    fn test_ordering_is_lexicographic_over_fields() {
        let a = sample();
        let mut b = a;
        b.metric_id = 99;
        assert!(b < a);

        // tenant dominates metric_id
        let mut c = a;
        c.account_id = 0;
        c.metric_id = u64::MAX;
        assert!(c < a);

        // group hash dominates job hash
        let mut d = a;
        d.metric_group_id = 0xABCC;
        d.job_id = u32::MAX;
        assert!(d < a);
    }

    #[test]
    fn test_for_metric_name_hashes_first_two_label_values() {
        let mut mn = MetricName::new(TenantId::new(1, 2), b"cpu");
        mn.add_tag(b"dc", b"x");
        mn.add_tag(b"host", b"a");
        mn.sort_tags();

        let tsid = Tsid::for_metric_name(&mn, 7);
        assert_eq!(tsid.account_id, 1);
        assert_eq!(tsid.project_id, 2);
        assert_eq!(tsid.metric_group_id, xxh3_64(b"cpu"));
        assert_eq!(tsid.job_id, xxh3_64(b"x") as u32);
        assert_eq!(tsid.instance_id, xxh3_64(b"a") as u32);
        assert_eq!(tsid.metric_id, 7);
    }

    #[test]
    fn test_for_metric_name_without_tags() {
        let mn = MetricName::new(TenantId::new(0, 0), b"up");
        let tsid = Tsid::for_metric_name(&mn, 1);
        assert_eq!(tsid.job_id, 0);
        assert_eq!(tsid.instance_id, 0);
    }
}
