//! Metric names
//!
//! A metric name is the metric group (the name without labels) plus a set
//! of key/value labels, scoped to a tenant. The canonical form sorts
//! labels by key; all hashing and index rows are produced from the
//! canonical form.
//!
//! The binary marshaled form starts with the tenant, so the metric-name
//! index needs no separate tenant column: byte order on the marshaled name
//! already groups rows per tenant.

use crate::encoding::{marshal_bytes, marshal_u16, unmarshal_bytes, unmarshal_u16, MAX_BYTES_LEN};
use crate::error::{Error, Result};
use crate::tenant::TenantId;
use std::fmt;

/// One label on a metric name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    /// Label key bytes
    pub key: Vec<u8>,
    /// Label value bytes
    pub value: Vec<u8>,
}

impl Tag {
    /// Create a tag from key and value bytes
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A tenant-scoped metric name: group plus labels
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MetricName {
    /// Owning tenant
    pub tenant: TenantId,
    /// Metric group, i.e. the name without labels
    pub metric_group: Vec<u8>,
    /// Labels; canonical form keeps them sorted by key
    pub tags: Vec<Tag>,
}

impl MetricName {
    /// Create a metric name with no labels
    pub fn new(tenant: TenantId, metric_group: impl Into<Vec<u8>>) -> Self {
        MetricName {
            tenant,
            metric_group: metric_group.into(),
            tags: Vec::new(),
        }
    }

    /// Append a label
    ///
    /// Call [`sort_tags`](Self::sort_tags) once all labels are added to
    /// reach the canonical form.
    pub fn add_tag(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.tags.push(Tag::new(key, value));
    }

    /// Sort labels by key into the canonical form
    pub fn sort_tags(&mut self) {
        self.tags.sort();
    }

    /// Append the binary marshaled form to `dst`
    ///
    /// Component lengths above 64KiB are rejected: they cannot be
    /// length-prefixed and no legitimate label reaches that size.
    pub fn marshal(&self, dst: &mut Vec<u8>) -> Result<()> {
        if self.metric_group.len() > MAX_BYTES_LEN {
            return Err(Error::corruption("metric group exceeds 64KiB"));
        }
        for tag in &self.tags {
            if tag.key.len() > MAX_BYTES_LEN || tag.value.len() > MAX_BYTES_LEN {
                return Err(Error::corruption("label exceeds 64KiB"));
            }
        }
        self.tenant.marshal(dst);
        marshal_bytes(dst, &self.metric_group);
        marshal_u16(dst, self.tags.len() as u16);
        for tag in &self.tags {
            marshal_bytes(dst, &tag.key);
            marshal_bytes(dst, &tag.value);
        }
        Ok(())
    }

    /// Decode a marshaled metric name
    ///
    /// The whole of `src` must be consumed; trailing bytes are corruption.
    pub fn unmarshal(src: &[u8]) -> Result<MetricName> {
        let (tenant, tail) = TenantId::unmarshal(src)?;
        let (metric_group, tail) = unmarshal_bytes(tail)?;
        let (tag_count, mut tail) = unmarshal_u16(tail)?;
        let mut mn = MetricName {
            tenant,
            metric_group: metric_group.to_vec(),
            tags: Vec::with_capacity(tag_count as usize),
        };
        for _ in 0..tag_count {
            let (key, rest) = unmarshal_bytes(tail)?;
            let (value, rest) = unmarshal_bytes(rest)?;
            mn.tags.push(Tag::new(key, value));
            tail = rest;
        }
        if !tail.is_empty() {
            return Err(Error::corruption(format!(
                "{} trailing bytes after metric name",
                tail.len()
            )));
        }
        Ok(mn)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.metric_group))?;
        if self.tags.is_empty() {
            return Ok(());
        }
        write!(f, "{{")?;
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(
                f,
                "{}=\"{}\"",
                String::from_utf8_lossy(&tag.key),
                String::from_utf8_lossy(&tag.value)
            )?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricName {
        let mut mn = MetricName::new(TenantId::new(1, 2), b"cpu");
        mn.add_tag(b"host", b"a");
        mn.add_tag(b"dc", b"x");
        mn.sort_tags();
        mn
    }

    #[test]
    fn test_sort_tags_orders_by_key() {
        let mn = sample();
        assert_eq!(mn.tags[0].key, b"dc");
        assert_eq!(mn.tags[1].key, b"host");
    }

    #[test]
    fn test_round_trip() {
        let mn = sample();
        let mut buf = Vec::new();
        mn.marshal(&mut buf).unwrap();
        let mn2 = MetricName::unmarshal(&buf).unwrap();
        assert_eq!(mn, mn2);
    }

    #[test]
    fn test_round_trip_no_tags() {
        let mn = MetricName::new(TenantId::new(0, 0), b"up");
        let mut buf = Vec::new();
        mn.marshal(&mut buf).unwrap();
        assert_eq!(mn, MetricName::unmarshal(&buf).unwrap());
    }

    #[test]
    fn test_marshal_is_tenant_prefixed() {
        let mn = sample();
        let mut buf = Vec::new();
        mn.marshal(&mut buf).unwrap();
        let (tenant, _) = TenantId::unmarshal(&buf).unwrap();
        assert_eq!(tenant, TenantId::new(1, 2));
    }

    #[test]
    fn test_unmarshal_rejects_trailing_bytes() {
        let mn = sample();
        let mut buf = Vec::new();
        mn.marshal(&mut buf).unwrap();
        buf.push(0);
        assert!(MetricName::unmarshal(&buf).is_err());
    }

    #[test]
    fn test_unmarshal_rejects_truncation() {
        let mn = sample();
        let mut buf = Vec::new();
        mn.marshal(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(MetricName::unmarshal(&buf).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(sample().to_string(), "cpu{dc=\"x\",host=\"a\"}");
        assert_eq!(MetricName::new(TenantId::default(), b"up").to_string(), "up");
    }
}
