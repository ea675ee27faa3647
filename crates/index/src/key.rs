//! Index key codec
//!
//! Every row starts with a single namespace byte; rows scoped to a tenant
//! follow it with the 8-byte marshaled tenant. Tag keys and values are
//! escaped so the separator byte cannot occur inside them, which makes
//! "skip to the next tag value" a one-byte increment of the trailing
//! separator.

use series_core::{Error, Result, TenantId, TENANT_ID_LEN};

/// Terminates escaped tag keys and tag values inside namespace-1 keys
///
/// Must never be `0xFF`: prefix navigation increments it.
pub const TAG_SEPARATOR: u8 = 0x01;

/// Escape byte used inside tag keys and values
const ESCAPE_CHAR: u8 = 0x02;

/// Length of the namespace byte plus marshaled tenant
pub const COMMON_PREFIX_LEN: usize = 1 + TENANT_ID_LEN;

/// The six index namespaces, distinguished by the leading key byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IndexKind {
    /// Metric name → TSID
    MetricNameToTsid = 0,
    /// (tenant, tag) → metric ids
    TagToMetricIds = 1,
    /// (tenant, metric id) → TSID
    MetricIdToTsid = 2,
    /// (tenant, metric id) → metric name
    MetricIdToMetricName = 3,
    /// Deleted metric id tombstones
    DeletedMetricId = 4,
    /// (tenant, day) → metric ids
    DateToMetricId = 5,
}

impl IndexKind {
    /// The namespace prefix byte
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Decode a namespace byte
    pub fn from_byte(b: u8) -> Option<IndexKind> {
        match b {
            0 => Some(IndexKind::MetricNameToTsid),
            1 => Some(IndexKind::TagToMetricIds),
            2 => Some(IndexKind::MetricIdToTsid),
            3 => Some(IndexKind::MetricIdToMetricName),
            4 => Some(IndexKind::DeletedMetricId),
            5 => Some(IndexKind::DateToMetricId),
            _ => None,
        }
    }
}

/// Append the namespace byte and marshaled tenant to `dst`
pub fn write_common_prefix(dst: &mut Vec<u8>, kind: IndexKind, tenant: TenantId) {
    dst.push(kind.as_byte());
    tenant.marshal(dst);
}

/// Decode a common prefix, returning the namespace, tenant and tail
pub fn unmarshal_common_prefix(src: &[u8]) -> Result<(IndexKind, TenantId, &[u8])> {
    if src.is_empty() {
        return Err(Error::corruption("empty index key"));
    }
    let kind = IndexKind::from_byte(src[0])
        .ok_or_else(|| Error::corruption(format!("unknown namespace byte {:#x}", src[0])))?;
    let (tenant, tail) = TenantId::unmarshal(&src[1..])?;
    Ok((kind, tenant, tail))
}

/// Append the escaped form of `src` to `dst`, without a terminator
///
/// Only the separator and escape bytes need escaping; everything else is
/// copied verbatim, so escaped bytes of distinct values stay distinct.
pub fn escape_tag_bytes(dst: &mut Vec<u8>, src: &[u8]) {
    for &b in src {
        match b {
            TAG_SEPARATOR => {
                dst.push(ESCAPE_CHAR);
                dst.push(0);
            }
            ESCAPE_CHAR => {
                dst.push(ESCAPE_CHAR);
                dst.push(1);
            }
            _ => dst.push(b),
        }
    }
}

/// Append the escaped form of `src` plus the terminating separator
pub fn marshal_tag_bytes(dst: &mut Vec<u8>, src: &[u8]) {
    escape_tag_bytes(dst, src);
    dst.push(TAG_SEPARATOR);
}

/// Decode one escaped, separator-terminated component
///
/// Returns the unescaped bytes and the tail after the separator.
pub fn unmarshal_tag_bytes(src: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            TAG_SEPARATOR => return Ok((out, &src[i + 1..])),
            ESCAPE_CHAR => {
                let esc = *src.get(i + 1).ok_or_else(|| {
                    Error::corruption("truncated escape sequence in tag bytes")
                })?;
                match esc {
                    0 => out.push(TAG_SEPARATOR),
                    1 => out.push(ESCAPE_CHAR),
                    _ => {
                        return Err(Error::corruption(format!(
                            "invalid escape sequence {:#x} in tag bytes",
                            esc
                        )))
                    }
                }
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(Error::corruption("missing tag separator"))
}

/// Byte length of the escaped component ending at its separator
///
/// `src` starts at the component; the returned length includes the
/// terminating separator.
pub fn escaped_component_len(src: &[u8]) -> Result<usize> {
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            TAG_SEPARATOR => return Ok(i + 1),
            ESCAPE_CHAR => i += 2,
            _ => i += 1,
        }
    }
    Err(Error::corruption("missing tag separator"))
}

/// Turn a prefix ending in a separator into the next one past all rows
/// sharing it, by incrementing the trailing separator byte
///
/// The separator is a fixed non-`0xFF` byte, so the increment cannot
/// overflow; a `0xFF` trailer means the prefix is not ours.
pub fn increment_trailing_separator(prefix: &mut [u8]) -> Result<()> {
    let last = prefix
        .last_mut()
        .ok_or_else(|| Error::corruption("cannot increment empty prefix"))?;
    if *last == 0xFF {
        return Err(Error::corruption(
            "cannot increment trailing 0xff; separator byte is misplaced",
        ));
    }
    *last += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_prefix_round_trip() {
        let tenant = TenantId::new(1, 2);
        let mut buf = Vec::new();
        write_common_prefix(&mut buf, IndexKind::TagToMetricIds, tenant);
        assert_eq!(buf.len(), COMMON_PREFIX_LEN);
        let (kind, tenant2, tail) = unmarshal_common_prefix(&buf).unwrap();
        assert_eq!(kind, IndexKind::TagToMetricIds);
        assert_eq!(tenant2, tenant);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_unknown_namespace_byte() {
        assert!(unmarshal_common_prefix(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(unmarshal_common_prefix(&[]).is_err());
    }

    #[test]
    fn test_tag_bytes_round_trip_plain() {
        let mut buf = Vec::new();
        marshal_tag_bytes(&mut buf, b"host");
        let (v, tail) = unmarshal_tag_bytes(&buf).unwrap();
        assert_eq!(v, b"host");
        assert!(tail.is_empty());
    }

    #[test]
    fn test_tag_bytes_round_trip_with_reserved_bytes() {
        let raw = [b'a', TAG_SEPARATOR, b'b', ESCAPE_CHAR, b'c'];
        let mut buf = Vec::new();
        marshal_tag_bytes(&mut buf, &raw);
        // Escaped form must not contain an unescaped separator before the
        // terminator.
        assert_eq!(buf.iter().filter(|&&b| b == TAG_SEPARATOR).count(), 1);
        let (v, tail) = unmarshal_tag_bytes(&buf).unwrap();
        assert_eq!(v, raw);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_unmarshal_missing_separator() {
        assert!(unmarshal_tag_bytes(b"abc").is_err());
    }

    #[test]
    fn test_unmarshal_truncated_escape() {
        assert!(unmarshal_tag_bytes(&[b'a', ESCAPE_CHAR]).is_err());
    }

    #[test]
    fn test_escaped_component_len() {
        let mut buf = Vec::new();
        marshal_tag_bytes(&mut buf, &[b'x', TAG_SEPARATOR, b'y']);
        buf.extend_from_slice(b"tail");
        let len = escaped_component_len(&buf).unwrap();
        assert_eq!(&buf[len..], b"tail");
    }

    #[test]
    fn test_increment_trailing_separator_orders_past_values() {
        // prefix ‖ SEP sorts before any row of this value; after the
        // increment it sorts after all of them.
        let mut value_prefix = Vec::new();
        marshal_tag_bytes(&mut value_prefix, b"a");
        let mut row = value_prefix.clone();
        row.extend_from_slice(&[0; 8]); // id tail
        let mut next = value_prefix.clone();
        increment_trailing_separator(&mut next).unwrap();
        assert!(value_prefix.as_slice() < row.as_slice());
        assert!(row.as_slice() < next.as_slice());
    }

    #[test]
    fn test_increment_trailing_0xff_fails() {
        let mut prefix = vec![0xFFu8];
        assert!(increment_trailing_separator(&mut prefix).is_err());
        let mut empty: [u8; 0] = [];
        assert!(increment_trailing_separator(&mut empty).is_err());
    }
}
