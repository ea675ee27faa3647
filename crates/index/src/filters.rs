//! Tag filters
//!
//! A [`TagFilters`] is one disjunction clause for one tenant: every filter
//! in it must pass for a series to match. Filters compile once at
//! construction:
//!
//! - the longest literal value prefix becomes part of the seek prefix, so
//!   scans start as deep in the tag subspace as possible;
//! - alternation-of-literals regexes expand into `or_suffixes`, enabling
//!   exact-prefix seeks instead of subspace scans;
//! - everything else keeps an anchored suffix regex for the slow path.
//!
//! The empty key addresses the metric group, mirroring the empty-key tag
//! row the writer emits.

use crate::key::{escape_tag_bytes, unmarshal_tag_bytes, write_common_prefix, IndexKind, TAG_SEPARATOR};
use regex_syntax::hir::{Class, Hir, HirKind};
use series_core::encoding::{marshal_bytes, MAX_BYTES_LEN};
use series_core::{Error, MetricName, Result, TenantId};
use std::fmt;

/// Expansion cap for `or_suffixes`; wider alternations scan instead
const MAX_OR_VALUES: usize = 256;

/// One compiled tag filter
pub struct TagFilter {
    key: Vec<u8>,
    value: Vec<u8>,
    is_negative: bool,
    is_regexp: bool,
    /// Raw literal prefix every matching value starts with
    value_prefix: Vec<u8>,
    /// Seek prefix: common prefix ‖ escaped key ‖ SEP ‖ escaped value prefix
    prefix: Vec<u8>,
    /// Raw value suffixes for exact-prefix seeks, when enumerable
    or_suffixes: Option<Vec<Vec<u8>>>,
    /// Anchored suffix matcher for the scan path
    re_suffix: Option<regex::bytes::Regex>,
}

impl TagFilter {
    /// Compile a filter for `tenant`
    ///
    /// `key` is the label key (empty for the metric group); `value` is a
    /// literal or, when `is_regexp` is set, a regular expression matched
    /// against the whole label value.
    pub fn new(
        tenant: TenantId,
        key: &[u8],
        value: &[u8],
        is_negative: bool,
        is_regexp: bool,
    ) -> Result<TagFilter> {
        if key.len() > MAX_BYTES_LEN || value.len() > MAX_BYTES_LEN {
            return Err(Error::InvalidTagFilter(
                "tag filter key or value exceeds 64KiB".to_string(),
            ));
        }

        let mut tf = TagFilter {
            key: key.to_vec(),
            value: value.to_vec(),
            is_negative,
            is_regexp,
            value_prefix: Vec::new(),
            prefix: Vec::new(),
            or_suffixes: None,
            re_suffix: None,
        };

        if !is_regexp {
            tf.value_prefix = value.to_vec();
            tf.or_suffixes = Some(vec![Vec::new()]);
        } else {
            let expr = std::str::from_utf8(value).map_err(|_| {
                Error::InvalidTagFilter("regexp is not valid UTF-8".to_string())
            })?;
            let hir = regex_syntax::parse(expr).map_err(|err| {
                Error::InvalidTagFilter(format!("cannot parse regexp {expr:?}: {err}"))
            })?;
            let (value_prefix, rest) = split_literal_prefix(&hir);
            tf.value_prefix = value_prefix;
            match rest {
                None => {
                    // The regexp is a pure literal.
                    tf.or_suffixes = Some(vec![Vec::new()]);
                }
                Some(rest) => match or_values(&rest) {
                    Some(mut values) => {
                        values.sort();
                        values.dedup();
                        tf.or_suffixes = Some(values);
                    }
                    None => {
                        let pattern = format!("^(?s:{rest})$");
                        let re = regex::bytes::Regex::new(&pattern).map_err(|err| {
                            Error::InvalidTagFilter(format!(
                                "cannot compile regexp {expr:?}: {err}"
                            ))
                        })?;
                        tf.re_suffix = Some(re);
                    }
                },
            }
        }

        write_common_prefix(&mut tf.prefix, IndexKind::TagToMetricIds, tenant);
        escape_tag_bytes(&mut tf.prefix, &tf.key);
        tf.prefix.push(TAG_SEPARATOR);
        escape_tag_bytes(&mut tf.prefix, &tf.value_prefix);
        Ok(tf)
    }

    /// The label key this filter addresses
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The literal value or regexp source
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Whether matches are excluded rather than included
    pub fn is_negative(&self) -> bool {
        self.is_negative
    }

    /// Whether the value is a regexp
    pub fn is_regexp(&self) -> bool {
        self.is_regexp
    }

    /// The seek prefix on the tag index
    pub(crate) fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Raw value suffixes enumerable for exact-prefix seeks
    pub(crate) fn or_suffixes(&self) -> Option<&[Vec<u8>]> {
        self.or_suffixes.as_deref()
    }

    /// Match the escaped, separator-terminated suffix of a scanned row
    ///
    /// `suffix` is the row bytes between this filter's seek prefix and the
    /// id tail.
    pub(crate) fn match_suffix(&self, suffix: &[u8]) -> Result<bool> {
        let (raw, tail) = unmarshal_tag_bytes(suffix)?;
        if !tail.is_empty() {
            return Err(Error::corruption(
                "trailing bytes after tag value suffix",
            ));
        }
        Ok(self.match_raw_suffix(&raw))
    }

    fn match_raw_suffix(&self, raw: &[u8]) -> bool {
        if let Some(ors) = &self.or_suffixes {
            return ors.iter().any(|s| s == raw);
        }
        match &self.re_suffix {
            Some(re) => re.is_match(raw),
            None => false,
        }
    }

    /// Whether a raw label value matches, ignoring negation
    pub(crate) fn matches_value(&self, raw: &[u8]) -> bool {
        if !self.is_regexp {
            return raw == self.value;
        }
        match raw.strip_prefix(self.value_prefix.as_slice()) {
            Some(suffix) => self.match_raw_suffix(suffix),
            None => false,
        }
    }

    /// Whether a series with this (canonical) metric name passes the
    /// filter, negation included
    pub fn matches_metric_name(&self, mn: &MetricName) -> bool {
        let value: &[u8] = if self.key.is_empty() {
            &mn.metric_group
        } else {
            mn.tags
                .iter()
                .find(|tag| tag.key == self.key)
                .map(|tag| tag.value.as_slice())
                .unwrap_or(b"")
        };
        self.matches_value(value) != self.is_negative
    }

    /// Append the filter's shape bytes (cache-key material)
    pub fn marshal_shape(&self, dst: &mut Vec<u8>) {
        marshal_bytes(dst, &self.key);
        marshal_bytes(dst, &self.value);
        dst.push(u8::from(self.is_negative) | (u8::from(self.is_regexp) << 1));
    }
}

impl fmt::Debug for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagFilter")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("value", &String::from_utf8_lossy(&self.value))
            .field("is_negative", &self.is_negative)
            .field("is_regexp", &self.is_regexp)
            .finish()
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match (self.is_negative, self.is_regexp) {
            (false, false) => "=",
            (true, false) => "!=",
            (false, true) => "=~",
            (true, true) => "!~",
        };
        write!(
            f,
            "{}{}\"{}\"",
            String::from_utf8_lossy(&self.key),
            op,
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// One disjunction clause: a set of filters for one tenant
#[derive(Debug, Default)]
pub struct TagFilters {
    tenant: TenantId,
    filters: Vec<TagFilter>,
}

impl TagFilters {
    /// Create an empty clause for `tenant`
    pub fn new(tenant: TenantId) -> Self {
        TagFilters {
            tenant,
            filters: Vec::new(),
        }
    }

    /// Compile and append one filter
    pub fn add(
        &mut self,
        key: &[u8],
        value: &[u8],
        is_negative: bool,
        is_regexp: bool,
    ) -> Result<()> {
        self.filters
            .push(TagFilter::new(self.tenant, key, value, is_negative, is_regexp)?);
        Ok(())
    }

    /// The clause's tenant
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    /// The compiled filters
    pub fn filters(&self) -> &[TagFilter] {
        &self.filters
    }

    /// Whether the clause has no filters
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Append the clause's shape bytes (cache-key material)
    pub fn marshal_shape(&self, dst: &mut Vec<u8>) {
        self.tenant.marshal(dst);
        dst.push(self.filters.len() as u8);
        for tf in &self.filters {
            tf.marshal_shape(dst);
        }
    }
}

impl fmt::Display for TagFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, tf) in self.filters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tf}")?;
        }
        write!(f, "}}")
    }
}

/// Split the longest leading literal off a parsed regexp
fn split_literal_prefix(hir: &Hir) -> (Vec<u8>, Option<Hir>) {
    match hir.kind() {
        HirKind::Empty => (Vec::new(), None),
        HirKind::Literal(lit) => (lit.0.to_vec(), None),
        HirKind::Concat(parts) => {
            let mut prefix = Vec::new();
            let mut i = 0;
            while i < parts.len() {
                match parts[i].kind() {
                    HirKind::Literal(lit) => {
                        prefix.extend_from_slice(&lit.0);
                        i += 1;
                    }
                    _ => break,
                }
            }
            if i == parts.len() {
                (prefix, None)
            } else if i == 0 {
                (Vec::new(), Some(hir.clone()))
            } else {
                (prefix, Some(Hir::concat(parts[i..].to_vec())))
            }
        }
        _ => (Vec::new(), Some(hir.clone())),
    }
}

/// Enumerate every value a regexp fragment can match, if few enough
fn or_values(hir: &Hir) -> Option<Vec<Vec<u8>>> {
    match hir.kind() {
        HirKind::Empty => Some(vec![Vec::new()]),
        HirKind::Literal(lit) => Some(vec![lit.0.to_vec()]),
        HirKind::Capture(cap) => or_values(&cap.sub),
        HirKind::Alternation(parts) => {
            let mut out = Vec::new();
            for part in parts {
                out.extend(or_values(part)?);
                if out.len() > MAX_OR_VALUES {
                    return None;
                }
            }
            Some(out)
        }
        HirKind::Class(class) => class_values(class),
        HirKind::Concat(parts) => {
            let mut out: Vec<Vec<u8>> = vec![Vec::new()];
            for part in parts {
                let values = or_values(part)?;
                let mut next = Vec::with_capacity(out.len() * values.len());
                for head in &out {
                    for value in &values {
                        let mut combined = head.clone();
                        combined.extend_from_slice(value);
                        next.push(combined);
                    }
                    if next.len() > MAX_OR_VALUES {
                        return None;
                    }
                }
                out = next;
            }
            Some(out)
        }
        _ => None,
    }
}

/// Expand a character class into its members, if small
fn class_values(class: &Class) -> Option<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    match class {
        Class::Unicode(ranges) => {
            for range in ranges.ranges() {
                let (start, end) = (range.start() as u32, range.end() as u32);
                if out.len() + (end - start + 1) as usize > MAX_OR_VALUES {
                    return None;
                }
                for cp in start..=end {
                    let ch = char::from_u32(cp)?;
                    let mut buf = [0u8; 4];
                    out.push(ch.encode_utf8(&mut buf).as_bytes().to_vec());
                }
            }
        }
        Class::Bytes(ranges) => {
            for range in ranges.ranges() {
                let (start, end) = (range.start(), range.end());
                if out.len() + (end - start + 1) as usize > MAX_OR_VALUES {
                    return None;
                }
                for b in start..=end {
                    out.push(vec![b]);
                }
            }
        }
    }
    Some(out)
}
