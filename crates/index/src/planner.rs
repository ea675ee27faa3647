//! Filter planner
//!
//! Resolves one disjunction clause into metric ids: pick the positive
//! filter with the fewest matches as the pivot, intersect the rest
//! against it, and keep every step under a loop budget. Filters that blow
//! their budget are remembered in the useless-filter cache and postponed;
//! if intersection cannot finish, the planner fetches the candidates'
//! metric names and evaluates the remaining filters in memory, which is
//! bounded by the candidate count instead of the index size.

use crate::counters::IndexCounters;
use crate::db::{now_ms, IndexDb};
use crate::filters::{TagFilter, TagFilters};
use crate::idset::MetricIdSet;
use crate::key::{
    escape_tag_bytes, escaped_component_len, increment_trailing_separator, write_common_prefix,
    IndexKind, TAG_SEPARATOR,
};
use crate::row::IdsTail;
use crate::search::{BoundedScanner, ScanError, ScanResult};
use rustc_hash::FxHashMap;
use series_core::encoding::{marshal_u64, unmarshal_u64};
use series_core::{Error, MetricName, Result, TenantId, TimeRange};
use smallvec::SmallVec;
use tracing::debug;

/// Useless-filter cache key prefixes: one per skip class
const USELESS_SINGLE: u8 = 1;
const USELESS_MULTI: u8 = 2;
const USELESS_NEGATIVE: u8 = 3;

/// What to do after examining one scanned row
enum Step {
    Stop,
    SeekPast(Vec<u8>),
    Continue,
}

impl IndexDb {
    /// Resolve clauses to per-tenant id sets, tombstones removed
    pub(crate) fn search_metric_ids(
        &self,
        tfss: &[TagFilters],
        tr: TimeRange,
        max_metrics: usize,
    ) -> Result<FxHashMap<TenantId, MetricIdSet>> {
        let mut per_tenant: FxHashMap<TenantId, MetricIdSet> = FxHashMap::default();
        for tfs in tfss {
            let ids = per_tenant.entry(tfs.tenant()).or_default();
            self.update_metric_ids_for_tag_filters(ids, tfs, tr, max_metrics)?;
            if ids.len() > max_metrics {
                return Err(Error::TooManyTimeseries { max: max_metrics });
            }
        }
        let deleted = self.deleted.snapshot();
        if !deleted.is_empty() {
            for ids in per_tenant.values_mut() {
                ids.subtract(&deleted);
            }
        }
        Ok(per_tenant)
    }

    /// Add one clause's matches to `out`
    fn update_metric_ids_for_tag_filters(
        &self,
        out: &mut MetricIdSet,
        tfs: &TagFilters,
        tr: TimeRange,
        max_metrics: usize,
    ) -> Result<()> {
        if tfs.is_empty() {
            let mut ids = MetricIdSet::new();
            self.update_metric_ids_all(&mut ids, tfs.tenant(), max_metrics + 1)?;
            if ids.len() > max_metrics {
                return Err(Error::TooManyTimeseries { max: max_metrics });
            }
            out.union(&ids);
            return Ok(());
        }

        // Sort by encoded prefix for locality on the table.
        let mut ordered: Vec<&TagFilter> = tfs.filters().iter().collect();
        ordered.sort_by(|a, b| a.prefix().cmp(b.prefix()));

        let (mut ids, pivot_idx) = self.pivot_metric_ids(&ordered, tfs.tenant(), tr, max_metrics)?;

        let mut postponed: SmallVec<[usize; 4]> = SmallVec::new();
        let mut successes = 0usize;
        for (i, tf) in ordered.iter().enumerate() {
            if Some(i) == pivot_idx {
                continue;
            }
            if ids.is_empty() {
                break;
            }
            if self.is_useless(USELESS_MULTI, max_metrics, tf)
                || (tf.is_negative() && self.is_useless(USELESS_NEGATIVE, max_metrics, tf))
            {
                IndexCounters::inc(&self.shared.counters.useless_filter_skips);
                postponed.push(i);
                continue;
            }
            match self.intersect_metric_ids_with_tag_filter(tf, &ids) {
                Ok(next) => {
                    ids = next;
                    successes += 1;
                }
                Err(ScanError::Fallback) => {
                    let kind = if tf.is_negative() {
                        USELESS_NEGATIVE
                    } else {
                        USELESS_MULTI
                    };
                    self.mark_useless(kind, max_metrics, tf);
                    postponed.push(i);
                }
                Err(ScanError::Db(err)) => return Err(err),
            }
        }

        if !postponed.is_empty() && !ids.is_empty() {
            let mut unresolved: SmallVec<[usize; 4]> = SmallVec::new();
            if successes > 0 {
                // The candidate set shrank; postponed filters get another
                // shot with budgets derived from the smaller set.
                for &i in &postponed {
                    match self.intersect_metric_ids_with_tag_filter(ordered[i], &ids) {
                        Ok(next) => ids = next,
                        Err(ScanError::Fallback) => unresolved.push(i),
                        Err(ScanError::Db(err)) => return Err(err),
                    }
                }
            } else {
                unresolved = postponed;
            }
            if !unresolved.is_empty() && !ids.is_empty() {
                let remaining: Vec<&TagFilter> =
                    unresolved.iter().map(|&i| ordered[i]).collect();
                debug!(
                    clause = %tfs,
                    candidates = ids.len(),
                    filters = remaining.len(),
                    "falling back to metric-name matching"
                );
                IndexCounters::inc(&self.shared.counters.metric_name_match_fallbacks);
                self.filter_ids_by_metric_names(&mut ids, &remaining, tfs.tenant())?;
            }
        }

        out.union(&ids);
        Ok(())
    }

    // ========================================================================
    // Pivot selection
    // ========================================================================

    /// Choose the cheapest positive filter's ids, or fall back to the
    /// time-range / enumerate-all paths
    fn pivot_metric_ids(
        &self,
        ordered: &[&TagFilter],
        tenant: TenantId,
        tr: TimeRange,
        max_metrics: usize,
    ) -> Result<(MetricIdSet, Option<usize>)> {
        // Short ranges with a fully tracked previous hour cap the pivot:
        // matching candidates against that small set beats scanning a
        // huge tag.
        let mut ceiling = max_metrics;
        if tr.num_days() <= self.shared.config.max_days_per_day_scan {
            let (_, prev_hour) = self.shared.recent_hours.snapshot(now_ms());
            if prev_hour.is_full {
                let tracked = prev_hour.tenant_len(tenant);
                if tracked >= self.shared.config.recent_hour_min_len {
                    ceiling = ceiling.min((tracked / 4).max(100));
                }
            }
        }

        // Adaptive search: grow the cap until some positive filter fits
        // under it, so one enormous tag cannot dominate the query.
        let mut max_allowed = ceiling.min(16).max(1);
        loop {
            if let Some((ids, idx)) = self.min_positive_filter_ids(ordered, max_allowed)? {
                return Ok((ids, Some(idx)));
            }
            if max_allowed >= ceiling {
                break;
            }
            max_allowed = (max_allowed * 4).min(ceiling);
        }

        if let Some(ids) = self.metric_ids_for_time_range(tenant, tr, max_metrics)? {
            return Ok((ids, None));
        }

        let mut ids = MetricIdSet::new();
        self.update_metric_ids_all(&mut ids, tenant, max_metrics + 1)?;
        if ids.len() > max_metrics {
            return Err(Error::TooManyTimeseries { max: max_metrics });
        }
        Ok((ids, None))
    }

    /// The positive filter with the fewest matches under `max_allowed`
    fn min_positive_filter_ids(
        &self,
        ordered: &[&TagFilter],
        max_allowed: usize,
    ) -> Result<Option<(MetricIdSet, usize)>> {
        let mut best: Option<(MetricIdSet, usize)> = None;
        for (i, tf) in ordered.iter().enumerate() {
            if tf.is_negative() {
                continue;
            }
            if self.is_useless(USELESS_SINGLE, max_allowed, tf) {
                IndexCounters::inc(&self.shared.counters.useless_filter_skips);
                continue;
            }
            match self.metric_ids_for_tag_filter(tf, max_allowed) {
                Ok(ids) if ids.len() < max_allowed => {
                    if ids.is_empty() {
                        // Cannot get cheaper than an empty pivot.
                        return Ok(Some((ids, i)));
                    }
                    if best.as_ref().map_or(true, |(b, _)| ids.len() < b.len()) {
                        best = Some((ids, i));
                    }
                }
                Ok(_) => self.mark_useless(USELESS_SINGLE, max_allowed, tf),
                Err(ScanError::Fallback) => self.mark_useless(USELESS_SINGLE, max_allowed, tf),
                Err(ScanError::Db(err)) => return Err(err),
            }
        }
        Ok(best)
    }

    // ========================================================================
    // Single-filter resolution
    // ========================================================================

    /// Collect ids matching one positive filter, up to `max_allowed`
    ///
    /// Returns a set of size ≥ `max_allowed` when the filter is over cap;
    /// raises the fallback signal when the scan budget runs out.
    fn metric_ids_for_tag_filter(
        &self,
        tf: &TagFilter,
        max_allowed: usize,
    ) -> ScanResult<MetricIdSet> {
        let max_loops =
            (max_allowed as u64).saturating_mul(self.shared.config.loops_per_metric);
        let mut scanner = BoundedScanner::new(self.table.as_ref(), max_loops);
        let mut ids = MetricIdSet::new();

        if let Some(ors) = tf.or_suffixes() {
            // Fast path: the filter enumerates its alternatives, so every
            // alternative is one exact-prefix read.
            for suffix in ors {
                let mut seek = tf.prefix().to_vec();
                escape_tag_bytes(&mut seek, suffix);
                seek.push(TAG_SEPARATOR);
                scanner.seek(&seek);
                while scanner.next_item()? {
                    let item = scanner.current_item();
                    if !item.starts_with(&seek) {
                        break;
                    }
                    let tail = IdsTail::new(&item[seek.len()..])?;
                    ids.extend(tail.iter());
                    if ids.len() >= max_allowed {
                        return Ok(ids);
                    }
                }
            }
            return Ok(ids);
        }

        // Slow path: scan the tag-key subspace and test each value suffix.
        scanner.seek(tf.prefix());
        let mut prev_suffix: Vec<u8> = Vec::new();
        let mut prev_matched = false;
        let mut have_prev = false;
        loop {
            if !scanner.next_item()? {
                break;
            }
            let step = {
                let item = scanner.current_item();
                if !item.starts_with(tf.prefix()) {
                    Step::Stop
                } else {
                    let tail = &item[tf.prefix().len()..];
                    let suffix_len = escaped_component_len(tail)?;
                    let suffix = &tail[..suffix_len];
                    // Consecutive rows of one value share a suffix; skip
                    // re-running the predicate.
                    let matched = if have_prev && suffix == prev_suffix.as_slice() {
                        prev_matched
                    } else {
                        let matched = tf.match_suffix(suffix)?;
                        prev_suffix = suffix.to_vec();
                        prev_matched = matched;
                        have_prev = true;
                        matched
                    };
                    if matched {
                        let ids_tail = IdsTail::new(&tail[suffix_len..])?;
                        ids.extend(ids_tail.iter());
                        Step::Continue
                    } else {
                        // Seek past every id row of this value.
                        let mut next = item[..tf.prefix().len() + suffix_len].to_vec();
                        increment_trailing_separator(&mut next)?;
                        Step::SeekPast(next)
                    }
                }
            };
            match step {
                Step::Stop => break,
                Step::SeekPast(next) => scanner.seek(&next),
                Step::Continue => {
                    if ids.len() >= max_allowed {
                        return Ok(ids);
                    }
                }
            }
        }
        Ok(ids)
    }

    // ========================================================================
    // Intersection
    // ========================================================================

    /// Narrow `candidates` by one filter
    ///
    /// Positive filters keep their matches; negative filters remove them
    /// from a copy of the candidate set.
    fn intersect_metric_ids_with_tag_filter(
        &self,
        tf: &TagFilter,
        candidates: &MetricIdSet,
    ) -> ScanResult<MetricIdSet> {
        if candidates.is_empty() {
            return Ok(MetricIdSet::new());
        }
        let matches = self.candidate_matches_for_filter(tf, candidates)?;
        if tf.is_negative() {
            let mut result = candidates.clone();
            result.subtract(&matches);
            Ok(result)
        } else {
            Ok(matches)
        }
    }

    /// The subset of `candidates` matching `tf`
    fn candidate_matches_for_filter(
        &self,
        tf: &TagFilter,
        candidates: &MetricIdSet,
    ) -> ScanResult<MetricIdSet> {
        let first_candidate = candidates.first().expect("candidates not empty");
        let last_candidate = candidates.last().expect("candidates not empty");
        let max_loops = (candidates.len().max(16) as u64)
            .saturating_mul(self.shared.config.loops_per_metric);
        let mut scanner = BoundedScanner::new(self.table.as_ref(), max_loops);
        let mut matches = MetricIdSet::new();

        if let Some(ors) = tf.or_suffixes() {
            for suffix in ors {
                let mut seek = tf.prefix().to_vec();
                escape_tag_bytes(&mut seek, suffix);
                seek.push(TAG_SEPARATOR);
                scanner.seek(&seek);
                while scanner.next_item()? {
                    let step = {
                        let item = scanner.current_item();
                        if !item.starts_with(&seek) {
                            Step::Stop
                        } else {
                            let tail = IdsTail::new(&item[seek.len()..])?;
                            match (tail.first_id(), tail.last_id()) {
                                // Whole row below the candidate range.
                                (Some(_), Some(last)) if last < first_candidate => Step::Continue,
                                // Rows are id-sorted after merge; no later
                                // row of this suffix can match.
                                (Some(first), Some(_)) if first > last_candidate => Step::Stop,
                                _ => {
                                    for id in tail.iter() {
                                        if candidates.has(id) {
                                            matches.add(id);
                                        }
                                    }
                                    Step::Continue
                                }
                            }
                        }
                    };
                    match step {
                        Step::Stop => break,
                        Step::Continue => {}
                        Step::SeekPast(next) => scanner.seek(&next),
                    }
                }
            }
            return Ok(matches);
        }

        // Slow path: scan the subspace and membership-test matching rows.
        scanner.seek(tf.prefix());
        let mut prev_suffix: Vec<u8> = Vec::new();
        let mut prev_matched = false;
        let mut have_prev = false;
        loop {
            if !scanner.next_item()? {
                break;
            }
            let step = {
                let item = scanner.current_item();
                if !item.starts_with(tf.prefix()) {
                    Step::Stop
                } else {
                    let tail = &item[tf.prefix().len()..];
                    let suffix_len = escaped_component_len(tail)?;
                    let suffix = &tail[..suffix_len];
                    let matched = if have_prev && suffix == prev_suffix.as_slice() {
                        prev_matched
                    } else {
                        let matched = tf.match_suffix(suffix)?;
                        prev_suffix = suffix.to_vec();
                        prev_matched = matched;
                        have_prev = true;
                        matched
                    };
                    if matched {
                        let ids_tail = IdsTail::new(&tail[suffix_len..])?;
                        let in_range = match (ids_tail.first_id(), ids_tail.last_id()) {
                            (Some(first), Some(last)) => {
                                last >= first_candidate && first <= last_candidate
                            }
                            _ => false,
                        };
                        if in_range {
                            for id in ids_tail.iter() {
                                if candidates.has(id) {
                                    matches.add(id);
                                }
                            }
                        }
                        Step::Continue
                    } else {
                        let mut next = item[..tf.prefix().len() + suffix_len].to_vec();
                        increment_trailing_separator(&mut next)?;
                        Step::SeekPast(next)
                    }
                }
            };
            match step {
                Step::Stop => break,
                Step::SeekPast(next) => scanner.seek(&next),
                Step::Continue => {}
            }
        }
        Ok(matches)
    }

    // ========================================================================
    // Fallbacks
    // ========================================================================

    /// Evaluate filters against the candidates' parsed metric names
    ///
    /// Bounded by the candidate count: one name fetch per candidate, all
    /// matching in memory. Candidates whose name row is missing are
    /// dropped and counted.
    fn filter_ids_by_metric_names(
        &self,
        ids: &mut MetricIdSet,
        tfs: &[&TagFilter],
        tenant: TenantId,
    ) -> Result<()> {
        let mut dropped = Vec::new();
        for metric_id in ids.iter() {
            match self.search_metric_name(metric_id, tenant)? {
                Some(name) => {
                    let mn = MetricName::unmarshal(&name)?;
                    if tfs.iter().any(|tf| !tf.matches_metric_name(&mn)) {
                        dropped.push(metric_id);
                    }
                }
                None => {
                    IndexCounters::inc(&self.shared.counters.missing_tsids_for_metric_id);
                    dropped.push(metric_id);
                }
            }
        }
        for metric_id in dropped {
            ids.remove(metric_id);
        }
        Ok(())
    }

    /// Every metric id of the tenant, bounded by `limit`
    fn update_metric_ids_all(
        &self,
        ids: &mut MetricIdSet,
        tenant: TenantId,
        limit: usize,
    ) -> Result<()> {
        let mut prefix = Vec::new();
        write_common_prefix(&mut prefix, IndexKind::MetricIdToTsid, tenant);
        let mut search = self.table.search();
        search.seek(&prefix);
        while search.next_item() {
            let item = search.current_item();
            if !item.starts_with(&prefix) {
                break;
            }
            let (metric_id, _) = unmarshal_u64(&item[prefix.len()..])?;
            ids.add(metric_id);
            if ids.len() >= limit {
                break;
            }
        }
        if let Some(err) = search.error() {
            return Err(err.clone());
        }
        Ok(())
    }

    /// Ids active in the range, from the hour sets or the per-day index
    ///
    /// `None` means the range cannot be served here (too wide, or no
    /// per-day data); callers degrade to enumerating the tenant.
    fn metric_ids_for_time_range(
        &self,
        tenant: TenantId,
        tr: TimeRange,
        max_metrics: usize,
    ) -> Result<Option<MetricIdSet>> {
        let counters = &self.shared.counters;
        IndexCounters::inc(&counters.recent_hour_search_calls);
        if let Some(ids) = self
            .shared
            .recent_hours
            .metric_ids_for_time_range(tr, tenant, now_ms())
        {
            if ids.len() > max_metrics {
                return Err(Error::TooManyTimeseries { max: max_metrics });
            }
            IndexCounters::inc(&counters.recent_hour_search_hits);
            return Ok(Some(ids));
        }

        if tr.num_days() > self.shared.config.max_days_per_day_scan {
            return Ok(None);
        }
        IndexCounters::inc(&counters.date_range_search_calls);
        let (min_day, max_day) = tr.day_range();
        let mut ids = MetricIdSet::new();
        let mut search = self.table.search();
        for day in min_day..=max_day {
            let mut prefix = Vec::new();
            write_common_prefix(&mut prefix, IndexKind::DateToMetricId, tenant);
            marshal_u64(&mut prefix, day as u64);
            search.seek(&prefix);
            while search.next_item() {
                let item = search.current_item();
                if !item.starts_with(&prefix) {
                    break;
                }
                let (metric_id, tail) = unmarshal_u64(&item[prefix.len()..])?;
                if !tail.is_empty() {
                    return Err(Error::corruption(
                        "trailing bytes after (date, metric id) row",
                    ));
                }
                ids.add(metric_id);
                if ids.len() > max_metrics {
                    return Err(Error::TooManyTimeseries { max: max_metrics });
                }
            }
            if let Some(err) = search.error() {
                return Err(err.clone());
            }
        }
        if ids.is_empty() {
            // Nothing indexed for those days; the caller falls back.
            return Ok(None);
        }
        IndexCounters::inc(&counters.date_range_search_hits);
        Ok(Some(ids))
    }

    // ========================================================================
    // Useless-filter memoization
    // ========================================================================

    fn useless_key(kind: u8, max: usize, tf: &TagFilter) -> Vec<u8> {
        let mut key = vec![kind];
        marshal_u64(&mut key, max as u64);
        key.extend_from_slice(tf.prefix());
        tf.marshal_shape(&mut key);
        key
    }

    fn is_useless(&self, kind: u8, max: usize, tf: &TagFilter) -> bool {
        self.shared
            .useless_filter_cache
            .get(&Self::useless_key(kind, max, tf))
            .is_some()
    }

    fn mark_useless(&self, kind: u8, max: usize, tf: &TagFilter) {
        self.shared
            .useless_filter_cache
            .put(&Self::useless_key(kind, max, tf), &[1]);
    }
}
