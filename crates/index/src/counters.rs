//! Operational counters
//!
//! Plain atomics bumped on the paths worth watching in production: tolerated
//! missing rows, recent-hour vs per-day index effectiveness, and slow
//! metric-name fallbacks. A sustained low hit rate on the time-range
//! paths is a tuning signal, not an error.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every generation
#[derive(Debug, Default)]
pub struct IndexCounters {
    /// Known metric ids whose id→TSID row was absent (incomplete snapshot)
    pub missing_tsids_for_metric_id: AtomicU64,
    /// Recent-hour fast path attempts
    pub recent_hour_search_calls: AtomicU64,
    /// Recent-hour fast path successes
    pub recent_hour_search_hits: AtomicU64,
    /// Per-day index scan attempts
    pub date_range_search_calls: AtomicU64,
    /// Per-day index scans that produced ids
    pub date_range_search_hits: AtomicU64,
    /// Filter clauses that fell back to in-memory metric-name matching
    pub metric_name_match_fallbacks: AtomicU64,
    /// Filters skipped because the useless-filter cache flagged them
    pub useless_filter_skips: AtomicU64,
}

impl IndexCounters {
    /// Point-in-time copy for logs and assertions
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            missing_tsids_for_metric_id: self.missing_tsids_for_metric_id.load(Ordering::Relaxed),
            recent_hour_search_calls: self.recent_hour_search_calls.load(Ordering::Relaxed),
            recent_hour_search_hits: self.recent_hour_search_hits.load(Ordering::Relaxed),
            date_range_search_calls: self.date_range_search_calls.load(Ordering::Relaxed),
            date_range_search_hits: self.date_range_search_hits.load(Ordering::Relaxed),
            metric_name_match_fallbacks: self.metric_name_match_fallbacks.load(Ordering::Relaxed),
            useless_filter_skips: self.useless_filter_skips.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of [`IndexCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// See [`IndexCounters::missing_tsids_for_metric_id`]
    pub missing_tsids_for_metric_id: u64,
    /// See [`IndexCounters::recent_hour_search_calls`]
    pub recent_hour_search_calls: u64,
    /// See [`IndexCounters::recent_hour_search_hits`]
    pub recent_hour_search_hits: u64,
    /// See [`IndexCounters::date_range_search_calls`]
    pub date_range_search_calls: u64,
    /// See [`IndexCounters::date_range_search_hits`]
    pub date_range_search_hits: u64,
    /// See [`IndexCounters::metric_name_match_fallbacks`]
    pub metric_name_match_fallbacks: u64,
    /// See [`IndexCounters::useless_filter_skips`]
    pub useless_filter_skips: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let counters = IndexCounters::default();
        IndexCounters::inc(&counters.recent_hour_search_calls);
        IndexCounters::inc(&counters.recent_hour_search_calls);
        IndexCounters::inc(&counters.recent_hour_search_hits);
        let snap = counters.snapshot();
        assert_eq!(snap.recent_hour_search_calls, 2);
        assert_eq!(snap.recent_hour_search_hits, 1);
        assert_eq!(snap.missing_tsids_for_metric_id, 0);
    }
}
