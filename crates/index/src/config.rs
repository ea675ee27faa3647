//! Index configuration
//!
//! Cache capacities derive from one process memory budget; the remaining
//! knobs are the scan-cost constants the planner is built around.
//! Configuration loading (files, flags) is the host's concern; this is a
//! plain struct.

/// Tunables for one index instance
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Memory budget split across the caches
    pub mem_budget_bytes: usize,
    /// Scan-loop budget per requested metric (the K constant)
    ///
    /// A tag scan more expensive than `max_metrics × K` steps is dominated
    /// by matching the candidates' metric names directly, so it falls back.
    pub loops_per_metric: u64,
    /// Widest time range served by the per-day index, in days
    pub max_days_per_day_scan: i64,
    /// Minimum previous-hour set size before it adjusts the pivot ceiling
    pub recent_hour_min_len: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            mem_budget_bytes: 256 << 20,
            loops_per_metric: 400,
            max_days_per_day_scan: 40,
            recent_hour_min_len: 256,
        }
    }
}

impl IndexConfig {
    /// Budget for the tag-filters→TSIDs cache
    pub fn tag_filters_cache_bytes(&self) -> usize {
        self.mem_budget_bytes / 4
    }

    /// Budget for the metric-id→TSID cache
    pub fn metric_id_cache_bytes(&self) -> usize {
        self.mem_budget_bytes / 8
    }

    /// Budget for the metric-id→name cache
    pub fn metric_name_cache_bytes(&self) -> usize {
        self.mem_budget_bytes / 8
    }

    /// Budget for the useless-filter cache
    pub fn useless_filter_cache_bytes(&self) -> usize {
        self.mem_budget_bytes / 16
    }

    /// Budget for the (date, metric id) presence cache
    pub fn date_presence_cache_bytes(&self) -> usize {
        self.mem_budget_bytes / 16
    }
}
