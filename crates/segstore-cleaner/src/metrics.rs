//! Cleaner observability.
//!
//! Running counters live in [`CleanerStats`] inside the cleaner; a
//! [`CleanerMetricsSnapshot`] is assembled on demand with the derived
//! gauges filled in from the segment state. The `Display` impl emits
//! `async_cleaner_*` name=value pairs for scraping.

use std::fmt;

/// Number of buckets in the segment-utilization histogram; bucket `i`
/// covers utilizations up to `(i + 1) / 10`.
pub const UTIL_BUCKETS: usize = 10;

// ---------------------------------------------------------------------------
// Utilization histogram
// ---------------------------------------------------------------------------

/// Distribution of per-segment utilization across all segments.
///
/// Every segment sits in exactly one bucket; usage changes move it with
/// [`UtilizationHistogram::adjust`].
#[derive(Debug, Clone, Default)]
pub struct UtilizationHistogram {
    buckets: [u64; UTIL_BUCKETS],
}

impl UtilizationHistogram {
    /// All `segments` start empty, in bucket 0.
    #[must_use]
    pub fn new(segments: u64) -> Self {
        let mut buckets = [0; UTIL_BUCKETS];
        buckets[0] = segments;
        Self { buckets }
    }

    fn bucket_index(utilization: f64) -> usize {
        assert!((0.0..=1.0).contains(&utilization));
        ((utilization * UTIL_BUCKETS as f64) as usize).min(UTIL_BUCKETS - 1)
    }

    /// Move one segment from its `old` utilization bucket to `new`.
    pub fn adjust(&mut self, old: f64, new: f64) {
        let old_index = Self::bucket_index(old);
        let new_index = Self::bucket_index(new);
        if old_index == new_index {
            return;
        }
        assert!(self.buckets[old_index] > 0);
        self.buckets[old_index] -= 1;
        self.buckets[new_index] += 1;
    }

    #[must_use]
    pub fn buckets(&self) -> &[u64; UTIL_BUCKETS] {
        &self.buckets
    }

    /// Upper bound of bucket `i`.
    #[must_use]
    pub fn upper_bound(i: usize) -> f64 {
        (i + 1) as f64 / UTIL_BUCKETS as f64
    }
}

// ---------------------------------------------------------------------------
// Running counters
// ---------------------------------------------------------------------------

/// Counters owned by the cleaner and bumped inline between suspension
/// points.
#[derive(Debug, Clone, Default)]
pub struct CleanerStats {
    /// Bytes occupied by live extents.
    pub used_bytes: u64,
    /// Outstanding projected-usage reservations in bytes.
    pub projected_used_bytes: u64,
    /// Total reservations granted.
    pub projected_count: u64,
    /// Sum of `projected_used_bytes` sampled at every grant.
    pub projected_used_bytes_sum: u64,

    /// Reservations requested.
    pub io_count: u64,
    /// Reservations currently blocked.
    pub io_blocking_num: u64,
    /// Reservations that blocked at least once.
    pub io_blocked_count: u64,
    /// ... because the journal needed trimming.
    pub io_blocked_count_trim: u64,
    /// ... because space needed reclaiming.
    pub io_blocked_count_reclaim: u64,
    /// Sum of concurrent blocked reservations sampled at every block.
    pub io_blocked_sum: u64,

    /// Live bytes rewritten by the reclaim currently in flight.
    pub reclaiming_bytes: u64,
    /// Live bytes rewritten by completed reclaims.
    pub reclaimed_bytes: u64,
    /// Total segment bytes released by completed reclaims.
    pub reclaimed_segment_bytes: u64,

    /// Live bytes at the moment journal segments closed.
    pub closed_journal_used_bytes: u64,
    /// Total bytes of closed journal segments.
    pub closed_journal_total_bytes: u64,
    /// Live bytes at the moment OOL segments closed.
    pub closed_ool_used_bytes: u64,
    /// Total bytes of closed OOL segments.
    pub closed_ool_total_bytes: u64,

    pub segment_util: UtilizationHistogram,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of the full `async_cleaner` metric surface.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanerMetricsSnapshot {
    pub segments_number: u64,
    pub segment_size: u64,
    pub segments_in_journal: u64,
    pub segments_type_journal: u64,
    pub segments_type_ool: u64,
    pub segments_open: u64,
    pub segments_empty: u64,
    pub segments_closed: u64,

    pub count_open_journal: u64,
    pub count_open_ool: u64,
    pub count_release_journal: u64,
    pub count_release_ool: u64,
    pub count_close_journal: u64,
    pub count_close_ool: u64,

    pub total_bytes: u64,
    pub available_bytes: u64,
    pub unavailable_unreclaimable_bytes: u64,
    pub unavailable_reclaimable_bytes: u64,
    pub used_bytes: u64,
    pub unavailable_unused_bytes: u64,

    pub dirty_journal_bytes: u64,
    pub alloc_journal_bytes: u64,

    pub projected_count: u64,
    pub projected_used_bytes_sum: u64,

    pub io_count: u64,
    pub io_blocked_count: u64,
    pub io_blocked_count_trim: u64,
    pub io_blocked_count_reclaim: u64,
    pub io_blocked_sum: u64,

    pub reclaimed_bytes: u64,
    pub reclaimed_segment_bytes: u64,
    pub closed_journal_used_bytes: u64,
    pub closed_journal_total_bytes: u64,
    pub closed_ool_used_bytes: u64,
    pub closed_ool_total_bytes: u64,

    pub available_ratio: f64,
    pub reclaim_ratio: f64,
    pub segment_utilization_distribution: [u64; UTIL_BUCKETS],
}

impl fmt::Display for CleanerMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "async_cleaner_segments_number={} async_cleaner_segments_in_journal={} \
             async_cleaner_segments_open={} async_cleaner_segments_empty={} \
             async_cleaner_segments_closed={} async_cleaner_total_bytes={} \
             async_cleaner_available_bytes={} async_cleaner_used_bytes={} \
             async_cleaner_dirty_journal_bytes={} async_cleaner_alloc_journal_bytes={} \
             async_cleaner_projected_count={} async_cleaner_io_count={} \
             async_cleaner_io_blocked_count={} async_cleaner_reclaimed_bytes={} \
             async_cleaner_available_ratio={:.3} async_cleaner_reclaim_ratio={:.3}",
            self.segments_number,
            self.segments_in_journal,
            self.segments_open,
            self.segments_empty,
            self.segments_closed,
            self.total_bytes,
            self.available_bytes,
            self.used_bytes,
            self.dirty_journal_bytes,
            self.alloc_journal_bytes,
            self.projected_count,
            self.io_count,
            self.io_blocked_count,
            self.reclaimed_bytes,
            self.available_ratio,
            self.reclaim_ratio,
        )
    }
}

// ===========================================================================
// Tests
// ===========================================================================
