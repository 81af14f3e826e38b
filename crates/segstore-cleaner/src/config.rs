//! Cleaner tuning knobs.

/// Tunables governing journal trimming, reclamation, and admission control.
///
/// All byte values are raw device bytes. Ratios are fractions of the total
/// managed space in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Desired upper bound of the dirty journal length; trim-dirty cycles
    /// fire while the dirty tail lags further than this behind the head.
    pub target_journal_dirty_bytes: u64,
    /// Desired upper bound of the alloc journal length; trim-alloc cycles
    /// fire while the alloc tail lags further than this behind the head.
    pub target_journal_alloc_bytes: u64,
    /// Hard ceiling on the journal length; writers block above it.
    pub journal_tail_limit_bytes: u64,
    /// Max bytes of dirty extents rewritten per trim-dirty cycle.
    pub rewrite_dirty_bytes_per_cycle: u64,
    /// Max bytes of backref deltas merged per trim-alloc cycle.
    pub rewrite_backref_bytes_per_cycle: u64,
    /// Max bytes scanned per reclaim cycle.
    pub reclaim_bytes_per_cycle: u64,
    /// Reclaim fires while the projected available ratio is below this.
    pub available_ratio_gc_start: f64,
    /// Writers block while the projected available ratio is below this.
    pub available_ratio_hard_limit: f64,
    /// Audit mode: use the detailed (bitmap) space tracker.
    pub detailed_space_tracking: bool,
    /// Disable trimming and admission blocking entirely. Used by offline
    /// tooling and tests that bootstrap cleaner state by hand.
    pub disable_trim: bool,
}

impl CleanerConfig {
    /// Assert the configuration is internally consistent.
    ///
    /// # Panics
    ///
    /// Panics on an unusable configuration; there is no point limping along
    /// with back-pressure thresholds that can never fire.
    pub fn validate(&self) {
        assert!(self.journal_tail_limit_bytes > self.target_journal_dirty_bytes);
        assert!(self.journal_tail_limit_bytes > self.target_journal_alloc_bytes);
        assert!(self.rewrite_dirty_bytes_per_cycle > 0);
        assert!(self.rewrite_backref_bytes_per_cycle > 0);
        assert!(self.reclaim_bytes_per_cycle > 0);
        assert!((0.0..=1.0).contains(&self.available_ratio_hard_limit));
        assert!((0.0..=1.0).contains(&self.available_ratio_gc_start));
        assert!(self.available_ratio_gc_start >= self.available_ratio_hard_limit);
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            target_journal_dirty_bytes: 64 << 20,
            target_journal_alloc_bytes: 64 << 20,
            journal_tail_limit_bytes: 256 << 20,
            rewrite_dirty_bytes_per_cycle: 16 << 20,
            rewrite_backref_bytes_per_cycle: 16 << 20,
            reclaim_bytes_per_cycle: 16 << 20,
            available_ratio_gc_start: 0.2,
            available_ratio_hard_limit: 0.1,
            detailed_space_tracking: false,
            disable_trim: false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        CleanerConfig::default().validate();
    }

    #[test]
    #[should_panic]
    fn tail_limit_below_dirty_target_is_rejected() {
        let config = CleanerConfig {
            target_journal_dirty_bytes: 512,
            journal_tail_limit_bytes: 256,
            ..CleanerConfig::default()
        };
        config.validate();
    }

    #[test]
    #[should_panic]
    fn hard_limit_above_gc_start_is_rejected() {
        let config = CleanerConfig {
            available_ratio_gc_start: 0.1,
            available_ratio_hard_limit: 0.2,
            ..CleanerConfig::default()
        };
        config.validate();
    }
}
