//! Benefit-cost scoring for reclaim victim selection.
//!
//! The formula is a deployment-time constant, not a runtime knob, so the
//! hot path carries no dispatch. Higher score is better; scoring is only
//! defined for closed segments that are out of the journal.

use segstore_types::ModTime;

/// Available selection formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcFormula {
    /// `1 - u`: purely utilization driven.
    Greedy,
    /// Classic log-structured cost-benefit: age multiplies the payoff.
    CostBenefit,
    /// Quadratic blend of utilization and relative age.
    Benefit,
}

/// The shipped formula.
pub const GC_FORMULA: GcFormula = GcFormula::CostBenefit;

/// Score one closed segment.
///
/// `utilization` is live bytes over segment size; `modify_time` is the
/// segment's average extent modify time; `now` is the reference time;
/// `bound` is the minimum modify time across all tracked segments (only
/// the `Benefit` formula reads it). A fully-utilized segment scores zero
/// under every formula and is therefore never selected.
///
/// # Panics
///
/// Panics if `utilization` is outside `[0, 1]`.
#[must_use]
pub fn benefit_cost(
    formula: GcFormula,
    utilization: f64,
    modify_time: ModTime,
    now: ModTime,
    bound: ModTime,
) -> f64 {
    assert!((0.0..=1.0).contains(&utilization));
    match formula {
        GcFormula::Greedy => 1.0 - utilization,
        GcFormula::CostBenefit => {
            if utilization == 0.0 {
                return f64::INFINITY;
            }
            let age_segment = modify_time.as_millis() as f64;
            let age_now = now.as_millis() as f64;
            if age_now > age_segment {
                (1.0 - utilization) * (age_now - age_segment) / (2.0 * utilization)
            } else {
                // clock went backwards; fall back to pure cost-benefit
                (1.0 - utilization) / (2.0 * utilization)
            }
        }
        GcFormula::Benefit => {
            // Midpoint age when the bounds cannot be trusted.
            let mut age_factor = 0.5;
            if !bound.is_null() && !modify_time.is_null() && now > modify_time {
                debug_assert!(modify_time >= bound);
                let age_bound = bound.as_millis() as f64;
                let age_now = now.as_millis() as f64;
                let age_segment = modify_time.as_millis() as f64;
                age_factor = (age_now - age_segment) / (age_now - age_bound);
            }
            (1.0 - 2.0 * age_factor) * utilization * utilization
                + (2.0 * age_factor - 2.0) * utilization
                + 1.0
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: i64) -> ModTime {
        ModTime::from_millis(v)
    }

    // ── greedy ──

    #[test]
    fn greedy_prefers_emptier_segments() {
        let score = |u| benefit_cost(GcFormula::Greedy, u, ModTime::NULL, ModTime::NULL, ModTime::NULL);
        assert!(score(0.25) > score(0.75));
        assert_eq!(score(0.0), 1.0);
    }

    // ── cost-benefit ──

    #[test]
    fn cost_benefit_zero_utilization_is_infinite() {
        let score = benefit_cost(GcFormula::CostBenefit, 0.0, ms(100), ms(200), ModTime::NULL);
        assert!(score.is_infinite());
    }

    #[test]
    fn cost_benefit_prefers_lower_utilization() {
        // A quarter-live segment vs a nearly full one.
        let now = ms(10_000);
        let a = benefit_cost(GcFormula::CostBenefit, 0.25, ms(1_000), now, ModTime::NULL);
        let b = benefit_cost(GcFormula::CostBenefit, 0.99, ms(1_000), now, ModTime::NULL);
        assert!(a > b);
    }

    #[test]
    fn cost_benefit_prefers_older_segments() {
        let now = ms(10_000);
        let old = benefit_cost(GcFormula::CostBenefit, 0.5, ms(1_000), now, ModTime::NULL);
        let young = benefit_cost(GcFormula::CostBenefit, 0.5, ms(9_000), now, ModTime::NULL);
        assert!(old > young);
    }

    #[test]
    fn cost_benefit_survives_clock_skew() {
        // Segment stamped in the future relative to "now".
        let score = benefit_cost(GcFormula::CostBenefit, 0.5, ms(10_000), ms(5_000), ModTime::NULL);
        assert_eq!(score, 0.5 / (2.0 * 0.5));
    }

    #[test]
    fn cost_benefit_matches_formula() {
        let now = ms(3_000);
        let seg = ms(1_000);
        let u = 0.25;
        let expected = (1.0 - u) * 2_000.0 / (2.0 * u);
        let got = benefit_cost(GcFormula::CostBenefit, u, seg, now, ModTime::NULL);
        assert!((got - expected).abs() < 1e-9);
    }

    // ── benefit ──

    #[test]
    fn benefit_uses_midpoint_when_bound_is_null() {
        // a = 0.5 collapses the quadratic to 1 - u.
        let got = benefit_cost(GcFormula::Benefit, 0.4, ms(1_000), ms(2_000), ModTime::NULL);
        assert!((got - 0.6).abs() < 1e-9);
    }

    #[test]
    fn benefit_rewards_relative_age() {
        let now = ms(10_000);
        let bound = ms(1_000);
        // A segment at the bound is the oldest (a = 1); newer segments score lower.
        let oldest = benefit_cost(GcFormula::Benefit, 0.5, bound, now, bound);
        let newer = benefit_cost(GcFormula::Benefit, 0.5, ms(8_000), now, bound);
        assert!(oldest > newer);
    }

    #[test]
    fn benefit_matches_formula() {
        let now = ms(10_000);
        let bound = ms(2_000);
        let seg = ms(4_000);
        let u = 0.3;
        let a = (10_000.0 - 4_000.0) / (10_000.0 - 2_000.0);
        let expected = (1.0 - 2.0 * a) * u * u + (2.0 * a - 2.0) * u + 1.0;
        let got = benefit_cost(GcFormula::Benefit, u, seg, now, bound);
        assert!((got - expected).abs() < 1e-9);
    }

    // ── bounds ──

    #[test]
    fn full_utilization_scores_zero_everywhere() {
        let now = ms(10_000);
        let seg = ms(1_000);
        for formula in [GcFormula::Greedy, GcFormula::CostBenefit, GcFormula::Benefit] {
            let score = benefit_cost(formula, 1.0, seg, now, ms(500));
            assert!(score.abs() < 1e-9, "{formula:?} scored {score}");
        }
    }

    #[test]
    #[should_panic]
    fn out_of_range_utilization_is_rejected() {
        benefit_cost(GcFormula::Greedy, 1.5, ModTime::NULL, ModTime::NULL, ModTime::NULL);
    }

    #[test]
    fn shipped_formula_is_cost_benefit() {
        assert_eq!(GC_FORMULA, GcFormula::CostBenefit);
    }
}
