//! VTT-style mold growth index model.
//!
//! The index lives on a 0–6 scale and evolves in one-hour steps from
//! temperature and relative humidity. Growth is only possible above a
//! temperature-dependent critical humidity; below it the index slowly
//! relaxes toward zero. Forecasts hold the latest observation constant
//! (persistence), they are not a weather model.

use core::fmt;
use std::fmt::{Display, Formatter};

pub const INDEX_MAX: f64 = 6.0;

/// Valid temperature domain for the model; outside it growth is impossible.
pub const TEMP_MIN_C: f64 = 0.0;
pub const TEMP_MAX_C: f64 = 50.0;

/// Rate bounds in index units per hour.
pub const MAX_GROWTH_RATE: f64 = 0.1;
pub const DECAY_RATE: f64 = -0.005;

const RH_CRIT_FLOOR: f64 = 65.0;
const LEVEL_THRESHOLDS: [(f64, RiskLevel); 4] = [
    (0.5, RiskLevel::Moderate),
    (1.5, RiskLevel::Elevated),
    (3.0, RiskLevel::High),
    (5.0, RiskLevel::Critical),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Moderate,
    Elevated,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::Elevated => "elevated",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl Display for RiskLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum relative humidity (%) at which growth is thermodynamically
/// favorable at the given temperature. 100 means growth is impossible.
pub fn critical_rh(temp_c: f64) -> f64 {
    if !(TEMP_MIN_C..=TEMP_MAX_C).contains(&temp_c) || !temp_c.is_finite() {
        return 100.0;
    }
    let t = temp_c;
    let rh = -0.00267 * t * t * t + 0.160 * t * t - 3.13 * t + 100.0;
    rh.clamp(RH_CRIT_FLOOR, 100.0)
}

/// Hourly index change at constant conditions. Non-physical inputs count as
/// "no growth", never as an error.
pub fn growth_rate_per_hour(temp_c: f64, rh_pct: f64, index: f64) -> f64 {
    let favorable = rh_pct.is_finite()
        && (0.0..=100.0).contains(&rh_pct)
        && rh_pct > critical_rh(temp_c);

    if !favorable {
        return if index > 0.0 { DECAY_RATE } else { 0.0 };
    }

    // Favorability peaks between 20 and 30 degC and falls to zero at the
    // domain edges.
    let temp_factor = (temp_c * (TEMP_MAX_C - temp_c) / 625.0).clamp(0.0, 1.0);
    // Humidity excess saturates 20 points above the critical threshold.
    let humidity_factor = ((rh_pct - critical_rh(temp_c)) / 20.0).clamp(0.0, 1.0);
    // Diminishing returns as the index approaches its ceiling.
    let saturation_factor = (1.0 - index / INDEX_MAX).clamp(0.0, 1.0);

    (MAX_GROWTH_RATE * temp_factor * humidity_factor * saturation_factor).clamp(DECAY_RATE, MAX_GROWTH_RATE)
}

/// Advance the index by one one-hour step.
pub fn evolve(index: f64, temp_c: f64, rh_pct: f64) -> f64 {
    (index + growth_rate_per_hour(temp_c, rh_pct, index)).clamp(0.0, INDEX_MAX)
}

/// Persistence forecast: repeated one-hour steps holding conditions at the
/// latest observed values.
pub fn forecast(index: f64, temp_c: f64, rh_pct: f64, hours_ahead: u32) -> f64 {
    let mut idx = index.clamp(0.0, INDEX_MAX);
    for _ in 0..hours_ahead {
        idx = evolve(idx, temp_c, rh_pct);
    }
    idx
}

pub fn risk_level(index: f64) -> RiskLevel {
    let mut level = RiskLevel::Low;
    for (threshold, l) in LEVEL_THRESHOLDS {
        if index >= threshold {
            level = l;
        }
    }
    level
}

/// Linear extrapolation to the next level boundary; None when the index is
/// not growing or already past the last threshold.
pub fn hours_to_next_level(index: f64, rate: f64) -> Option<f64> {
    if rate <= 0.0 {
        return None;
    }
    LEVEL_THRESHOLDS
        .iter()
        .map(|(threshold, _)| *threshold)
        .find(|threshold| *threshold > index)
        .map(|threshold| (threshold - index) / rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_rh_anchor_points() {
        let at_25 = critical_rh(25.0);
        assert!((78.0..=80.5).contains(&at_25), "critical_rh(25) = {at_25}");
        assert_eq!(critical_rh(0.0), 100.0);
        assert_eq!(critical_rh(60.0), 100.0);
        assert_eq!(critical_rh(-5.0), 100.0);
    }

    #[test]
    fn critical_rh_never_leaves_its_band() {
        let mut t = 0.0;
        while t <= 50.0 {
            let rh = critical_rh(t);
            assert!((65.0..=100.0).contains(&rh), "critical_rh({t}) = {rh}");
            t += 0.5;
        }
    }

    #[test]
    fn no_growth_at_or_below_critical_humidity() {
        let rh = critical_rh(25.0);
        assert_eq!(growth_rate_per_hour(25.0, rh, 0.0), 0.0);
        assert_eq!(growth_rate_per_hour(25.0, rh - 5.0, 2.0), DECAY_RATE);
    }

    #[test]
    fn non_physical_inputs_mean_no_growth() {
        assert_eq!(growth_rate_per_hour(25.0, 120.0, 0.0), 0.0);
        assert_eq!(growth_rate_per_hour(25.0, -3.0, 0.0), 0.0);
        assert_eq!(growth_rate_per_hour(f64::NAN, 90.0, 0.0), 0.0);
        assert_eq!(growth_rate_per_hour(80.0, 90.0, 1.0), DECAY_RATE);
    }

    #[test]
    fn growth_is_monotone_while_humid() {
        let mut idx = 0.0;
        for _ in 0..48 {
            let next = evolve(idx, 25.0, 90.0);
            assert!(next >= idx);
            idx = next;
        }
        assert!(idx > 0.0);
    }

    #[test]
    fn decay_relaxes_toward_zero_but_not_below() {
        let mut idx = 0.02;
        for _ in 0..10 {
            idx = evolve(idx, 25.0, 40.0);
            assert!(idx >= 0.0);
        }
        assert_eq!(idx, 0.0);
    }

    #[test]
    fn forecast_stays_in_bounds() {
        for start in [0.0, 2.5, 6.0] {
            for hours in [24, 48, 72] {
                let f = forecast(start, 25.0, 90.0, hours);
                assert!((0.0..=INDEX_MAX).contains(&f), "forecast({start}, .., {hours}) = {f}");
            }
        }
    }

    #[test]
    fn forecast_saturates_at_the_ceiling() {
        let f = forecast(5.95, 25.0, 100.0, 72);
        assert!(f <= INDEX_MAX);
        assert!(f > 5.95);
    }

    #[test]
    fn level_thresholds() {
        assert_eq!(risk_level(0.0), RiskLevel::Low);
        assert_eq!(risk_level(0.49), RiskLevel::Low);
        assert_eq!(risk_level(0.5), RiskLevel::Moderate);
        assert_eq!(risk_level(1.5), RiskLevel::Elevated);
        assert_eq!(risk_level(3.0), RiskLevel::High);
        assert_eq!(risk_level(5.0), RiskLevel::Critical);
        assert_eq!(risk_level(6.0), RiskLevel::Critical);
    }

    #[test]
    fn hours_to_next_level_extrapolates_linearly() {
        assert_eq!(hours_to_next_level(1.0, 0.1), Some(5.0));
        assert_eq!(hours_to_next_level(0.0, 0.05), Some(10.0));
        assert_eq!(hours_to_next_level(1.0, 0.0), None);
        assert_eq!(hours_to_next_level(2.0, DECAY_RATE), None);
        assert_eq!(hours_to_next_level(5.5, 0.1), None);
    }
}
