//! Recurring wake-schedule expressions and wake-window inference.
//!
//! Devices carry a schedule like `"08:00,16:00 daily"`: an ordered set of
//! times-of-day at which they are expected to wake and transmit. Incoming
//! wakes are matched to the nearest slot (circularly, so a 23:58 wake can
//! match a 00:00 slot); a wake further from its slot than the tolerance
//! window is an overage but still gets the nearest index for traceability.

use chrono::NaiveTime;
use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

const MINUTES_PER_DAY: i64 = 24 * 60;

#[derive(Debug)]
pub enum ScheduleParseError {
    Empty,
    BadTime(String),
}

impl Display for ScheduleParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleParseError::Empty => write!(f, "schedule expression has no time slots"),
            ScheduleParseError::BadTime(s) => write!(f, "unparseable time slot: {:?}", s),
        }
    }
}

impl Error for ScheduleParseError {}

/// Tolerance for matching a wake to its scheduled slot: a fraction of the
/// nearest neighbor-slot gap, bounded by an absolute cap. Both knobs come
/// from configuration.
#[derive(Debug, Clone, Copy)]
pub struct WakeTolerance {
    pub fraction: f64,
    pub cap_minutes: i64,
}

impl Default for WakeTolerance {
    fn default() -> Self {
        WakeTolerance {
            fraction: 0.5,
            cap_minutes: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowInference {
    /// 1-based position of the matched slot within the day.
    pub index: i32,
    pub slot: NaiveTime,
    pub distance_minutes: i64,
    pub overage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeSchedule {
    slots: Vec<NaiveTime>,
}

impl WakeSchedule {
    /// Parse `"HH:MM[,HH:MM...] [daily]"`. Slots are sorted and deduplicated;
    /// the trailing recurrence keyword is optional (daily is the only cadence
    /// the fleet supports).
    pub fn parse(expr: &str) -> Result<Self, ScheduleParseError> {
        let body = expr
            .trim()
            .strip_suffix("daily")
            .or_else(|| expr.trim().strip_suffix("DAILY"))
            .unwrap_or(expr)
            .trim();

        let mut slots = Vec::new();
        for part in body.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let time = NaiveTime::parse_from_str(part, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(part, "%H:%M:%S"))
                .map_err(|_| ScheduleParseError::BadTime(part.to_string()))?;
            slots.push(time);
        }
        slots.sort_unstable();
        slots.dedup();

        if slots.is_empty() {
            return Err(ScheduleParseError::Empty);
        }
        Ok(WakeSchedule { slots })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[NaiveTime] {
        &self.slots
    }

    /// Match a wake time-of-day to the nearest scheduled slot. The nearest
    /// index is assigned unconditionally; only the tolerance test decides
    /// whether the wake counts as overage.
    pub fn infer_window(&self, at: NaiveTime, tolerance: WakeTolerance) -> WindowInference {
        let at_min = minutes_of_day(at);

        let (best_pos, best_dist) = self
            .slots
            .iter()
            .enumerate()
            .map(|(pos, slot)| (pos, circular_distance(at_min, minutes_of_day(*slot))))
            .min_by_key(|(_, dist)| *dist)
            .expect("schedule has at least one slot");

        let gap = self.neighbor_gap_minutes(best_pos);
        let allowed = ((gap as f64) * tolerance.fraction).floor() as i64;
        let allowed = allowed.min(tolerance.cap_minutes).max(0);

        WindowInference {
            index: (best_pos + 1) as i32,
            slot: self.slots[best_pos],
            distance_minutes: best_dist,
            overage: best_dist > allowed,
        }
    }

    /// Circular gap between a slot and its closest neighbor. A single-slot
    /// schedule spans the whole day.
    fn neighbor_gap_minutes(&self, pos: usize) -> i64 {
        let n = self.slots.len();
        if n == 1 {
            return MINUTES_PER_DAY;
        }
        let here = minutes_of_day(self.slots[pos]);
        let prev = minutes_of_day(self.slots[(pos + n - 1) % n]);
        let next = minutes_of_day(self.slots[(pos + 1) % n]);
        circular_distance(here, prev).min(circular_distance(here, next))
    }
}

fn minutes_of_day(t: NaiveTime) -> i64 {
    use chrono::Timelike;
    (t.hour() as i64) * 60 + t.minute() as i64
}

fn circular_distance(a: i64, b: i64) -> i64 {
    let d = (a - b).abs();
    d.min(MINUTES_PER_DAY - d)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parses_sorted_and_deduplicated() {
        let s = WakeSchedule::parse("16:00,08:00,08:00 daily").unwrap();
        assert_eq!(s.slots(), &[t(8, 0), t(16, 0)]);
        assert_eq!(s.slot_count(), 2);
    }

    #[test]
    fn parses_without_recurrence_keyword() {
        let s = WakeSchedule::parse("06:30").unwrap();
        assert_eq!(s.slots(), &[t(6, 30)]);
    }

    #[test]
    fn rejects_empty_and_malformed() {
        assert!(matches!(WakeSchedule::parse("   "), Err(ScheduleParseError::Empty)));
        assert!(matches!(
            WakeSchedule::parse("8am,noon"),
            Err(ScheduleParseError::BadTime(_))
        ));
    }

    #[test]
    fn on_time_wake_matches_first_slot() {
        let s = WakeSchedule::parse("08:00,16:00 daily").unwrap();
        let w = s.infer_window(t(8, 2), WakeTolerance::default());
        assert_eq!(w.index, 1);
        assert_eq!(w.distance_minutes, 2);
        assert!(!w.overage);
    }

    #[test]
    fn late_morning_wake_is_overage_but_still_slotted() {
        // 11:00 is 180 min from 08:00 and 300 min from 16:00: nearest is the
        // first slot, but well past the 120-min tolerance cap.
        let s = WakeSchedule::parse("08:00,16:00 daily").unwrap();
        let w = s.infer_window(t(11, 0), WakeTolerance::default());
        assert_eq!(w.index, 1);
        assert_eq!(w.distance_minutes, 180);
        assert!(w.overage);
    }

    #[test]
    fn nearest_slot_wins_past_midpoint() {
        let s = WakeSchedule::parse("08:00,16:00 daily").unwrap();
        let w = s.infer_window(t(13, 0), WakeTolerance::default());
        assert_eq!(w.index, 2);
        assert_eq!(w.distance_minutes, 180);
        assert!(w.overage);
    }

    #[test]
    fn matching_wraps_around_midnight() {
        let s = WakeSchedule::parse("23:30,06:00").unwrap();
        // 00:15 is 45 min past the 23:30 slot going through midnight.
        let w = s.infer_window(t(0, 15), WakeTolerance::default());
        assert_eq!(w.slot, t(23, 30));
        assert_eq!(w.index, 2); // slots are day-ordered: 06:00 first
        assert_eq!(w.distance_minutes, 45);
        assert!(!w.overage);
    }

    #[test]
    fn single_slot_schedule_tolerates_up_to_the_cap() {
        let s = WakeSchedule::parse("12:00 daily").unwrap();
        let near = s.infer_window(t(13, 59), WakeTolerance::default());
        assert!(!near.overage);
        let far = s.infer_window(t(14, 1), WakeTolerance::default());
        assert!(far.overage);
        assert_eq!(far.index, 1);
    }

    #[test]
    fn fraction_binds_before_the_cap_on_dense_schedules() {
        // Slots every hour: neighbor gap 60, fraction 0.5 -> 30 min allowed.
        let s = WakeSchedule::parse("09:00,10:00,11:00").unwrap();
        let w = s.infer_window(t(10, 29), WakeTolerance::default());
        assert!(!w.overage);
        let w = s.infer_window(t(10, 31), WakeTolerance::default());
        assert_eq!(w.index, 3); // 29 min to 11:00 beats 31 min to 10:00
        assert!(!w.overage);
        let w = s.infer_window(t(10, 45), WakeTolerance { fraction: 0.2, cap_minutes: 120 });
        assert!(w.overage);
    }
}
