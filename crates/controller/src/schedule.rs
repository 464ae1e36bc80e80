//! Recurring watering windows: a start time-of-day, a duration, and the set
//! of weekdays the window applies to.
//!
//! All comparisons are done on seconds-of-day modulo 24h, so a window that
//! straddles midnight (23:59:00 + 120s) behaves like any other window.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::macros::format_description;
use time::{Time, Weekday};

pub(crate) const SECONDS_PER_DAY: i64 = 86_400;

time::serde::format_description!(hms, Time, "[hour]:[minute]:[second]");

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("duration must be between 1 and {max} seconds, got {0}", max = SECONDS_PER_DAY - 1)]
    Duration(i64),
    #[error("weekday {0} out of range (0 = Monday .. 6 = Sunday)")]
    Weekday(i64),
    #[error("weekday set is empty")]
    NoWeekdays,
    #[error("invalid start time '{0}', expected HH:MM:SS")]
    StartTime(String),
}

// ---------------------------------------------------------------------------
// Weekday set
// ---------------------------------------------------------------------------

/// Bitmask of weekdays, Monday = bit 0 .. Sunday = bit 6. Never empty.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<i64>", into = "Vec<u8>")]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const ALL: Self = Self(0b111_1111);

    /// Build from the stored bitmask. Returns `None` for an empty or
    /// out-of-range mask.
    pub fn from_bits(bits: u8) -> Option<Self> {
        (bits != 0 && bits <= Self::ALL.0).then_some(Self(bits))
    }

    /// Build from day numbers (0 = Monday). Duplicates are ignored.
    pub fn from_days<I>(days: I) -> Result<Self, ScheduleError>
    where
        I: IntoIterator<Item = i64>,
    {
        let mut bits = 0u8;
        for day in days {
            if !(0..=6).contains(&day) {
                return Err(ScheduleError::Weekday(day));
            }
            bits |= 1 << day;
        }
        Self::from_bits(bits).ok_or(ScheduleError::NoWeekdays)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.number_days_from_monday()) != 0
    }

    pub fn days(self) -> Vec<u8> {
        (0..7).filter(|d| self.0 & (1 << d) != 0).collect()
    }
}

impl Default for WeekdaySet {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Debug for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.days()).finish()
    }
}

impl TryFrom<Vec<i64>> for WeekdaySet {
    type Error = ScheduleError;

    fn try_from(days: Vec<i64>) -> Result<Self, Self::Error> {
        Self::from_days(days)
    }
}

impl From<WeekdaySet> for Vec<u8> {
    fn from(set: WeekdaySet) -> Self {
        set.days()
    }
}

// ---------------------------------------------------------------------------
// Schedule entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Storage id; `None` until the entry is first saved.
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(with = "hms")]
    pub start: Time,
    pub duration_sec: i64,
    #[serde(default)]
    pub weekdays: WeekdaySet,
}

impl ScheduleEntry {
    pub fn new(start: Time, duration_sec: i64, weekdays: WeekdaySet) -> Result<Self, ScheduleError> {
        let entry = Self {
            id: None,
            start,
            duration_sec,
            weekdays,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// Entry that applies every day of the week.
    pub fn daily(start: Time, duration_sec: i64) -> Result<Self, ScheduleError> {
        Self::new(start, duration_sec, WeekdaySet::ALL)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if !(1..SECONDS_PER_DAY).contains(&self.duration_sec) {
            return Err(ScheduleError::Duration(self.duration_sec));
        }
        Ok(())
    }

    pub fn applies_on(&self, day: Weekday) -> bool {
        self.weekdays.contains(day)
    }

    /// Seconds elapsed since this entry's start, wrapped into one day.
    pub fn elapsed(&self, now: Time) -> i64 {
        seconds_since(self.start, now)
    }

    /// `start < now < start + duration`. Both boundaries are excluded.
    pub fn is_inside(&self, now: Time) -> bool {
        let elapsed = self.elapsed(now);
        elapsed > 0 && elapsed < self.duration_sec
    }

    /// `now` has reached the close boundary `start + duration`.
    pub fn has_ended(&self, now: Time) -> bool {
        self.elapsed(now) >= self.duration_sec
    }
}

impl fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} for {}s on {:?}",
            format_time(self.start),
            self.duration_sec,
            self.weekdays
        )
    }
}

// ---------------------------------------------------------------------------
// Time-of-day helpers
// ---------------------------------------------------------------------------

pub(crate) fn seconds_of_day(t: Time) -> i64 {
    let (h, m, s) = t.as_hms();
    i64::from(h) * 3600 + i64::from(m) * 60 + i64::from(s)
}

/// Seconds from `reference` forward to `now`, modulo one day.
pub(crate) fn seconds_since(reference: Time, now: Time) -> i64 {
    (seconds_of_day(now) - seconds_of_day(reference)).rem_euclid(SECONDS_PER_DAY)
}

/// Parse `HH:MM:SS`.
pub fn parse_time(s: &str) -> Result<Time, ScheduleError> {
    Time::parse(s.trim(), format_description!("[hour]:[minute]:[second]"))
        .map_err(|_| ScheduleError::StartTime(s.to_string()))
}

/// Format as `HH:MM:SS`.
pub fn format_time(t: Time) -> String {
    let (h, m, s) = t.as_hms();
    format!("{h:02}:{m:02}:{s:02}")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::time;

    fn entry(start: Time, duration_sec: i64) -> ScheduleEntry {
        ScheduleEntry::daily(start, duration_sec).unwrap()
    }

    // -- WeekdaySet -------------------------------------------------------

    #[test]
    fn weekday_set_contains_monday_as_zero() {
        let set = WeekdaySet::from_days([0, 2]).unwrap();
        assert!(set.contains(Weekday::Monday));
        assert!(!set.contains(Weekday::Tuesday));
        assert!(set.contains(Weekday::Wednesday));
        assert!(!set.contains(Weekday::Sunday));
    }

    #[test]
    fn weekday_set_rejects_out_of_range_day() {
        assert_eq!(WeekdaySet::from_days([7]), Err(ScheduleError::Weekday(7)));
        assert_eq!(WeekdaySet::from_days([-1]), Err(ScheduleError::Weekday(-1)));
    }

    #[test]
    fn weekday_set_rejects_empty() {
        assert_eq!(
            WeekdaySet::from_days(Vec::<i64>::new()),
            Err(ScheduleError::NoWeekdays)
        );
        assert!(WeekdaySet::from_bits(0).is_none());
        assert!(WeekdaySet::from_bits(128).is_none());
    }

    #[test]
    fn weekday_set_days_lists_in_order() {
        let set = WeekdaySet::from_days([6, 1, 1, 3]).unwrap();
        assert_eq!(set.days(), vec![1, 3, 6]);
        assert_eq!(WeekdaySet::ALL.days(), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn weekday_set_serde_uses_day_numbers() {
        let set = WeekdaySet::from_days([0, 4]).unwrap();
        assert_eq!(serde_json::to_string(&set).unwrap(), "[0,4]");
        let back: WeekdaySet = serde_json::from_str("[4,0]").unwrap();
        assert_eq!(back, set);
        assert!(serde_json::from_str::<WeekdaySet>("[]").is_err());
        assert!(serde_json::from_str::<WeekdaySet>("[9]").is_err());
    }

    // -- ScheduleEntry validation ------------------------------------------

    #[test]
    fn entry_rejects_non_positive_duration() {
        assert_eq!(
            ScheduleEntry::daily(time!(10:00:00), 0),
            Err(ScheduleError::Duration(0))
        );
        assert_eq!(
            ScheduleEntry::daily(time!(10:00:00), -5),
            Err(ScheduleError::Duration(-5))
        );
    }

    #[test]
    fn entry_rejects_full_day_duration() {
        assert!(ScheduleEntry::daily(time!(10:00:00), SECONDS_PER_DAY).is_err());
        assert!(ScheduleEntry::daily(time!(10:00:00), SECONDS_PER_DAY - 1).is_ok());
    }

    #[test]
    fn new_entry_has_no_id() {
        assert_eq!(entry(time!(10:00:00), 60).id, None);
    }

    // -- Window boundaries -------------------------------------------------

    #[test]
    fn window_excludes_start_instant() {
        assert!(!entry(time!(10:20:00), 120).is_inside(time!(10:20:00)));
    }

    #[test]
    fn window_excludes_end_instant() {
        let e = entry(time!(10:20:00), 120);
        assert!(!e.is_inside(time!(10:22:00)));
        assert!(e.has_ended(time!(10:22:00)));
    }

    #[test]
    fn window_includes_interior() {
        let e = entry(time!(10:20:00), 120);
        assert!(e.is_inside(time!(10:20:01)));
        assert!(e.is_inside(time!(10:21:59)));
        assert!(!e.has_ended(time!(10:21:59)));
    }

    #[test]
    fn window_before_start_is_outside() {
        let e = entry(time!(10:20:00), 120);
        assert!(!e.is_inside(time!(10:19:00)));
        // Before start counts as "ended" for an episode that never began.
        assert!(e.has_ended(time!(10:19:00)));
    }

    #[test]
    fn window_straddling_midnight() {
        let e = entry(time!(23:59:00), 120);
        assert!(e.is_inside(time!(23:59:30)));
        assert!(e.is_inside(time!(00:00:30)));
        assert!(!e.is_inside(time!(00:01:00)));
        assert!(e.has_ended(time!(00:01:01)));
    }

    #[test]
    fn subsecond_precision_is_ignored() {
        let e = entry(time!(10:20:00), 120);
        assert!(!e.is_inside(time!(10:20:00.900)));
    }

    // -- Helpers -------------------------------------------------------------

    #[test]
    fn seconds_since_wraps_over_midnight() {
        assert_eq!(seconds_since(time!(23:59:50), time!(00:00:30)), 40);
        assert_eq!(seconds_since(time!(10:00:00), time!(10:02:01)), 121);
    }

    #[test]
    fn parse_and_format_time() {
        let t = parse_time("05:02:30").unwrap();
        assert_eq!(t, time!(05:02:30));
        assert_eq!(format_time(t), "05:02:30");
        assert!(matches!(parse_time("5pm"), Err(ScheduleError::StartTime(_))));
        assert!(parse_time("25:00:00").is_err());
    }

    #[test]
    fn entry_json_shape() {
        let e = ScheduleEntry::new(time!(10:20:00), 120, WeekdaySet::from_days([1, 2]).unwrap())
            .unwrap();
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["start"], "10:20:00");
        assert_eq!(json["duration_sec"], 120);
        assert_eq!(json["weekdays"], serde_json::json!([1, 2]));
        assert!(json["id"].is_null());
    }

    #[test]
    fn entry_json_defaults_to_every_day() {
        let e: ScheduleEntry =
            serde_json::from_str(r#"{"start":"06:00:00","duration_sec":60}"#).unwrap();
        assert_eq!(e.weekdays, WeekdaySet::ALL);
        assert_eq!(e.id, None);
    }
}
