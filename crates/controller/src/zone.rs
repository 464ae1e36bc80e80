//! Zone state machine: schedule-driven opens and closes, manual overrides,
//! and the emergency cutoff.
//!
//! ## States
//!
//! ```text
//!            [inside first matching window]        [window over]
//!  Closed ─────────────────────────────▶ OpenBySchedule ─────────▶ Closed
//!    │  ▲                                      │
//!    │  └──────── override_open(false) ────────┤
//!    │           or emergency timeout          │
//!    └── override_open(true) ──▶ OpenByOverride ┘
//!
//!  any ── override_close() ──▶ ClosedByOverride   (sticky, blocks every open)
//! ```
//!
//! A zone never touches hardware or storage itself. Every operation returns
//! an optional [`Transition`] and the executor turns it into a valve call
//! and a log event while still holding the zone lock.

use std::fmt;

use serde::Serialize;
use time::{PrimitiveDateTime, Time, Weekday};
use tracing::{debug, info, warn};

use crate::db::EventKind;
use crate::schedule::{seconds_since, ScheduleEntry};

/// Safety ceiling applied when nothing else is configured.
pub const DEFAULT_MAX_OPEN_SECONDS: i64 = 120;

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneState {
    Closed,
    OpenBySchedule,
    OpenByOverride,
    ClosedByOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenReason {
    Schedule,
    Override,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The active entry's window is over.
    Schedule,
    /// `override_open(false)`.
    Stop,
    /// `override_close()`.
    Hold,
    /// Open longer than the safety ceiling.
    Emergency,
    /// Open with no reference time to measure against.
    Anomaly,
    /// Executor fail-safe on exit.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened(OpenReason),
    Closed(CloseReason),
}

impl Transition {
    pub fn event_kind(self) -> EventKind {
        match self {
            Self::Opened(_) => EventKind::IrrigationStart,
            Self::Closed(_) => EventKind::IrrigationStop,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::Opened(_))
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Opened(OpenReason::Schedule) => "opened by schedule",
            Self::Opened(OpenReason::Override) => "opened by override",
            Self::Closed(CloseReason::Schedule) => "closed by schedule",
            Self::Closed(CloseReason::Stop) => "closed by override",
            Self::Closed(CloseReason::Hold) => "closed and held by override",
            Self::Closed(CloseReason::Emergency) => "closed by emergency timeout",
            Self::Closed(CloseReason::Anomaly) => "closed: open with no reference time",
            Self::Closed(CloseReason::Shutdown) => "closed by executor shutdown",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Zone {
    /// Storage id; `None` until the zone is first saved.
    pub id: Option<i64>,
    pub name: String,
    pub gpio_pin: u8,
    /// Scan order = attachment order.
    pub schedule: Vec<ScheduleEntry>,
    pub last_irrigation: Option<PrimitiveDateTime>,

    open: bool,
    override_open: bool,
    override_close: bool,
    active: Option<ScheduleEntry>,
    override_started: Option<Time>,
    /// Schedule entry whose episode the emergency cutoff ended. It may not
    /// reopen the zone until its window is over.
    cut_off: Option<ScheduleEntry>,
    max_open_seconds: i64,
}

impl Zone {
    pub fn new(name: impl Into<String>, gpio_pin: u8) -> Self {
        Self {
            id: None,
            name: name.into(),
            gpio_pin,
            schedule: Vec::new(),
            last_irrigation: None,
            open: false,
            override_open: false,
            override_close: false,
            active: None,
            override_started: None,
            cut_off: None,
            max_open_seconds: DEFAULT_MAX_OPEN_SECONDS,
        }
    }

    pub fn with_schedule(mut self, schedule: Vec<ScheduleEntry>) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_max_open_seconds(mut self, seconds: i64) -> Self {
        self.max_open_seconds = seconds;
        self
    }

    // -- Accessors --------------------------------------------------------

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_override(&self) -> bool {
        self.override_open
    }

    pub fn is_override_closed(&self) -> bool {
        self.override_close
    }

    pub fn active_entry(&self) -> Option<&ScheduleEntry> {
        self.active.as_ref()
    }

    pub fn max_open_seconds(&self) -> i64 {
        self.max_open_seconds
    }

    pub fn state(&self) -> ZoneState {
        match (self.open, self.override_open, self.override_close) {
            (true, true, _) => ZoneState::OpenByOverride,
            (true, false, _) => ZoneState::OpenBySchedule,
            (false, _, true) => ZoneState::ClosedByOverride,
            (false, _, false) => ZoneState::Closed,
        }
    }

    pub fn summary(&self) -> ZoneSummary {
        ZoneSummary {
            id: self.id,
            name: self.name.clone(),
            gpio_pin: self.gpio_pin,
            state: self.state(),
            is_open: self.is_open(),
            is_override: self.is_override(),
            is_held: self.is_override_closed(),
            active_entry: self.active_entry().and_then(|e| e.id),
            max_open_seconds: self.max_open_seconds(),
            last_irrigation: self.last_irrigation,
            schedule: self.schedule.clone(),
        }
    }

    // -- Schedule editing -------------------------------------------------

    pub fn add_entry(&mut self, entry: ScheduleEntry) {
        self.schedule.push(entry);
    }

    /// Detach an entry by id. An episode it is currently driving keeps
    /// running against its own copy until the window closes.
    pub fn remove_entry(&mut self, entry_id: i64) -> Option<ScheduleEntry> {
        let pos = self.schedule.iter().position(|e| e.id == Some(entry_id))?;
        Some(self.schedule.remove(pos))
    }

    // -- Tick checks ------------------------------------------------------

    /// Open if `now` is strictly inside the first entry that applies today.
    ///
    /// Only the first day-matching entry is considered: when it does not
    /// contain `now`, later entries are not looked at in this call.
    pub fn check_if_need_to_open(&mut self, now: Time, weekday: Weekday) -> Option<Transition> {
        if self.cut_off.as_ref().is_some_and(|e| !e.is_inside(now)) {
            self.cut_off = None;
        }
        if self.open {
            debug!(zone = %self.name, "open check: already open");
            return None;
        }
        if self.override_close {
            debug!(zone = %self.name, "open check: held closed by override");
            return None;
        }

        let entry = self.schedule.iter().find(|e| e.applies_on(weekday))?;
        if !entry.is_inside(now) {
            debug!(zone = %self.name, entry = %entry, "open check: outside window");
            return None;
        }
        if self.cut_off.as_ref() == Some(entry) {
            debug!(zone = %self.name, entry = %entry, "open check: window was cut off by the ceiling");
            return None;
        }

        let entry = entry.clone();
        info!(zone = %self.name, entry = %entry, "open check: inside window");
        self.open = true;
        self.active = Some(entry);
        Some(Transition::Opened(OpenReason::Schedule))
    }

    /// Close a schedule-driven episode once its window is over. Override
    /// episodes are left alone.
    pub fn check_if_need_to_close(&mut self, now: Time) -> Option<Transition> {
        if !self.open || self.override_open {
            return None;
        }
        let Some(entry) = &self.active else {
            // Caught by the emergency pass in the same tick.
            return None;
        };
        if !entry.has_ended(now) {
            return None;
        }
        Some(self.close(CloseReason::Schedule))
    }

    /// Force-close a zone that has been open longer than its ceiling.
    pub fn check_emergency_closing(&mut self, now: Time) -> Option<Transition> {
        if !self.open {
            return None;
        }

        let reference = if self.override_open {
            self.override_started
        } else {
            self.active.as_ref().map(|e| e.start)
        };

        let Some(reference) = reference else {
            warn!(zone = %self.name, "open with no reference time, closing");
            return Some(self.close(CloseReason::Anomaly));
        };

        let open_for = seconds_since(reference, now);
        if open_for > self.max_open_seconds {
            warn!(
                zone = %self.name,
                open_for,
                ceiling = self.max_open_seconds,
                "emergency closing"
            );
            if !self.override_open {
                self.cut_off = self.active.clone();
            }
            return Some(self.close(CloseReason::Emergency));
        }
        None
    }

    // -- Overrides --------------------------------------------------------

    /// Manual open (`enable = true`) or manual stop (`enable = false`).
    ///
    /// Refused while the zone is held closed. A stop closes the zone no
    /// matter how it was opened.
    pub fn override_open(&mut self, enable: bool, now: Time) -> Option<Transition> {
        if self.override_close {
            warn!(zone = %self.name, enable, "override open refused: zone is held closed");
            return None;
        }
        if !enable {
            return Some(self.close(CloseReason::Stop));
        }
        if self.override_open {
            return None;
        }

        self.override_open = true;
        if let Some(entry) = self.active.take() {
            // Take over a running schedule episode without restarting it:
            // the cutoff keeps measuring from the entry's start.
            info!(zone = %self.name, entry = %entry, "override takes over schedule episode");
            self.override_started = Some(entry.start);
            return None;
        }

        self.open = true;
        self.override_started = Some(now);
        Some(Transition::Opened(OpenReason::Override))
    }

    /// Close and hold closed. Sticky: no open of any kind succeeds afterwards.
    pub fn override_close(&mut self) -> Option<Transition> {
        let transition = self.close(CloseReason::Hold);
        self.override_close = true;
        Some(transition)
    }

    /// Fail-safe close used when the executor exits. Only zones that are
    /// actually open produce a transition.
    pub fn force_close(&mut self) -> Option<Transition> {
        if !self.open {
            return None;
        }
        Some(self.close(CloseReason::Shutdown))
    }

    fn close(&mut self, reason: CloseReason) -> Transition {
        self.open = false;
        self.override_open = false;
        self.active = None;
        self.override_started = None;
        Transition::Closed(reason)
    }
}

// ---------------------------------------------------------------------------
// JSON view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ZoneSummary {
    pub id: Option<i64>,
    pub name: String,
    pub gpio_pin: u8,
    pub state: ZoneState,
    pub is_open: bool,
    pub is_override: bool,
    pub is_held: bool,
    pub active_entry: Option<i64>,
    pub max_open_seconds: i64,
    #[serde(with = "crate::db::log_timestamp::option")]
    pub last_irrigation: Option<PrimitiveDateTime>,
    pub schedule: Vec<ScheduleEntry>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::WeekdaySet;
    use time::macros::time;

    const THURSDAY: Weekday = Weekday::Thursday;

    fn entry(start: Time, duration_sec: i64) -> ScheduleEntry {
        ScheduleEntry::daily(start, duration_sec).unwrap()
    }

    fn weekday_entry(start: Time, duration_sec: i64, days: &[i64]) -> ScheduleEntry {
        ScheduleEntry::new(
            start,
            duration_sec,
            WeekdaySet::from_days(days.iter().copied()).unwrap(),
        )
        .unwrap()
    }

    /// Two daily windows: 10:20:00 and 22:20:00, 120s each.
    fn test_zone() -> Zone {
        Zone::new("test", 17).with_schedule(vec![
            entry(time!(10:20:00), 120),
            entry(time!(22:20:00), 120),
        ])
    }

    /// `open` ⇔ exactly one of {active entry, override-open}.
    fn assert_invariant(zone: &Zone) {
        assert_eq!(
            zone.is_open(),
            zone.active_entry().is_some() ^ zone.is_override(),
            "invariant broken: {zone:?}"
        );
    }

    // -- Schedule opens ----------------------------------------------------

    #[test]
    fn new_zone_is_closed() {
        let zone = test_zone();
        assert!(!zone.is_open());
        assert_eq!(zone.state(), ZoneState::Closed);
        assert_eq!(zone.max_open_seconds(), DEFAULT_MAX_OPEN_SECONDS);
        assert_invariant(&zone);
    }

    #[test]
    fn closed_before_window() {
        let mut zone = test_zone();
        assert_eq!(zone.check_if_need_to_open(time!(10:19:00), THURSDAY), None);
        assert!(!zone.is_open());
    }

    #[test]
    fn opens_inside_window() {
        let mut zone = test_zone();
        let t = zone.check_if_need_to_open(time!(10:20:01), THURSDAY);
        assert_eq!(t, Some(Transition::Opened(OpenReason::Schedule)));
        assert!(zone.is_open());
        assert_eq!(zone.state(), ZoneState::OpenBySchedule);
        assert_eq!(zone.active_entry().unwrap().start, time!(10:20:00));
        assert_invariant(&zone);
    }

    #[test]
    fn does_not_open_at_window_start() {
        let mut zone = test_zone();
        assert_eq!(zone.check_if_need_to_open(time!(10:20:00), THURSDAY), None);
        assert!(!zone.is_open());
    }

    #[test]
    fn does_not_open_at_window_end() {
        let mut zone = test_zone();
        assert_eq!(zone.check_if_need_to_open(time!(10:22:00), THURSDAY), None);
        assert!(!zone.is_open());
    }

    #[test]
    fn repeated_open_check_is_idempotent() {
        let mut zone = test_zone();
        assert!(zone.check_if_need_to_open(time!(10:20:01), THURSDAY).is_some());
        assert_eq!(zone.check_if_need_to_open(time!(10:20:30), THURSDAY), None);
        assert_eq!(zone.check_if_need_to_open(time!(10:21:00), THURSDAY), None);
        assert!(zone.is_open());
        assert_invariant(&zone);
    }

    #[test]
    fn wrong_weekday_stays_closed() {
        let mut zone = Zone::new("test", 17).with_schedule(vec![
            weekday_entry(time!(10:20:00), 120, &[2, 3, 4, 5, 6]),
            weekday_entry(time!(22:20:00), 120, &[2, 3, 4, 5, 6]),
        ]);
        assert_eq!(zone.check_if_need_to_open(time!(10:20:30), Weekday::Tuesday), None);
        assert!(!zone.is_open());
    }

    #[test]
    fn only_first_day_matching_entry_is_evaluated() {
        // The second entry covers 10:30 but the first matching one decides.
        let mut zone = Zone::new("test", 17).with_schedule(vec![
            entry(time!(06:00:00), 60),
            entry(time!(10:29:00), 120),
        ]);
        assert_eq!(zone.check_if_need_to_open(time!(10:30:00), THURSDAY), None);
        assert!(!zone.is_open());
    }

    #[test]
    fn entries_for_other_days_are_skipped() {
        let mut zone = Zone::new("test", 17).with_schedule(vec![
            weekday_entry(time!(10:29:00), 120, &[0]),
            weekday_entry(time!(10:29:00), 120, &[3]),
        ]);
        let t = zone.check_if_need_to_open(time!(10:30:00), THURSDAY);
        assert_eq!(t, Some(Transition::Opened(OpenReason::Schedule)));
        assert_eq!(zone.active_entry().unwrap().weekdays.days(), vec![3]);
    }

    #[test]
    fn empty_schedule_never_opens() {
        let mut zone = Zone::new("bare", 17);
        assert_eq!(zone.check_if_need_to_open(time!(10:30:00), THURSDAY), None);
    }

    // -- Schedule closes ---------------------------------------------------

    #[test]
    fn closes_after_window() {
        let mut zone = test_zone();
        zone.check_if_need_to_open(time!(10:19:00), THURSDAY);
        zone.check_if_need_to_open(time!(10:20:01), THURSDAY);
        let t = zone.check_if_need_to_close(time!(10:22:01));
        assert_eq!(t, Some(Transition::Closed(CloseReason::Schedule)));
        assert!(!zone.is_open());
        assert!(zone.active_entry().is_none());
        assert_invariant(&zone);
    }

    #[test]
    fn closes_at_window_end() {
        let mut zone = test_zone();
        zone.check_if_need_to_open(time!(10:20:01), THURSDAY);
        assert!(zone.check_if_need_to_close(time!(10:22:00)).is_some());
        assert!(!zone.is_open());
    }

    #[test]
    fn stays_open_inside_window() {
        let mut zone = test_zone();
        zone.check_if_need_to_open(time!(10:20:01), THURSDAY);
        assert_eq!(zone.check_if_need_to_close(time!(10:21:59)), None);
        assert!(zone.is_open());
    }

    #[test]
    fn close_check_on_closed_zone_is_noop() {
        let mut zone = test_zone();
        assert_eq!(zone.check_if_need_to_close(time!(10:22:01)), None);
    }

    #[test]
    fn close_check_ignores_override_episode() {
        let mut zone = test_zone();
        zone.override_open(true, time!(10:00:00));
        assert_eq!(zone.check_if_need_to_close(time!(23:00:00)), None);
        assert!(zone.is_open());
    }

    #[test]
    fn window_over_midnight_closes_next_day() {
        let mut zone = Zone::new("late", 17).with_schedule(vec![entry(time!(23:59:00), 120)]);
        assert!(zone.check_if_need_to_open(time!(23:59:30), THURSDAY).is_some());
        assert_eq!(zone.check_if_need_to_close(time!(00:00:30)), None);
        assert!(zone.check_if_need_to_close(time!(00:01:00)).is_some());
    }

    // -- Emergency ---------------------------------------------------------

    #[test]
    fn emergency_closes_override_after_ceiling() {
        let mut zone = test_zone();
        zone.override_open(true, time!(08:00:00));

        // Schedule checks leave an override episode alone.
        zone.check_if_need_to_open(time!(08:01:00), THURSDAY);
        zone.check_if_need_to_close(time!(08:01:00));
        assert!(zone.is_open());

        assert_eq!(zone.check_emergency_closing(time!(08:01:00)), None);
        assert_eq!(zone.check_emergency_closing(time!(08:02:00)), None);
        let t = zone.check_emergency_closing(time!(08:02:01));
        assert_eq!(t, Some(Transition::Closed(CloseReason::Emergency)));
        assert!(!zone.is_open());
        assert!(!zone.is_override());
        assert_invariant(&zone);
    }

    #[test]
    fn emergency_measures_schedule_episode_from_entry_start() {
        let mut zone = Zone::new("long", 17).with_schedule(vec![entry(time!(06:00:00), 600)]);
        zone.check_if_need_to_open(time!(06:00:30), THURSDAY);
        assert_eq!(zone.check_emergency_closing(time!(06:02:00)), None);
        assert!(zone.check_emergency_closing(time!(06:02:01)).is_some());
        assert!(!zone.is_open());
    }

    #[test]
    fn cut_off_window_does_not_reopen_until_it_ends() {
        let mut zone = Zone::new("long", 17).with_schedule(vec![entry(time!(06:00:00), 600)]);
        assert!(zone.check_if_need_to_open(time!(06:00:01), THURSDAY).is_some());
        assert_eq!(
            zone.check_emergency_closing(time!(06:02:01)),
            Some(Transition::Closed(CloseReason::Emergency))
        );

        assert_eq!(zone.check_if_need_to_open(time!(06:02:02), THURSDAY), None);
        assert_eq!(zone.check_if_need_to_open(time!(06:09:59), THURSDAY), None);
        assert!(!zone.is_open());

        // Window over: the next day's window opens normally.
        assert_eq!(zone.check_if_need_to_open(time!(06:10:00), THURSDAY), None);
        assert!(zone.check_if_need_to_open(time!(06:00:01), Weekday::Friday).is_some());
    }

    #[test]
    fn cut_off_does_not_block_manual_open() {
        let mut zone = Zone::new("long", 17).with_schedule(vec![entry(time!(06:00:00), 600)]);
        zone.check_if_need_to_open(time!(06:00:01), THURSDAY);
        zone.check_emergency_closing(time!(06:02:01));

        let t = zone.override_open(true, time!(06:03:00));
        assert_eq!(t, Some(Transition::Opened(OpenReason::Override)));
        assert!(zone.is_override());
    }

    #[test]
    fn emergency_respects_configured_ceiling() {
        let mut zone = test_zone().with_max_open_seconds(30);
        zone.override_open(true, time!(08:00:00));
        assert_eq!(zone.check_emergency_closing(time!(08:00:30)), None);
        assert!(zone.check_emergency_closing(time!(08:00:31)).is_some());
    }

    #[test]
    fn emergency_on_closed_zone_is_noop() {
        let mut zone = test_zone();
        assert_eq!(zone.check_emergency_closing(time!(12:00:00)), None);
    }

    // -- Overrides ---------------------------------------------------------

    #[test]
    fn override_open_then_stop_closes() {
        let mut zone = test_zone();
        let t = zone.override_open(true, time!(12:00:00));
        assert_eq!(t, Some(Transition::Opened(OpenReason::Override)));
        assert!(zone.is_open());
        assert!(zone.is_override());
        assert_eq!(zone.state(), ZoneState::OpenByOverride);
        assert_invariant(&zone);

        let t = zone.override_open(false, time!(12:00:10));
        assert_eq!(t, Some(Transition::Closed(CloseReason::Stop)));
        assert!(!zone.is_open());
        assert!(!zone.is_override());
        assert_invariant(&zone);
    }

    #[test]
    fn override_stop_closes_schedule_episode() {
        let mut zone = test_zone();
        zone.check_if_need_to_open(time!(10:20:01), THURSDAY);
        assert!(zone.override_open(false, time!(10:20:30)).is_some());
        assert!(!zone.is_open());
        assert!(zone.active_entry().is_none());
        assert_invariant(&zone);
    }

    #[test]
    fn override_open_twice_does_not_reopen() {
        let mut zone = test_zone();
        zone.override_open(true, time!(12:00:00));
        assert_eq!(zone.override_open(true, time!(12:00:30)), None);
        // Still measured from the first open.
        assert!(zone.check_emergency_closing(time!(12:02:01)).is_some());
    }

    #[test]
    fn override_takes_over_schedule_episode() {
        let mut zone = test_zone();
        zone.check_if_need_to_open(time!(10:20:01), THURSDAY);
        assert_eq!(zone.override_open(true, time!(10:21:00)), None);
        assert!(zone.is_open());
        assert!(zone.is_override());
        assert!(zone.active_entry().is_none());
        assert_invariant(&zone);

        // No schedule close any more, but the cutoff still counts from 10:20:00.
        assert_eq!(zone.check_if_need_to_close(time!(10:22:01)), None);
        assert!(zone.check_emergency_closing(time!(10:22:01)).is_some());
    }

    #[test]
    fn override_close_blocks_schedule_open() {
        let mut zone = test_zone();
        zone.override_close();
        assert_eq!(zone.check_if_need_to_open(time!(10:20:01), THURSDAY), None);
        assert!(!zone.is_open());
        assert_eq!(zone.state(), ZoneState::ClosedByOverride);
    }

    #[test]
    fn override_close_blocks_override_open() {
        let mut zone = test_zone();
        zone.override_close();
        assert_eq!(zone.override_open(true, time!(12:00:00)), None);
        assert!(!zone.is_open());
        assert!(zone.is_override_closed());
        assert_invariant(&zone);
    }

    #[test]
    fn override_close_closes_open_zone() {
        let mut zone = test_zone();
        zone.override_open(true, time!(12:00:00));
        let t = zone.override_close();
        assert_eq!(t, Some(Transition::Closed(CloseReason::Hold)));
        assert!(!zone.is_open());
        assert!(!zone.is_override());
        assert!(zone.is_override_closed());
        assert_invariant(&zone);
    }

    // -- Fail-safe ---------------------------------------------------------

    #[test]
    fn force_close_only_reports_open_zones() {
        let mut zone = test_zone();
        assert_eq!(zone.force_close(), None);
        zone.override_open(true, time!(12:00:00));
        assert_eq!(
            zone.force_close(),
            Some(Transition::Closed(CloseReason::Shutdown))
        );
        assert!(!zone.is_open());
        assert_invariant(&zone);
    }

    // -- Schedule editing ----------------------------------------------------

    #[test]
    fn removing_active_entry_keeps_episode_closable() {
        let mut zone = Zone::new("edit", 17);
        let mut e = entry(time!(10:20:00), 120);
        e.id = Some(7);
        zone.add_entry(e);
        zone.check_if_need_to_open(time!(10:20:01), THURSDAY);

        assert!(zone.remove_entry(7).is_some());
        assert!(zone.schedule.is_empty());
        assert!(zone.check_if_need_to_close(time!(10:22:01)).is_some());
        assert!(zone.remove_entry(7).is_none());
    }

    #[test]
    fn summary_reflects_state() {
        let mut zone = test_zone();
        zone.id = Some(3);
        zone.override_open(true, time!(12:00:00));
        let s = zone.summary();
        assert_eq!(s.id, Some(3));
        assert!(s.is_open);
        assert!(s.is_override);
        assert!(!s.is_held);
        assert_eq!(s.state, ZoneState::OpenByOverride);
        assert_eq!(s.schedule.len(), 2);
        assert_eq!(s.active_entry, None);
        assert_eq!(s.max_open_seconds, DEFAULT_MAX_OPEN_SECONDS);
    }

    #[test]
    fn summary_json_timestamps_use_log_format() {
        let mut zone = test_zone();
        let json = serde_json::to_value(zone.summary()).unwrap();
        assert!(json["last_irrigation"].is_null());

        zone.last_irrigation = Some(time::macros::datetime!(2024-05-02 10:20:01));
        let json = serde_json::to_value(zone.summary()).unwrap();
        assert_eq!(json["last_irrigation"], "2024-05-02 10:20:01.000000");
    }

    #[test]
    fn transitions_map_to_log_events() {
        assert_eq!(
            Transition::Opened(OpenReason::Schedule).event_kind(),
            EventKind::IrrigationStart
        );
        assert_eq!(
            Transition::Closed(CloseReason::Emergency).event_kind(),
            EventKind::IrrigationStop
        );
    }
}
