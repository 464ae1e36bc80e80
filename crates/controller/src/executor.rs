//! Executor: owns the zone table and drives every zone once per poll tick.
//!
//! Each tick takes the table's write lock, reads the clock once, and runs
//! three passes over all zones in a fixed order: open-check, close-check,
//! emergency-check. Every pass sees the same frozen "now". A closed zone
//! whose pin still reads energized is switched off again at the end of
//! every tick. Remote commands take the same lock, so a zone is never
//! mutated by the loop and a remote caller at the same time.
//!
//! Any error inside a tick ends the loop. The loop always closes every zone
//! on its way out, and a failed loop takes the whole process down after that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use time::PrimitiveDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::db::{log_timestamp, Db, EventKind, LogEntry, LogFilter};
use crate::error::ControlError;
use crate::schedule::ScheduleEntry;
use crate::valve::Valves;
use crate::zone::{Transition, Zone, ZoneSummary};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(800);

/// How long `stop` waits for the loop to finish its fail-safe close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Shared zone table
// ---------------------------------------------------------------------------

/// Zones plus the valve board that drives them. Always accessed through
/// [`SharedZones`].
pub struct ZoneTable {
    zones: Vec<Zone>,
    valves: Box<dyn Valves>,
    last_tick: Option<PrimitiveDateTime>,
    running: bool,
}

pub type SharedZones = Arc<RwLock<ZoneTable>>;

impl ZoneTable {
    /// Claims every zone's pin on the board, all OFF.
    pub fn new(zones: Vec<Zone>, mut valves: Box<dyn Valves>) -> Result<Self> {
        let pins: Vec<u8> = zones.iter().map(|z| z.gpio_pin).collect();
        valves.setup(&pins).context("valve setup failed")?;
        Ok(Self {
            zones,
            valves,
            last_tick: None,
            running: false,
        })
    }

    fn pins(&self) -> Vec<u8> {
        self.zones.iter().map(|z| z.gpio_pin).collect()
    }

    fn zone(&self, zone_id: i64) -> Result<&Zone, ControlError> {
        self.zones
            .iter()
            .find(|z| z.id == Some(zone_id))
            .ok_or(ControlError::ZoneNotFound(zone_id))
    }

    fn zone_and_valves(&mut self, zone_id: i64) -> Result<(&mut Zone, &mut dyn Valves), ControlError> {
        let zone = self
            .zones
            .iter_mut()
            .find(|z| z.id == Some(zone_id))
            .ok_or(ControlError::ZoneNotFound(zone_id))?;
        Ok((zone, self.valves.as_mut()))
    }
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Pass {
    Open,
    Close,
    Emergency,
}

const PASSES: [Pass; 3] = [Pass::Open, Pass::Close, Pass::Emergency];

/// One tick: all three passes over every zone against the same `now`.
async fn tick(table: &mut ZoneTable, db: &Db, now: PrimitiveDateTime) -> Result<()> {
    let (time, weekday) = (now.time(), now.weekday());
    table.last_tick = Some(now);

    let ZoneTable { zones, valves, .. } = table;
    for pass in PASSES {
        for zone in zones.iter_mut() {
            let transition = match pass {
                Pass::Open => zone.check_if_need_to_open(time, weekday),
                Pass::Close => zone.check_if_need_to_close(time),
                Pass::Emergency => zone.check_emergency_closing(time),
            };
            if let Some(t) = transition {
                apply(zone, valves.as_mut(), db, t, now).await?;
            }
        }
    }

    for zone in zones.iter().filter(|z| !z.is_open()) {
        let pin = zone.gpio_pin;
        if valves.is_energized(pin) {
            warn!(zone = %zone.name, pin, "closed zone still energized, switching off");
            valves
                .de_energize(pin)
                .with_context(|| format!("zone '{}': cannot switch off gpio {pin}", zone.name))?;
        }
    }
    Ok(())
}

/// Lock the table, then read the clock once and tick against it.
async fn tick_once(zones: &SharedZones, db: &Db, clock: &dyn Clock) -> Result<()> {
    let mut table = zones.write().await;
    // Read under the lock so no override can start "after" this tick's now.
    let now = clock.now();
    tick(&mut table, db, now).await
}

/// Carry out a transition the zone has already made: drive the valve,
/// then append the log event.
async fn apply(
    zone: &mut Zone,
    valves: &mut dyn Valves,
    db: &Db,
    transition: Transition,
    now: PrimitiveDateTime,
) -> Result<()> {
    let pin = zone.gpio_pin;
    let driven = if transition.is_open() {
        valves.energize(pin)
    } else {
        valves.de_energize(pin)
    };
    driven.with_context(|| format!("zone '{}': driving gpio {pin} failed", zone.name))?;

    info!(zone = %zone.name, pin, %transition, "zone transition");

    let text = format!("Zone {} {transition}", zone.name);
    db.append_log(zone.id, transition.event_kind(), now, Some(&text))
        .await
        .with_context(|| format!("zone '{}': log append failed", zone.name))?;

    if transition.is_open() {
        zone.last_irrigation = Some(now);
        if let Some(id) = zone.id {
            db.touch_last_irrigation(id, now).await?;
        }
    }
    Ok(())
}

/// Fail-safe: close every open zone and switch every pin OFF. Best-effort,
/// failures are logged and the rest still runs. Returns false if a pin may
/// still be energized.
async fn close_all(table: &mut ZoneTable, db: &Db, now: PrimitiveDateTime) -> bool {
    table.running = false;

    let ZoneTable { zones, valves, .. } = table;
    for zone in zones.iter_mut() {
        let Some(t) = zone.force_close() else {
            continue;
        };
        warn!(zone = %zone.name, "fail-safe close");
        let text = format!("Zone {} {t}", zone.name);
        if let Err(e) = db.append_log(zone.id, t.event_kind(), now, Some(&text)).await {
            error!(zone = %zone.name, "fail-safe: log append failed: {e:#}");
        }
    }
    if let Err(e) = valves.de_energize_all() {
        error!("fail-safe: de-energize failed: {e:#}");
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Run until `stop` is set or a tick fails, then close everything.
async fn run_loop(
    zones: SharedZones,
    db: Db,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let result = drive(&zones, &db, clock.as_ref(), poll_interval, &stop).await;

    let mut table = zones.write().await;
    let now = clock.now();
    let all_off = close_all(&mut table, &db, now).await;
    if let Err(e) = db
        .append_log(None, EventKind::General, now, Some("executor stopped"))
        .await
    {
        error!("executor stop: log append failed: {e:#}");
    }
    result?;
    if !all_off {
        bail!("fail-safe close left a valve energized");
    }
    Ok(())
}

async fn drive(
    zones: &SharedZones,
    db: &Db,
    clock: &dyn Clock,
    poll_interval: Duration,
    stop: &AtomicBool,
) -> Result<()> {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        tick_once(zones, db, clock).await?;
    }
}

/// Body of the spawned task. A failed loop has already tried to close every
/// zone; release the database and end the process.
async fn supervise(
    zones: SharedZones,
    db: Db,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
) {
    if let Err(e) = run_loop(zones, db.clone(), clock, poll_interval, stop).await {
        error!("executor failed, all zones closed, terminating: {e:#}");
        db.close().await;
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub poll_interval: Duration,
    pub max_open_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct ExecutorStatus {
    pub running: bool,
    #[serde(with = "log_timestamp::option")]
    pub last_tick: Option<PrimitiveDateTime>,
    pub poll_interval_ms: u64,
    pub max_open_seconds: i64,
    pub zones: usize,
}

struct RunningLoop {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

pub struct Executor {
    zones: SharedZones,
    db: Db,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    task: Mutex<Option<RunningLoop>>,
}

pub type SharedExecutor = Arc<Executor>;

impl Executor {
    pub fn new(table: ZoneTable, db: Db, clock: Arc<dyn Clock>, config: ExecutorConfig) -> Self {
        Self {
            zones: Arc::new(RwLock::new(table)),
            db,
            clock,
            config,
            task: Mutex::new(None),
        }
    }

    /// Claim every zone pin (all OFF) and spawn the poll loop. Returns
    /// `Ok(false)` and does nothing if it is already running.
    pub async fn start(&self) -> Result<bool, ControlError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            warn!("executor already running");
            return Ok(false);
        }

        self.db
            .append_log(None, EventKind::General, self.clock.now(), Some("executor started"))
            .await?;
        {
            let mut table = self.zones.write().await;
            let pins = table.pins();
            table.valves.setup(&pins).context("valve setup failed")?;
            table.running = true;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(supervise(
            Arc::clone(&self.zones),
            self.db.clone(),
            Arc::clone(&self.clock),
            self.config.poll_interval,
            Arc::clone(&stop),
        ));
        *task = Some(RunningLoop { handle, stop });

        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            max_open_seconds = self.config.max_open_seconds,
            "executor started"
        );
        Ok(true)
    }

    /// Ask the loop to stop after its current tick and wait for the
    /// fail-safe close. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let mut task = self.task.lock().await;
        let Some(running) = task.take() else {
            return false;
        };

        running.stop.store(true, Ordering::SeqCst);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, running.handle).await {
            Ok(Ok(())) => info!("executor stopped"),
            Ok(Err(e)) => error!("executor task ended abnormally: {e}"),
            Err(_) => error!(timeout = ?SHUTDOWN_TIMEOUT, "executor did not stop in time"),
        }
        true
    }

    pub async fn is_running(&self) -> bool {
        self.zones.read().await.running
    }

    pub async fn status(&self) -> ExecutorStatus {
        let table = self.zones.read().await;
        ExecutorStatus {
            running: table.running,
            last_tick: table.last_tick,
            poll_interval_ms: self.config.poll_interval.as_millis() as u64,
            max_open_seconds: self.config.max_open_seconds,
            zones: table.zones.len(),
        }
    }

    pub async fn list_zones(&self) -> Vec<ZoneSummary> {
        self.zones.read().await.zones.iter().map(Zone::summary).collect()
    }

    pub async fn get_zone(&self, zone_id: i64) -> Result<ZoneSummary, ControlError> {
        Ok(self.zones.read().await.zone(zone_id)?.summary())
    }

    /// Manual open. Refused while the loop is not running, since nothing
    /// would enforce the safety cutoff.
    pub async fn open_zone(&self, zone_id: i64) -> Result<ZoneSummary, ControlError> {
        let mut table = self.zones.write().await;
        if !table.running {
            return Err(ControlError::NotRunning);
        }
        let now = self.clock.now();
        let (zone, valves) = table.zone_and_valves(zone_id)?;
        if let Some(t) = zone.override_open(true, now.time()) {
            apply(zone, valves, &self.db, t, now).await?;
        }
        Ok(zone.summary())
    }

    /// Manual stop: closes the zone however it was opened.
    pub async fn close_zone(&self, zone_id: i64) -> Result<ZoneSummary, ControlError> {
        let mut table = self.zones.write().await;
        let now = self.clock.now();
        let (zone, valves) = table.zone_and_valves(zone_id)?;
        if let Some(t) = zone.override_open(false, now.time()) {
            apply(zone, valves, &self.db, t, now).await?;
        }
        Ok(zone.summary())
    }

    /// Close and hold closed until restart.
    pub async fn hold_zone(&self, zone_id: i64) -> Result<ZoneSummary, ControlError> {
        let mut table = self.zones.write().await;
        let now = self.clock.now();
        let (zone, valves) = table.zone_and_valves(zone_id)?;
        if let Some(t) = zone.override_close() {
            apply(zone, valves, &self.db, t, now).await?;
        }
        Ok(zone.summary())
    }

    /// Persist a new entry and attach it to the end of the zone's schedule.
    pub async fn add_schedule_entry(
        &self,
        zone_id: i64,
        mut entry: ScheduleEntry,
    ) -> Result<ScheduleEntry, ControlError> {
        entry.validate()?;
        entry.id = None;

        let mut table = self.zones.write().await;
        let (zone, _) = table.zone_and_valves(zone_id)?;
        if entry.duration_sec > zone.max_open_seconds() {
            return Err(ControlError::Invalid(format!(
                "duration_sec {} exceeds max_open_seconds {}",
                entry.duration_sec,
                zone.max_open_seconds()
            )));
        }
        self.db.save_schedule_entry(&mut entry, zone_id).await?;
        zone.add_entry(entry.clone());
        info!(zone = %zone.name, entry = %entry, "schedule entry added");
        Ok(entry)
    }

    pub async fn remove_schedule_entry(
        &self,
        zone_id: i64,
        entry_id: i64,
    ) -> Result<ScheduleEntry, ControlError> {
        let mut table = self.zones.write().await;
        let (zone, _) = table.zone_and_valves(zone_id)?;
        let not_found = ControlError::EntryNotFound { zone_id, entry_id };
        if !zone.schedule.iter().any(|e| e.id == Some(entry_id)) {
            return Err(not_found);
        }

        self.db.delete_schedule_entry(entry_id).await?;
        let entry = zone.remove_entry(entry_id).ok_or(not_found)?;
        info!(zone = %zone.name, entry = %entry, "schedule entry removed");
        Ok(entry)
    }

    pub async fn logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, ControlError> {
        if filter.limit.is_some_and(|l| l < 0) {
            return Err(ControlError::Invalid("limit must not be negative".into()));
        }
        Ok(self.db.query_logs(filter).await?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
