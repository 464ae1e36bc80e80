use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;

use crate::schedule::{format_time, parse_time, ScheduleEntry, WeekdaySet};
use crate::zone::{Zone, DEFAULT_MAX_OPEN_SECONDS};

/// `YYYY-MM-DD HH:MM:SS.ffffff`, the on-disk and JSON timestamp format.
const LOG_TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]");

time::serde::format_description!(pub log_timestamp, PrimitiveDateTime, crate::db::LOG_TIMESTAMP_FORMAT);

/// SQLite-backed store for zones, schedule entries, the event log and the
/// safety ceiling.
///
/// The pool holds a single connection, so every operation is serialized and
/// each call checks the connection out only for its own duration.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ----------------------------
// Event log types
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IrrigationStart,
    IrrigationStop,
    LogIn,
    LogOut,
    General,
}

impl EventKind {
    /// Code stored in `log.event_code`.
    pub fn code(self) -> i64 {
        match self {
            Self::IrrigationStart => 1,
            Self::IrrigationStop => 2,
            Self::LogIn => 3,
            Self::LogOut => 4,
            Self::General => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::IrrigationStart),
            2 => Some(Self::IrrigationStop),
            3 => Some(Self::LogIn),
            4 => Some(Self::LogOut),
            5 => Some(Self::General),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("a general log event needs a non-empty text")]
pub struct InvalidLogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub zone_id: Option<i64>,
    #[serde(with = "log_timestamp")]
    pub date_time: PrimitiveDateTime,
    pub event: EventKind,
    pub text: Option<String>,
}

impl LogEntry {
    pub fn new(
        zone_id: Option<i64>,
        event: EventKind,
        date_time: PrimitiveDateTime,
        text: Option<&str>,
    ) -> Result<Self, InvalidLogEntry> {
        let entry = Self {
            zone_id,
            date_time,
            event,
            text: text.map(str::to_string),
        };
        entry.validate()?;
        Ok(entry)
    }

    pub fn validate(&self) -> Result<(), InvalidLogEntry> {
        let has_text = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        if self.event == EventKind::General && !has_text {
            return Err(InvalidLogEntry);
        }
        Ok(())
    }
}

/// Filters for [`Db::query_logs`]. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    pub zone_id: Option<i64>,
    pub event: Option<EventKind>,
    pub limit: Option<i64>,
}

fn format_timestamp(ts: PrimitiveDateTime) -> Result<String> {
    ts.format(LOG_TIMESTAMP_FORMAT)
        .with_context(|| format!("cannot format timestamp {ts}"))
}

fn parse_timestamp(s: &str) -> Result<PrimitiveDateTime> {
    PrimitiveDateTime::parse(s, LOG_TIMESTAMP_FORMAT)
        .with_context(|| format!("invalid timestamp '{s}'"))
}

// ----------------------------
// Row types
// ----------------------------

#[derive(sqlx::FromRow)]
struct ZoneRow {
    id: i64,
    name: String,
    gpio_pin: i64,
    last_irrigation_time: Option<String>,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: i64,
    zone_id: i64,
    scheduled_time: String,
    duration_seconds: i64,
    weekdays: i64,
}

#[derive(sqlx::FromRow)]
struct LogRow {
    zone_id: Option<i64>,
    date_time: String,
    event_code: i64,
    text: Option<String>,
}

impl ZoneRow {
    fn into_zone(self, schedule: Vec<ScheduleEntry>) -> Result<Zone> {
        let pin = u8::try_from(self.gpio_pin)
            .with_context(|| format!("zone {}: gpio_pin {} out of range", self.id, self.gpio_pin))?;
        let mut zone = Zone::new(self.name, pin).with_schedule(schedule);
        zone.id = Some(self.id);
        zone.last_irrigation = self
            .last_irrigation_time
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;
        Ok(zone)
    }
}

impl EntryRow {
    fn into_entry(self) -> Result<ScheduleEntry> {
        let start = parse_time(&self.scheduled_time)
            .with_context(|| format!("scheduler row {}", self.id))?;
        let weekdays = u8::try_from(self.weekdays)
            .ok()
            .and_then(WeekdaySet::from_bits)
            .with_context(|| format!("scheduler row {}: bad weekday mask {}", self.id, self.weekdays))?;
        Ok(ScheduleEntry {
            id: Some(self.id),
            start,
            duration_sec: self.duration_seconds,
            weekdays,
        })
    }
}

impl LogRow {
    fn into_entry(self) -> Result<LogEntry> {
        let event = EventKind::from_code(self.event_code)
            .with_context(|| format!("unknown log event code {}", self.event_code))?;
        Ok(LogEntry {
            zone_id: self.zone_id,
            date_time: parse_timestamp(&self.date_time)?,
            event,
            text: self.text,
        })
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Waits for the connection to be returned, then closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Zones + schedule entries
    // ----------------------------

    /// Every zone with its entries, both in id (= attachment) order.
    pub async fn load_all_zones(&self) -> Result<Vec<Zone>> {
        let zones: Vec<ZoneRow> = sqlx::query_as(
            "SELECT id, name, gpio_pin, last_irrigation_time FROM zone ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_all_zones failed")?;

        let entries: Vec<EntryRow> = sqlx::query_as(
            r#"
            SELECT id, zone_id, scheduled_time, duration_seconds, weekdays
            FROM scheduler
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_all_zones: scheduler query failed")?;

        let mut by_zone: HashMap<i64, Vec<ScheduleEntry>> = HashMap::new();
        for row in entries {
            by_zone.entry(row.zone_id).or_default().push(row.into_entry()?);
        }

        zones
            .into_iter()
            .map(|z| {
                let schedule = by_zone.remove(&z.id).unwrap_or_default();
                z.into_zone(schedule)
            })
            .collect()
    }

    /// Reload one zone straight from disk. The running controller serves
    /// zones from memory, so only tests read back through here.
    #[cfg(test)]
    pub async fn get_zone(&self, zone_id: i64) -> Result<Option<Zone>> {
        let row: Option<ZoneRow> = sqlx::query_as(
            "SELECT id, name, gpio_pin, last_irrigation_time FROM zone WHERE id = ?",
        )
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_zone failed")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let entries: Vec<EntryRow> = sqlx::query_as(
            r#"
            SELECT id, zone_id, scheduled_time, duration_seconds, weekdays
            FROM scheduler
            WHERE zone_id = ?
            ORDER BY id
            "#,
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await
        .context("get_zone: scheduler query failed")?;

        let schedule = entries
            .into_iter()
            .map(EntryRow::into_entry)
            .collect::<Result<Vec<_>>>()?;
        row.into_zone(schedule).map(Some)
    }

    pub async fn zone_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM zone")
            .fetch_one(&self.pool)
            .await
            .context("zone_count failed")
    }

    /// Insert (no id yet) or update a zone together with all of its entries.
    /// Ids are written back only after the transaction commits.
    pub async fn save_zone(&self, zone: &mut Zone) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("save_zone: begin failed")?;
        let last = zone.last_irrigation.map(format_timestamp).transpose()?;

        let zone_id = match zone.id {
            None => sqlx::query(
                "INSERT INTO zone (name, gpio_pin, last_irrigation_time) VALUES (?, ?, ?)",
            )
            .bind(&zone.name)
            .bind(i64::from(zone.gpio_pin))
            .bind(last)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("save_zone: insert '{}' failed", zone.name))?
            .last_insert_rowid(),
            Some(id) => {
                let res = sqlx::query(
                    "UPDATE zone SET name = ?, gpio_pin = ?, last_irrigation_time = ? WHERE id = ?",
                )
                .bind(&zone.name)
                .bind(i64::from(zone.gpio_pin))
                .bind(last)
                .bind(id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("save_zone: update zone {id} failed"))?;
                if res.rows_affected() == 0 {
                    bail!("save_zone: zone {id} does not exist");
                }
                id
            }
        };

        let mut entry_ids = Vec::with_capacity(zone.schedule.len());
        for entry in &zone.schedule {
            entry_ids.push(upsert_entry(&mut tx, entry, zone_id).await?);
        }

        tx.commit().await.context("save_zone: commit failed")?;

        zone.id = Some(zone_id);
        for (entry, id) in zone.schedule.iter_mut().zip(entry_ids) {
            entry.id = Some(id);
        }
        Ok(zone_id)
    }

    pub async fn save_schedule_entry(&self, entry: &mut ScheduleEntry, zone_id: i64) -> Result<i64> {
        entry.validate()?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("save_schedule_entry: acquire failed")?;
        let id = upsert_entry(&mut conn, entry, zone_id).await?;
        entry.id = Some(id);
        Ok(id)
    }

    /// Returns false when no entry had that id.
    pub async fn delete_schedule_entry(&self, entry_id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM scheduler WHERE id = ?")
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .context("delete_schedule_entry failed")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn touch_last_irrigation(&self, zone_id: i64, ts: PrimitiveDateTime) -> Result<()> {
        sqlx::query("UPDATE zone SET last_irrigation_time = ? WHERE id = ?")
            .bind(format_timestamp(ts)?)
            .bind(zone_id)
            .execute(&self.pool)
            .await
            .context("touch_last_irrigation failed")?;
        Ok(())
    }

    // ----------------------------
    // Configuration
    // ----------------------------

    pub async fn max_open_seconds(&self) -> Result<i64> {
        let v: Option<i64> = sqlx::query_scalar("SELECT maximum_seconds FROM configuration LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("max_open_seconds failed")?;
        Ok(v.unwrap_or(DEFAULT_MAX_OPEN_SECONDS))
    }

    pub async fn set_max_open_seconds(&self, seconds: i64) -> Result<()> {
        let res = sqlx::query("UPDATE configuration SET maximum_seconds = ?")
            .bind(seconds)
            .execute(&self.pool)
            .await
            .context("set_max_open_seconds failed")?;
        if res.rows_affected() == 0 {
            sqlx::query("INSERT INTO configuration (maximum_seconds) VALUES (?)")
                .bind(seconds)
                .execute(&self.pool)
                .await
                .context("set_max_open_seconds: insert failed")?;
        }
        Ok(())
    }

    // ----------------------------
    // Event log
    // ----------------------------

    /// Append one event. A `general` event without text is rejected before
    /// touching the database.
    pub async fn append_log(
        &self,
        zone_id: Option<i64>,
        event: EventKind,
        ts: PrimitiveDateTime,
        text: Option<&str>,
    ) -> Result<()> {
        let entry = LogEntry::new(zone_id, event, ts, text)?;
        sqlx::query("INSERT INTO log (zone_id, date_time, event_code, text) VALUES (?, ?, ?, ?)")
            .bind(entry.zone_id)
            .bind(format_timestamp(entry.date_time)?)
            .bind(entry.event.code())
            .bind(entry.text)
            .execute(&self.pool)
            .await
            .context("append_log failed")?;
        Ok(())
    }

    /// Newest first. Ties on timestamp fall back to insertion order.
    pub async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT zone_id, date_time, event_code, text FROM log");

        let mut sep = " WHERE ";
        if let Some(zone_id) = filter.zone_id {
            qb.push(sep).push("zone_id = ").push_bind(zone_id);
            sep = " AND ";
        }
        if let Some(event) = filter.event {
            qb.push(sep).push("event_code = ").push_bind(event.code());
        }
        qb.push(" ORDER BY date_time DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows: Vec<LogRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .context("query_logs failed")?;

        rows.into_iter().map(LogRow::into_entry).collect()
    }
}

/// Insert or update one `scheduler` row on an already checked-out connection.
async fn upsert_entry(conn: &mut SqliteConnection, entry: &ScheduleEntry, zone_id: i64) -> Result<i64> {
    let start = format_time(entry.start);
    let weekdays = i64::from(entry.weekdays.bits());

    match entry.id {
        None => {
            let res = sqlx::query(
                r#"
                INSERT INTO scheduler (zone_id, scheduled_time, duration_seconds, weekdays)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(zone_id)
            .bind(start)
            .bind(entry.duration_sec)
            .bind(weekdays)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("insert schedule entry for zone {zone_id} failed"))?;
            Ok(res.last_insert_rowid())
        }
        Some(id) => {
            let res = sqlx::query(
                r#"
                UPDATE scheduler
                SET zone_id = ?, scheduled_time = ?, duration_seconds = ?, weekdays = ?
                WHERE id = ?
                "#,
            )
            .bind(zone_id)
            .bind(start)
            .bind(entry.duration_sec)
            .bind(weekdays)
            .bind(id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("update schedule entry {id} failed"))?;
            if res.rows_affected() == 0 {
                bail!("schedule entry {id} does not exist");
            }
            Ok(id)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
