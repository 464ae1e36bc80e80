//! TOML config file loading, validation, and database seeding for zones and
//! their schedules.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::db::Db;
use crate::schedule::{parse_time, ScheduleEntry, WeekdaySet, SECONDS_PER_DAY};
use crate::zone::{Zone, DEFAULT_MAX_OPEN_SECONDS};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSection,
    /// Seeded into the database only when it holds no zones yet.
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub poll_interval_ms: u64,
    /// Persisted into the `configuration` table when set.
    pub max_open_seconds: Option<i64>,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 800,
            max_open_seconds: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub name: String,
    pub gpio_pin: i64,
    #[serde(default)]
    pub schedule: Vec<ScheduleItem>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleItem {
    /// `HH:MM:SS`
    pub start: String,
    pub duration_sec: i64,
    /// 0 = Monday .. 6 = Sunday. Every day when omitted.
    #[serde(default)]
    pub weekdays: Option<Vec<i64>>,
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

const POLL_INTERVAL_RANGE_MS: std::ops::RangeInclusive<u64> = 100..=60_000;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.controller.poll_interval_ms)
    }

    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_zones(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        if !POLL_INTERVAL_RANGE_MS.contains(&c.poll_interval_ms) {
            errors.push(format!(
                "controller: poll_interval_ms {} out of range [{}, {}]",
                c.poll_interval_ms,
                POLL_INTERVAL_RANGE_MS.start(),
                POLL_INTERVAL_RANGE_MS.end()
            ));
        }
        if let Some(max) = c.max_open_seconds {
            if max <= 0 {
                errors.push(format!("controller: max_open_seconds must be positive, got {max}"));
            }
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();
        let ceiling = self
            .controller
            .max_open_seconds
            .unwrap_or(DEFAULT_MAX_OPEN_SECONDS);

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.name.trim().is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.name)
                }
            };

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&z.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    z.gpio_pin
                ));
            } else if !seen_pins.insert(z.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is already used by another zone",
                    ctx(),
                    z.gpio_pin
                ));
            }

            // ── Schedule ────────────────────────────────────────
            for (j, s) in z.schedule.iter().enumerate() {
                let item_ctx = || format!("{}: schedule[{j}]", ctx());

                if let Err(e) = parse_time(&s.start) {
                    errors.push(format!("{}: {e}", item_ctx()));
                }
                if !(1..SECONDS_PER_DAY).contains(&s.duration_sec) {
                    errors.push(format!(
                        "{}: duration_sec {} out of range [1, {}]",
                        item_ctx(),
                        s.duration_sec,
                        SECONDS_PER_DAY - 1
                    ));
                } else if s.duration_sec > ceiling {
                    errors.push(format!(
                        "{}: duration_sec {} exceeds max_open_seconds {ceiling}",
                        item_ctx(),
                        s.duration_sec
                    ));
                }
                if let Some(days) = &s.weekdays {
                    if let Err(e) = WeekdaySet::from_days(days.iter().copied()) {
                        errors.push(format!("{}: {e}", item_ctx()));
                    }
                }
            }
        }
    }
}

impl ZoneEntry {
    /// Build an unsaved zone. Call only on a validated config.
    fn to_zone(&self) -> Result<Zone> {
        let pin = u8::try_from(self.gpio_pin)
            .with_context(|| format!("zone '{}': gpio_pin {} out of range", self.name, self.gpio_pin))?;
        let schedule = self
            .schedule
            .iter()
            .map(ScheduleItem::to_entry)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("zone '{}': invalid schedule", self.name))?;
        Ok(Zone::new(self.name.trim(), pin).with_schedule(schedule))
    }
}

impl ScheduleItem {
    fn to_entry(&self) -> Result<ScheduleEntry, crate::schedule::ScheduleError> {
        let start = parse_time(&self.start)?;
        match &self.weekdays {
            Some(days) => {
                let weekdays = WeekdaySet::from_days(days.iter().copied())?;
                ScheduleEntry::new(start, self.duration_sec, weekdays)
            }
            None => ScheduleEntry::daily(start, self.duration_sec),
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Like [`load`], but a missing file yields the built-in defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        info!(path, "no config file, using defaults");
        return Ok(Config::default());
    }
    load(path)
}

fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Persist the safety ceiling and seed zones into an empty database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    if let Some(max) = config.controller.max_open_seconds {
        db.set_max_open_seconds(max)
            .await
            .context("failed to store max_open_seconds")?;
    }

    let existing = db.zone_count().await?;
    let mut seeded = 0;
    if existing > 0 {
        if !config.zones.is_empty() {
            info!(existing, "database already has zones, config zones not seeded");
        }
    } else {
        for z in &config.zones {
            let mut zone = z.to_zone()?;
            db.save_zone(&mut zone)
                .await
                .with_context(|| format!("failed to seed zone '{}'", z.name))?;
            seeded += 1;
        }
    }

    info!(
        seeded,
        poll_ms = config.controller.poll_interval_ms,
        max_open_seconds = ?config.controller.max_open_seconds,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
