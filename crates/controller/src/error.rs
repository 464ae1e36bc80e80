//! Errors returned by the remote-control surface.

use thiserror::Error;

use crate::schedule::ScheduleError;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("zone {0} not found")]
    ZoneNotFound(i64),
    #[error("schedule entry {entry_id} not found in zone {zone_id}")]
    EntryNotFound { zone_id: i64, entry_id: i64 },
    #[error("executor is not running")]
    NotRunning,
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
