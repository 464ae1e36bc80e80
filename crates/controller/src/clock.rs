//! Wall-clock source for the executor.

use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::{info, warn};

pub trait Clock: Send + Sync {
    /// Local wall-clock time.
    fn now(&self) -> PrimitiveDateTime;
}

/// System time shifted by a UTC offset fixed at construction.
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    /// Resolve the local offset. Must run before any other thread exists:
    /// on Unix `time` refuses to read the offset from a multi-threaded
    /// process, in which case this falls back to UTC.
    pub fn local() -> Self {
        let offset = match UtcOffset::current_local_offset() {
            Ok(offset) => offset,
            Err(e) => {
                warn!("cannot determine local UTC offset ({e}), schedules run on UTC");
                UtcOffset::UTC
            }
        };
        info!(%offset, "system clock ready");
        Self::with_offset(offset)
    }

    pub fn with_offset(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        PrimitiveDateTime::new(now.date(), now.time())
    }
}

/// Settable clock for tests.
#[cfg(test)]
pub struct FixedClock(std::sync::Mutex<PrimitiveDateTime>);

#[cfg(test)]
impl FixedClock {
    pub fn new(at: PrimitiveDateTime) -> Self {
        Self(std::sync::Mutex::new(at))
    }

    pub fn set(&self, at: PrimitiveDateTime) {
        *self.0.lock().unwrap() = at;
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> PrimitiveDateTime {
        *self.0.lock().unwrap()
    }
}

/// Test clock that moves one second forward on every read.
#[cfg(test)]
pub struct SteppingClock(std::sync::Mutex<PrimitiveDateTime>);

#[cfg(test)]
impl SteppingClock {
    pub fn new(at: PrimitiveDateTime) -> Self {
        Self(std::sync::Mutex::new(at))
    }
}

#[cfg(test)]
impl Clock for SteppingClock {
    fn now(&self) -> PrimitiveDateTime {
        let mut now = self.0.lock().unwrap();
        let read = *now;
        *now += time::Duration::SECOND;
        read
    }
}
