//! Wall-clock abstraction for time-of-day decisions.
//!
//! The join path branches on the local time of day. Reading it through
//! [`WallClock`] lets tests pin the clock to any instant instead of depending
//! on when they happen to run.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{NaiveTime, Timelike};

/// Source of the current local time of day.
pub trait WallClock: Send + Sync {
    /// Returns the current local time of day.
    fn time_of_day(&self) -> NaiveTime;
}

/// Clock backed by the host's local time zone.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn time_of_day(&self) -> NaiveTime {
        chrono::Local::now().time()
    }
}

/// Clock pinned to a settable time of day, with second precision.
#[derive(Debug)]
pub struct FixedClock {
    seconds_from_midnight: AtomicU32,
}

impl FixedClock {
    #[must_use]
    pub fn new(time: NaiveTime) -> Self {
        Self {
            seconds_from_midnight: AtomicU32::new(time.num_seconds_from_midnight()),
        }
    }

    /// Convenience constructor from hour/minute/second.
    ///
    /// # Panics
    ///
    /// Panics if the arguments do not name a valid time of day.
    #[must_use]
    pub fn at(hour: u32, min: u32, sec: u32) -> Self {
        let Some(time) = NaiveTime::from_hms_opt(hour, min, sec) else {
            panic!("invalid time of day {hour:02}:{min:02}:{sec:02}");
        };
        Self::new(time)
    }

    pub fn set(&self, time: NaiveTime) {
        self.seconds_from_midnight
            .store(time.num_seconds_from_midnight(), Ordering::Relaxed);
    }
}

impl WallClock for FixedClock {
    fn time_of_day(&self) -> NaiveTime {
        let secs = self.seconds_from_midnight.load(Ordering::Relaxed);
        NaiveTime::from_num_seconds_from_midnight_opt(secs, 0).unwrap_or(NaiveTime::MIN)
    }
}
