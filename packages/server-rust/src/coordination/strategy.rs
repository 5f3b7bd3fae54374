//! Time-window strategy selection.
//!
//! Inside the peak-traffic window joins are serialized through the fair lock;
//! outside it they race optimistically and the party version decides.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveTime;
use joingate_core::WallClock;
use serde::{Deserialize, Serialize};

use crate::config::JoinConfig;

/// How a join is protected against concurrent joins to the same party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationMode {
    /// Fair distributed lock, one join per party at a time.
    Pessimistic,
    /// No lock; version conflicts are retried.
    Optimistic,
}

impl CoordinationMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pessimistic => "pessimistic",
            Self::Optimistic => "optimistic",
        }
    }
}

impl fmt::Display for CoordinationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open time-of-day interval `[start, end)`.
///
/// `start > end` wraps past midnight; `start == end` is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Default for TrafficWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl TrafficWindow {
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Pure mode selection: pessimistic inside `window`, optimistic outside.
#[must_use]
pub fn select_mode(window: &TrafficWindow, now: NaiveTime) -> CoordinationMode {
    if window.contains(now) {
        CoordinationMode::Pessimistic
    } else {
        CoordinationMode::Optimistic
    }
}

/// Picks the coordination mode for a join from the injected clock.
#[derive(Clone)]
pub struct StrategySelector {
    clock: Arc<dyn WallClock>,
}

impl StrategySelector {
    #[must_use]
    pub fn new(clock: Arc<dyn WallClock>) -> Self {
        Self { clock }
    }

    /// Returns `config.forced_mode` when set, otherwise the mode for the
    /// current time of day.
    #[must_use]
    pub fn select(&self, config: &JoinConfig) -> CoordinationMode {
        if let Some(mode) = config.forced_mode {
            return mode;
        }
        let now = self.clock.time_of_day();
        let mode = select_mode(&config.window, now);
        tracing::debug!(%now, %mode, "coordination mode selected");
        mode
    }
}

impl fmt::Debug for StrategySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategySelector").finish_non_exhaustive()
    }
}
