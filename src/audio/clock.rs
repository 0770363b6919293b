//! Playback position tracking for the looping background track.
//!
//! The background track is treated as if it started playing when the service
//! started and never stopped since. Its position is derived from wall-clock
//! time only, so any number of threads can ask for it without coordination.

use crate::error::{BgmixError, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Trait for time sources, enabling deterministic testing.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Real system clock using `std::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests and simulations.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Creates a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        if let Ok(mut current) = self.current.lock() {
            *current += duration;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.current.lock() {
            Ok(current) => *current,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Single source of truth for "where the music is".
///
/// Both fields are fixed at construction; restarting the service means
/// building a new clock.
pub struct PlaybackClock {
    started_at: Instant,
    track_duration_secs: f64,
    clock: Arc<dyn Clock>,
}

impl PlaybackClock {
    /// Starts a playback clock on the system clock.
    pub fn new(track_duration_secs: f64) -> Result<Self> {
        Self::with_clock(track_duration_secs, Arc::new(SystemClock))
    }

    /// Starts a playback clock on the given time source.
    ///
    /// Rejects non-positive or non-finite durations so a bad configuration
    /// fails at startup rather than on the first mix.
    pub fn with_clock(track_duration_secs: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        if !track_duration_secs.is_finite() || track_duration_secs <= 0.0 {
            return Err(BgmixError::invalid(
                "track.duration_secs",
                format!("must be a positive number of seconds, got {track_duration_secs}"),
            ));
        }
        Ok(Self {
            started_at: clock.now(),
            track_duration_secs,
            clock,
        })
    }

    /// Seconds into the background track right now, in `[0, duration)`.
    pub fn current_offset(&self) -> f64 {
        self.offset_at(self.clock.now())
    }

    /// Seconds into the background track at `instant`.
    pub fn offset_at(&self, instant: Instant) -> f64 {
        if self.track_duration_secs <= 0.0 {
            return 0.0;
        }
        let elapsed = instant.saturating_duration_since(self.started_at);
        let offset = elapsed.as_secs_f64().rem_euclid(self.track_duration_secs);
        // rem_euclid can round up to the divisor itself for values just below it
        if offset >= self.track_duration_secs {
            0.0
        } else {
            offset
        }
    }

    /// Wall-clock time since the clock started.
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started_at)
    }

    /// Seconds left until the track wraps around.
    pub fn remaining(&self) -> f64 {
        self.track_duration_secs - self.current_offset()
    }

    pub fn track_duration_secs(&self) -> f64 {
        self.track_duration_secs
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl std::fmt::Debug for PlaybackClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackClock")
            .field("started_at", &self.started_at)
            .field("track_duration_secs", &self.track_duration_secs)
            .finish()
    }
}
