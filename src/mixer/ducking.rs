//! Gain policy for background and foreground audio.

use crate::defaults;
use crate::events::{EngineEvent, EventSender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Per-input gains for one mix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixParameters {
    pub background_gain: f32,
    pub foreground_gain: f32,
}

/// Ducked vs. ambient gain selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainPolicy {
    /// Background gain used when ducking is disabled.
    pub ambient_level: f32,
    pub foreground_gain: f32,
}

impl Default for GainPolicy {
    fn default() -> Self {
        Self {
            ambient_level: defaults::AMBIENT_LEVEL,
            foreground_gain: defaults::FOREGROUND_GAIN,
        }
    }
}

impl GainPolicy {
    pub fn new(ambient_level: f32) -> Self {
        Self {
            ambient_level: sanitize_gain(ambient_level, defaults::AMBIENT_LEVEL),
            ..Self::default()
        }
    }

    /// Ducking enabled: background at `duck_level`. Disabled: background at
    /// the ambient level, whatever `duck_level` says.
    pub fn compute(&self, ducking_enabled: bool, duck_level: f32) -> MixParameters {
        let background_gain = if ducking_enabled {
            sanitize_gain(duck_level, defaults::DUCK_LEVEL)
        } else {
            self.ambient_level
        };
        MixParameters {
            background_gain,
            foreground_gain: self.foreground_gain,
        }
    }
}

/// [`GainPolicy::compute`] with the default ambient level.
pub fn compute_mix_parameters(ducking_enabled: bool, duck_level: f32) -> MixParameters {
    GainPolicy::default().compute(ducking_enabled, duck_level)
}

fn sanitize_gain(gain: f32, fallback: f32) -> f32 {
    if gain.is_finite() {
        gain.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

struct DuckState {
    gain_bits: AtomicU32,
    generation: AtomicU64,
    /// Gain to go back to once the latest duck expires.
    restore_to: Mutex<Option<f32>>,
    duck_level: f32,
    events: EventSender,
}

/// Live background gain of the continuous stream, with timed ducking.
///
/// Clones share the same gain.
#[derive(Clone)]
pub struct DuckingController {
    state: Arc<DuckState>,
}

impl DuckingController {
    pub fn new(ambient_level: f32, duck_level: f32, events: EventSender) -> Self {
        Self {
            state: Arc::new(DuckState {
                gain_bits: AtomicU32::new(
                    sanitize_gain(ambient_level, defaults::AMBIENT_LEVEL).to_bits(),
                ),
                generation: AtomicU64::new(0),
                restore_to: Mutex::new(None),
                duck_level: sanitize_gain(duck_level, defaults::DUCK_LEVEL),
                events,
            }),
        }
    }

    pub fn current_gain(&self) -> f32 {
        f32::from_bits(self.state.gain_bits.load(Ordering::Acquire))
    }

    pub fn set_gain(&self, gain: f32) {
        let gain = sanitize_gain(gain, self.current_gain());
        self.state.gain_bits.store(gain.to_bits(), Ordering::Release);
    }

    pub fn duck_level(&self) -> f32 {
        self.state.duck_level
    }

    /// True while a timed duck is waiting to be restored.
    pub fn is_ducked(&self) -> bool {
        match self.state.restore_to.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Drops the gain to the duck level now and restores the previous gain
    /// after `duration` on a detached timer thread. Never blocks.
    ///
    /// Overlapping calls extend the duck: only the most recent timer
    /// restores, and it restores the gain from before the first duck.
    pub fn duck_then_restore(&self, duration: Duration) {
        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut restore_to = match self.state.restore_to.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if restore_to.is_none() {
                *restore_to = Some(self.current_gain());
            }
            self.set_gain(self.state.duck_level);
        }
        self.state.events.emit(EngineEvent::VolumeDucked {
            level: self.state.duck_level,
            restore_after_secs: duration.as_secs_f64(),
        });

        let state = Arc::clone(&self.state);
        thread::spawn(move || {
            thread::sleep(duration);
            if state.generation.load(Ordering::Acquire) != generation {
                return;
            }
            let mut restore_to = match state.restore_to.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Re-check under the lock: a newer duck may have landed meanwhile
            if state.generation.load(Ordering::Acquire) != generation {
                return;
            }
            if let Some(level) = restore_to.take() {
                state.gain_bits.store(level.to_bits(), Ordering::Release);
                state.events.emit(EngineEvent::VolumeRestored { level });
            }
        });
    }
}

impl std::fmt::Debug for DuckingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckingController")
            .field("gain", &self.current_gain())
            .field("duck_level", &self.state.duck_level)
            .finish()
    }
}
