//! Bounded log of what the stream sounded like, and when.

use crate::classify::AudioType;
use crate::defaults;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Entries shown in a summary.
pub const RECENT_ENTRIES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Wall-clock time of the observation, in milliseconds since the epoch.
    pub timestamp_unix_ms: u64,
    /// Seconds since the service started.
    pub elapsed_secs: f64,
    pub classified_type: AudioType,
    pub text: String,
}

impl TranscriptEntry {
    pub fn now(elapsed_secs: f64, classified_type: AudioType, text: impl Into<String>) -> Self {
        Self {
            timestamp_unix_ms: unix_millis(SystemTime::now()),
            elapsed_secs,
            classified_type,
            text: text.into(),
        }
    }
}

/// Counts per type plus the latest few entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_entries: usize,
    pub counts: Vec<(AudioType, usize)>,
    pub recent: Vec<TranscriptEntry>,
}

/// Thread-safe, append-only transcript holding at most `limit` entries.
/// Once full, each new entry evicts the oldest.
#[derive(Debug)]
pub struct Transcript {
    entries: Mutex<VecDeque<TranscriptEntry>>,
    limit: usize,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::with_limit(defaults::TRANSCRIPT_LIMIT)
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn record(&self, entry: TranscriptEntry) {
        let mut entries = self.lock();
        if entries.len() >= self.limit {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot of every retained entry, oldest first.
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counts over the retained entries plus the latest few, without
    /// copying the whole log.
    pub fn summary(&self) -> Summary {
        let entries = self.lock();
        let counts = AudioType::ALL
            .iter()
            .map(|&audio_type| {
                let count = entries
                    .iter()
                    .filter(|e| e.classified_type == audio_type)
                    .count();
                (audio_type, count)
            })
            .collect();
        let recent = entries
            .iter()
            .skip(entries.len().saturating_sub(RECENT_ENTRIES))
            .cloned()
            .collect();
        Summary {
            total_entries: entries.len(),
            counts,
            recent,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TranscriptEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
