//! Audio timeline accounting for one streaming request.
//!
//! Vendors report result timestamps relative to the start of the audio they
//! have received on the *current* connection. After a reconnect that origin
//! moves, so the tracker keeps the audio already accounted for in earlier
//! generations as a base offset and maps every vendor timestamp onto the
//! request's own timeline.

use crate::audio::AudioFormat;
use std::time::Duration;

/// Elapsed-audio bookkeeping that survives reconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioTimeline {
    base_offset: Duration,
    elapsed_since_reset: Duration,
}

impl AudioTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts for one outbound audio unit of the given duration.
    pub fn record_sent(&mut self, duration: Duration) {
        self.elapsed_since_reset += duration;
    }

    /// Accounts for `bytes` of outbound audio in `format`, returning the
    /// duration that was added.
    pub fn record_bytes(&mut self, bytes: usize, format: &AudioFormat) -> Duration {
        let duration = format.duration_of(bytes);
        self.record_sent(duration);
        duration
    }

    /// Maps a timestamp relative to the current generation's stream start to
    /// milliseconds since the request began.
    pub fn absolute_time(&self, relative_ms: u64) -> u64 {
        self.base_offset_ms().saturating_add(relative_ms)
    }

    /// Folds the current generation's audio into the base offset. Must run
    /// once per successful reconnect, before any new audio is sent.
    pub fn on_reconnect(&mut self) {
        self.base_offset += self.elapsed_since_reset;
        self.elapsed_since_reset = Duration::ZERO;
    }

    pub fn base_offset_ms(&self) -> u64 {
        self.base_offset.as_millis() as u64
    }

    pub fn elapsed_since_reset_ms(&self) -> u64 {
        self.elapsed_since_reset.as_millis() as u64
    }

    /// All audio sent for the request, across every generation.
    pub fn total(&self) -> Duration {
        self.base_offset + self.elapsed_since_reset
    }
}
