use crate::timeline::AudioTimeline;
use std::time::Duration;
use tokio::time::Instant;

/// Caller-assigned identity of one streaming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingRequest {
    pub request_id: String,
    pub turn_id: i64,
}

impl StreamingRequest {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            turn_id: -1,
        }
    }

    pub fn with_turn_id(mut self, turn_id: i64) -> Self {
        self.turn_id = turn_id;
        self
    }
}

/// Point-in-time view of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub request_id: String,
    pub turn_id: i64,
    pub finished: bool,
    /// Bytes of audio or characters of text sent.
    pub units_sent: usize,
    /// Audio sent across every generation, from sample arithmetic.
    pub audio_sent: Duration,
    pub audio_received_bytes: usize,
    /// Time from submission to the first output event.
    pub ttfb: Option<Duration>,
}

/// Engine-side state of the active request.
#[derive(Debug)]
pub(crate) struct ActiveRequest {
    pub(crate) request: StreamingRequest,
    pub(crate) started_at: Instant,
    pub(crate) finished: bool,
    pub(crate) units_sent: usize,
    pub(crate) audio_received_bytes: usize,
    pub(crate) first_output_at: Option<Instant>,
    pub(crate) timeline: AudioTimeline,
}

impl ActiveRequest {
    pub(crate) fn new(request: StreamingRequest) -> Self {
        Self {
            request,
            started_at: Instant::now(),
            finished: false,
            units_sent: 0,
            audio_received_bytes: 0,
            first_output_at: None,
            timeline: AudioTimeline::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.request.request_id
    }

    /// Records an output event, returning the TTFB the first time.
    pub(crate) fn record_output(&mut self, audio_bytes: usize) -> Option<Duration> {
        self.audio_received_bytes += audio_bytes;
        if self.first_output_at.is_some() {
            return None;
        }
        let now = Instant::now();
        self.first_output_at = Some(now);
        Some(now - self.started_at)
    }

    pub(crate) fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            request_id: self.request.request_id.clone(),
            turn_id: self.request.turn_id,
            finished: self.finished,
            units_sent: self.units_sent,
            audio_sent: self.timeline.total(),
            audio_received_bytes: self.audio_received_bytes,
            ttfb: self.first_output_at.map(|at| at - self.started_at),
        }
    }
}
