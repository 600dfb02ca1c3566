use serde::{Serialize, Serializer};
use std::time::Duration;

/// The engine's vendor-independent view of an inbound message.
///
/// Only the normalizer constructs these; everything downstream matches on the
/// closed set of variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    /// Interim recognition text that may still change.
    PartialResult {
        text: String,
        start_ms: u64,
        duration_ms: u64,
    },
    /// Authoritative recognition text for a span of audio.
    FinalResult {
        text: String,
        start_ms: u64,
        duration_ms: u64,
    },
    /// Decoded synthesized audio. Never empty.
    AudioChunk {
        #[serde(rename = "len", serialize_with = "serialize_len")]
        bytes: Vec<u8>,
    },
    /// The vendor finished the current request.
    StreamEnd,
    Error { message: String, fatal: bool },
}

fn serialize_len<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(bytes.len() as u64)
}

impl CanonicalEvent {
    /// Terminal events end the request's event sequence once yielded.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CanonicalEvent::StreamEnd | CanonicalEvent::Error { .. })
    }

    pub fn is_output(&self) -> bool {
        matches!(
            self,
            CanonicalEvent::PartialResult { .. }
                | CanonicalEvent::FinalResult { .. }
                | CanonicalEvent::AudioChunk { .. }
        )
    }

    pub(crate) fn error(message: impl Into<String>, fatal: bool) -> Self {
        CanonicalEvent::Error {
            message: message.into(),
            fatal,
        }
    }
}

/// Outcome of a finalize/flush handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeComplete {
    /// Time from sending the finalize message to its completion.
    pub latency: Duration,
    /// Set when the link dropped, the session closed, or the ack never came.
    pub interrupted: bool,
}

/// Session-level notifications for the host, outside any single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Connected { generation: u64 },
    Reconnecting { attempt: u32, delay: Duration },
    Reconnected { generation: u64 },
    FinalizeComplete(FinalizeComplete),
    /// A vendor error arrived while no request was active.
    VendorError { message: String },
    /// The session is unusable; every later call fails with `Closed`.
    Fatal { message: String },
    Closed,
}
