//! Raw vendor messages to canonical events.
//!
//! Vendor protocols decide once, at parse time, which `RawMessage` a frame
//! is. `normalize` then maps that closed set onto `CanonicalEvent` without
//! looking at any vendor strings.

use crate::{audio, event::CanonicalEvent};
use tracing::debug;

/// Which recognition pass produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecognitionPass {
    /// Single-pass streaming recognition.
    #[default]
    Streaming,
    /// Fast interim pass of a two-pass recognizer.
    Online,
    /// Slow authoritative pass of a two-pass recognizer.
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPayload {
    Raw(Vec<u8>),
    Base64(String),
}

/// A parsed vendor frame, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    Result {
        text: String,
        /// Explicit finality flag, when the vendor sends one.
        is_final: Option<bool>,
        pass: RecognitionPass,
        start_ms: u64,
        end_ms: u64,
    },
    Audio(AudioPayload),
    End,
    Error {
        message: String,
        fatal: bool,
    },
    /// Bookkeeping the caller never sees.
    Info(String),
}

/// Maps one raw message to at most one canonical event.
pub fn normalize(raw: RawMessage) -> Option<CanonicalEvent> {
    match raw {
        RawMessage::Result {
            text,
            is_final,
            pass,
            start_ms,
            end_ms,
        } => {
            if text.trim().is_empty() {
                return None;
            }
            let is_final = match pass {
                RecognitionPass::Offline => true,
                RecognitionPass::Online => is_final.unwrap_or(false),
                RecognitionPass::Streaming => is_final.unwrap_or(true),
            };
            let duration_ms = end_ms.saturating_sub(start_ms);
            Some(if is_final {
                CanonicalEvent::FinalResult {
                    text,
                    start_ms,
                    duration_ms,
                }
            } else {
                CanonicalEvent::PartialResult {
                    text,
                    start_ms,
                    duration_ms,
                }
            })
        }
        RawMessage::Audio(AudioPayload::Raw(bytes)) => {
            (!bytes.is_empty()).then_some(CanonicalEvent::AudioChunk { bytes })
        }
        RawMessage::Audio(AudioPayload::Base64(fragment)) => match audio::decode_base64(&fragment) {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => Some(CanonicalEvent::AudioChunk { bytes }),
            Err(e) => Some(CanonicalEvent::error(
                format!("undecodable audio payload: {e}"),
                false,
            )),
        },
        RawMessage::End => Some(CanonicalEvent::StreamEnd),
        RawMessage::Error { message, fatal } => Some(CanonicalEvent::Error { message, fatal }),
        RawMessage::Info(kind) => {
            debug!(kind = %kind, "dropping info message");
            None
        }
    }
}
