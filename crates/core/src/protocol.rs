//! The seam between the engine and a vendor's wire format.

use crate::{
    audio::AudioFormat,
    event::CanonicalEvent,
    normalizer::RawMessage,
    transport::{Endpoint, Frame},
};

/// What the caller pushes into a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw PCM in the protocol's `audio_format`.
    Audio(Vec<u8>),
    /// Text to synthesize.
    Text(String),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Audio(bytes) => bytes.len(),
            Payload::Text(text) => text.chars().count(),
        }
    }

    /// Size on the wire before any vendor encoding.
    pub fn byte_len(&self) -> usize {
        match self {
            Payload::Audio(bytes) => bytes.len(),
            Payload::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Audio(bytes) => bytes.is_empty(),
            Payload::Text(text) => text.is_empty(),
        }
    }
}

/// How a freshly opened link becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Negotiation {
    /// Ready as soon as the link is open.
    #[default]
    Immediate,
    /// Ready once the vendor sends one message accepted by
    /// `VendorProtocol::accept_negotiation`.
    AwaitReady,
}

/// Builds and parses one vendor's messages.
///
/// Implementations are stateless; the engine owns every piece of session
/// state and calls back into the protocol only to translate.
pub trait VendorProtocol: Send + Sync + 'static {
    /// Short name used in logs and dump file names.
    fn name(&self) -> &str;

    fn endpoint(&self) -> Endpoint;

    /// Format of outbound audio, used for timeline accounting.
    fn audio_format(&self) -> AudioFormat {
        AudioFormat::default()
    }

    fn negotiation(&self) -> Negotiation {
        Negotiation::Immediate
    }

    /// Checks the first inbound message on a new link. Only called for
    /// `Negotiation::AwaitReady`.
    fn accept_negotiation(&self, _frame: &Frame) -> anyhow::Result<()> {
        Ok(())
    }

    /// Frames sent right after negotiation on every generation.
    fn setup_frames(&self) -> Vec<Frame> {
        Vec::new()
    }

    /// Frames carrying one unit of caller payload.
    fn encode(&self, payload: &Payload) -> anyhow::Result<Vec<Frame>>;

    /// The finalize/flush message.
    fn finalize_message(&self) -> Frame;

    /// Polite termination sent before closing a ready link.
    fn close_message(&self) -> Option<Frame> {
        None
    }

    fn parse(&self, frame: &Frame) -> anyhow::Result<RawMessage>;

    /// Whether `event` acknowledges an outstanding finalize.
    fn is_finalize_ack(&self, event: &CanonicalEvent) -> bool {
        matches!(event, CanonicalEvent::StreamEnd)
    }
}
