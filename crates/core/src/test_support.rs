//! A small JSON vendor protocol for unit tests.

use crate::{
    normalizer::{AudioPayload, RawMessage, RecognitionPass},
    protocol::{Negotiation, Payload, VendorProtocol},
    transport::{Endpoint, Frame},
};
use anyhow::{Context, anyhow};
use serde_json::{Value, json};

pub(crate) struct JsonProtocol {
    negotiation: Negotiation,
}

impl JsonProtocol {
    pub(crate) fn immediate() -> Self {
        Self {
            negotiation: Negotiation::Immediate,
        }
    }

    pub(crate) fn handshake() -> Self {
        Self {
            negotiation: Negotiation::AwaitReady,
        }
    }
}

pub(crate) fn ready_frame() -> Frame {
    Frame::text(r#"{"type":"ready"}"#)
}

impl VendorProtocol for JsonProtocol {
    fn name(&self) -> &str {
        "json"
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new("mem://json")
    }

    fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    fn accept_negotiation(&self, frame: &Frame) -> anyhow::Result<()> {
        let value: Value = serde_json::from_str(frame.as_text().context("binary frame")?)?;
        match value["type"].as_str() {
            Some("ready") => Ok(()),
            other => Err(anyhow!("expected ready, got {other:?}")),
        }
    }

    fn setup_frames(&self) -> Vec<Frame> {
        vec![Frame::text(json!({"type": "setup"}).to_string())]
    }

    fn encode(&self, payload: &Payload) -> anyhow::Result<Vec<Frame>> {
        Ok(match payload {
            Payload::Audio(bytes) => vec![Frame::Binary(bytes.clone())],
            Payload::Text(text) => vec![Frame::text(
                json!({"type": "text", "text": text}).to_string(),
            )],
        })
    }

    fn finalize_message(&self) -> Frame {
        Frame::text(json!({"type": "finalize"}).to_string())
    }

    fn close_message(&self) -> Option<Frame> {
        Some(Frame::text(json!({"type": "close"}).to_string()))
    }

    fn parse(&self, frame: &Frame) -> anyhow::Result<RawMessage> {
        let value: Value = serde_json::from_str(frame.as_text().context("binary frame")?)?;
        let kind = value["type"].as_str().unwrap_or_default();
        Ok(match kind {
            "partial" | "final" => RawMessage::Result {
                text: value["text"].as_str().unwrap_or_default().to_string(),
                is_final: Some(kind == "final"),
                pass: RecognitionPass::Streaming,
                start_ms: value["start"].as_u64().unwrap_or(0),
                end_ms: value["end"].as_u64().unwrap_or(0),
            },
            "audio" => RawMessage::Audio(AudioPayload::Base64(
                value["data"].as_str().unwrap_or_default().to_string(),
            )),
            "end" => RawMessage::End,
            "error" => RawMessage::Error {
                message: value["message"].as_str().unwrap_or_default().to_string(),
                fatal: value["fatal"].as_bool().unwrap_or(false),
            },
            other => RawMessage::Info(other.to_string()),
        })
    }
}
