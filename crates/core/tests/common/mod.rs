#![allow(dead_code)]

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use voxstream_core::{
    EngineConfig, Negotiation, Payload, SessionNotice, StreamSession, VendorProtocol,
    audio::encode_base64,
    normalizer::{AudioPayload, RawMessage, RecognitionPass},
    transport::{Endpoint, Frame, MemoryConnector, MemoryPeer, memory::MemoryAcceptor},
};

/// Line protocol spoken by the scripted vendors in these tests.
pub struct LabProtocol {
    address: String,
    negotiation: Negotiation,
}

impl LabProtocol {
    pub fn immediate() -> Self {
        Self {
            address: "mem://lab".into(),
            negotiation: Negotiation::Immediate,
        }
    }

    pub fn handshake(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            negotiation: Negotiation::AwaitReady,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Ready,
    Partial {
        text: String,
        #[serde(default)]
        start: u64,
        #[serde(default)]
        end: u64,
    },
    Final {
        text: String,
        #[serde(default)]
        start: u64,
        #[serde(default)]
        end: u64,
    },
    Audio {
        data: String,
    },
    End,
    Error {
        message: String,
        #[serde(default)]
        fatal: bool,
    },
    #[serde(other)]
    Other,
}

impl VendorProtocol for LabProtocol {
    fn name(&self) -> &str {
        "lab"
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.clone()).with_header("X-Lab-Token", "t0ken")
    }

    fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    fn accept_negotiation(&self, frame: &Frame) -> anyhow::Result<()> {
        match serde_json::from_str::<Inbound>(frame.as_text().unwrap_or_default())? {
            Inbound::Ready => Ok(()),
            _ => anyhow::bail!("expected ready"),
        }
    }

    fn setup_frames(&self) -> Vec<Frame> {
        vec![Frame::text(json!({"type": "setup"}).to_string())]
    }

    fn encode(&self, payload: &Payload) -> anyhow::Result<Vec<Frame>> {
        Ok(match payload {
            Payload::Audio(pcm) => vec![Frame::Binary(pcm.clone())],
            Payload::Text(text) => vec![Frame::text(
                json!({"type": "speak", "text": text}).to_string(),
            )],
        })
    }

    fn finalize_message(&self) -> Frame {
        Frame::text(json!({"type": "flush"}).to_string())
    }

    fn close_message(&self) -> Option<Frame> {
        Some(Frame::text(json!({"type": "bye"}).to_string()))
    }

    fn parse(&self, frame: &Frame) -> anyhow::Result<RawMessage> {
        let text = frame
            .as_text()
            .ok_or_else(|| anyhow::anyhow!("binary frame"))?;
        Ok(match serde_json::from_str::<Inbound>(text)? {
            Inbound::Partial { text, start, end } | Inbound::Final { text, start, end }
                if text.is_empty() =>
            {
                RawMessage::Info(format!("empty result {start}-{end}"))
            }
            Inbound::Partial { text, start, end } => RawMessage::Result {
                text,
                is_final: Some(false),
                pass: RecognitionPass::Streaming,
                start_ms: start,
                end_ms: end,
            },
            Inbound::Final { text, start, end } => RawMessage::Result {
                text,
                is_final: Some(true),
                pass: RecognitionPass::Streaming,
                start_ms: start,
                end_ms: end,
            },
            Inbound::Audio { data } => RawMessage::Audio(AudioPayload::Base64(data)),
            Inbound::End => RawMessage::End,
            Inbound::Error { message, fatal } => RawMessage::Error { message, fatal },
            Inbound::Ready | Inbound::Other => RawMessage::Info("ignored".into()),
        })
    }
}

pub fn audio_frame(pcm: &[u8]) -> Frame {
    Frame::text(json!({"type": "audio", "data": encode_base64(pcm)}).to_string())
}

pub fn final_frame(text: &str, start: u64, end: u64) -> Frame {
    Frame::text(json!({"type": "final", "text": text, "start": start, "end": end}).to_string())
}

pub fn end_frame() -> Frame {
    Frame::text(r#"{"type":"end"}"#)
}

pub fn error_frame(message: &str) -> Frame {
    Frame::text(json!({"type": "error", "message": message}).to_string())
}

pub struct Harness {
    pub session: StreamSession,
    pub notices: tokio::sync::mpsc::UnboundedReceiver<SessionNotice>,
    pub connector: MemoryConnector,
    pub acceptor: MemoryAcceptor,
    pub peer: MemoryPeer,
}

impl Harness {
    pub async fn open(config: EngineConfig) -> Self {
        let (connector, mut acceptor) = MemoryConnector::new();
        let (session, notices) = StreamSession::open(
            config,
            Arc::new(LabProtocol::immediate()),
            Arc::new(connector.clone()),
        )
        .await
        .unwrap();
        let mut peer = acceptor.accept().await.unwrap();
        assert_eq!(peer.recv().await.unwrap().as_text(), Some(r#"{"type":"setup"}"#));
        Self {
            session,
            notices,
            connector,
            acceptor,
            peer,
        }
    }

    /// Closes the session and returns every notice it produced.
    pub async fn finish(mut self) -> Vec<SessionNotice> {
        self.session.close().await;
        drop(self.session);
        let mut notices = Vec::new();
        while let Some(notice) = self.notices.recv().await {
            notices.push(notice);
        }
        notices
    }
}
