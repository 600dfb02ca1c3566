//! The DashScope realtime TTS websocket protocol.

use crate::config::AliyunTtsConfig;
use anyhow::{Result, bail};
use secrecy::ExposeSecret;
use tracing::debug;
use voxstream_core::{
    Negotiation, Payload, VendorProtocol,
    audio::AudioFormat,
    normalizer::{AudioPayload, RawMessage},
    transport::{Endpoint, Frame},
};

// --- Local DashScope wire types ---
mod dashscope_types {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Debug)]
    #[serde(tag = "type")]
    pub(super) enum ClientEvent<'a> {
        #[serde(rename = "session.update")]
        SessionUpdate { session: SessionConfig<'a> },
        #[serde(rename = "input_text_buffer.append")]
        Append { text: &'a str },
        #[serde(rename = "input_text_buffer.commit")]
        Commit,
        #[serde(rename = "session.finish")]
        Finish,
    }

    #[derive(Serialize, Debug)]
    pub(super) struct SessionConfig<'a> {
        pub voice: &'a str,
        pub response_format: &'a str,
        pub sample_rate: u32,
        pub mode: &'a str,
    }

    #[derive(Deserialize, Debug)]
    #[serde(tag = "type")]
    pub(super) enum ServerEvent {
        #[serde(rename = "session.created")]
        SessionCreated,
        #[serde(rename = "response.audio.delta")]
        AudioDelta {
            #[serde(default)]
            delta: String,
        },
        #[serde(rename = "response.done")]
        ResponseDone,
        #[serde(rename = "error")]
        Error {
            #[serde(default)]
            error: Option<ErrorBody>,
        },
        #[serde(other)]
        Other,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ErrorBody {
        pub message: Option<String>,
    }
}

use dashscope_types::{ClientEvent, ServerEvent, SessionConfig};

pub struct AliyunTtsProtocol {
    config: AliyunTtsConfig,
}

impl AliyunTtsProtocol {
    pub fn new(config: AliyunTtsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AliyunTtsConfig {
        &self.config
    }

    fn frame(event: &ClientEvent<'_>) -> Result<Frame> {
        Ok(Frame::Text(serde_json::to_string(event)?))
    }
}

impl VendorProtocol for AliyunTtsProtocol {
    fn name(&self) -> &str {
        "aliyun"
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.config.url()).with_header(
            "Authorization",
            format!("Bearer {}", self.config.api_key.expose_secret()),
        )
    }

    fn audio_format(&self) -> AudioFormat {
        AudioFormat::pcm16_mono(self.config.sample_rate)
    }

    fn negotiation(&self) -> Negotiation {
        Negotiation::AwaitReady
    }

    fn accept_negotiation(&self, frame: &Frame) -> Result<()> {
        let Some(text) = frame.as_text() else {
            bail!("expected session.created, got a binary frame");
        };
        let value: serde_json::Value = serde_json::from_str(text)?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("session.created") => Ok(()),
            Some(other) => bail!("unexpected event {other}, expected session.created"),
            None => bail!("untyped event, expected session.created"),
        }
    }

    fn setup_frames(&self) -> Vec<Frame> {
        let update = ClientEvent::SessionUpdate {
            session: SessionConfig {
                voice: &self.config.voice,
                response_format: &self.config.format,
                sample_rate: self.config.sample_rate,
                mode: &self.config.mode,
            },
        };
        match Self::frame(&update) {
            Ok(frame) => vec![frame],
            Err(e) => {
                debug!(error = %e, "failed to encode session.update");
                Vec::new()
            }
        }
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<Frame>> {
        match payload {
            Payload::Text(text) => Ok(vec![
                Self::frame(&ClientEvent::Append { text })?,
                Self::frame(&ClientEvent::Commit)?,
            ]),
            Payload::Audio(_) => bail!("Aliyun TTS only accepts text"),
        }
    }

    fn finalize_message(&self) -> Frame {
        Frame::text(r#"{"type":"input_text_buffer.commit"}"#)
    }

    fn close_message(&self) -> Option<Frame> {
        Some(Frame::text(r#"{"type":"session.finish"}"#))
    }

    fn parse(&self, frame: &Frame) -> Result<RawMessage> {
        let Some(text) = frame.as_text() else {
            return Ok(RawMessage::Info("binary frame".into()));
        };
        let event: ServerEvent = serde_json::from_str(text)?;
        Ok(match event {
            ServerEvent::AudioDelta { delta } => RawMessage::Audio(AudioPayload::Base64(delta)),
            ServerEvent::ResponseDone => RawMessage::End,
            ServerEvent::Error { error } => RawMessage::Error {
                message: error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "Unknown error".to_string()),
                fatal: false,
            },
            ServerEvent::SessionCreated => RawMessage::Info("session.created".into()),
            ServerEvent::Other => RawMessage::Info("ignored event".into()),
        })
    }
}
