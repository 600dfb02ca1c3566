//! The FunASR websocket protocol.
//!
//! The server needs no handshake: the client opens the socket, sends one JSON
//! configuration message and then streams raw PCM as binary frames. Results
//! come back as JSON text frames. `{"is_speaking": false}` asks the server to
//! flush and emit the final result for the audio received so far.

use crate::config::FunAsrConfig;
use anyhow::{Result, bail};
use serde_json::Value;
use tracing::debug;
use voxstream_core::{
    CanonicalEvent, Payload, VendorProtocol,
    audio::AudioFormat,
    normalizer::{RawMessage, RecognitionPass},
    transport::{Endpoint, Frame},
};

// --- Local FunASR wire types ---
mod funasr_types {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Serialize)]
    pub(super) struct StartMessage<'a> {
        pub mode: &'a str,
        pub chunk_size: [u32; 3],
        pub chunk_interval: u32,
        pub wav_name: &'a str,
        pub is_speaking: bool,
        pub audio_fs: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub hotwords: Option<&'a str>,
    }

    #[derive(Serialize)]
    pub(super) struct SpeakingMessage {
        pub is_speaking: bool,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ResultMessage {
        #[serde(default)]
        pub text: String,
        pub is_final: Option<bool>,
        pub timestamp: Option<Value>,
        #[serde(default)]
        pub mode: String,
    }
}

pub struct FunAsrProtocol {
    config: FunAsrConfig,
}

impl FunAsrProtocol {
    pub fn new(config: FunAsrConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FunAsrConfig {
        &self.config
    }
}

impl VendorProtocol for FunAsrProtocol {
    fn name(&self) -> &str {
        "funasr"
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.config.ws_url.clone())
    }

    fn audio_format(&self) -> AudioFormat {
        AudioFormat::pcm16_mono(self.config.sample_rate)
    }

    fn setup_frames(&self) -> Vec<Frame> {
        let hotwords = self.config.hotwords.trim();
        let start = funasr_types::StartMessage {
            mode: self.config.mode.as_str(),
            chunk_size: self.config.chunk_size,
            chunk_interval: self.config.chunk_interval,
            wav_name: "voxstream",
            is_speaking: true,
            audio_fs: self.config.sample_rate,
            hotwords: (!hotwords.is_empty()).then_some(hotwords),
        };
        match serde_json::to_string(&start) {
            Ok(text) => vec![Frame::Text(text)],
            Err(e) => {
                debug!(error = %e, "failed to encode FunASR start message");
                Vec::new()
            }
        }
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<Frame>> {
        match payload {
            Payload::Audio(pcm) => Ok(vec![Frame::Binary(pcm.clone())]),
            Payload::Text(_) => bail!("FunASR only accepts audio"),
        }
    }

    fn finalize_message(&self) -> Frame {
        let message = funasr_types::SpeakingMessage { is_speaking: false };
        Frame::Text(serde_json::to_string(&message).unwrap_or_else(|_| r#"{"is_speaking":false}"#.into()))
    }

    fn parse(&self, frame: &Frame) -> Result<RawMessage> {
        let Some(text) = frame.as_text() else {
            return Ok(RawMessage::Info("binary frame".into()));
        };
        let message: funasr_types::ResultMessage = serde_json::from_str(text)?;
        if message.text.trim().is_empty() {
            return Ok(RawMessage::Info("empty result".into()));
        }

        let pass = if message.mode.contains("offline") {
            RecognitionPass::Offline
        } else {
            RecognitionPass::Online
        };
        let (start_ms, end_ms) = message
            .timestamp
            .as_ref()
            .map(parse_timestamp)
            .unwrap_or((0, 0));
        Ok(RawMessage::Result {
            text: message.text,
            is_final: message.is_final,
            pass,
            start_ms,
            end_ms,
        })
    }

    /// FunASR never sends a stream end; the final result answers a flush.
    fn is_finalize_ack(&self, event: &CanonicalEvent) -> bool {
        matches!(
            event,
            CanonicalEvent::FinalResult { .. } | CanonicalEvent::StreamEnd
        )
    }
}

/// Extracts the covered span from a FunASR timestamp field.
///
/// Accepts `[start, end]`, a list of per-token `[start, end]` pairs, or a
/// string holding either. Anything else yields `(0, 0)`.
fn parse_timestamp(value: &Value) -> (u64, u64) {
    fn ms(v: &Value) -> Option<u64> {
        v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64))
    }

    match value {
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map(|inner| match inner {
                Value::String(_) => (0, 0),
                other => parse_timestamp(&other),
            })
            .unwrap_or((0, 0)),
        Value::Array(items) => match items.as_slice() {
            [Value::Array(_), ..] => {
                let start = items.first().and_then(|p| p.get(0)).and_then(ms);
                let end = items.last().and_then(|p| p.get(1)).and_then(ms);
                (start.unwrap_or(0), end.unwrap_or(0))
            }
            [start, end, ..] => (ms(start).unwrap_or(0), ms(end).unwrap_or(0)),
            _ => (0, 0),
        },
        _ => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecognitionMode;
    use serde_json::json;
    use voxstream_core::normalizer::normalize;

    fn protocol() -> FunAsrProtocol {
        FunAsrProtocol::new(FunAsrConfig::default())
    }

    #[test]
    fn test_setup_frame() {
        let frames = FunAsrProtocol::new(FunAsrConfig {
            hotwords: " 魔搭 ".into(),
            ..FunAsrConfig::default()
        })
        .setup_frames();
        let value: Value = serde_json::from_str(frames[0].as_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "mode": "2pass",
                "chunk_size": [5, 10, 5],
                "chunk_interval": 10,
                "wav_name": "voxstream",
                "is_speaking": true,
                "audio_fs": 16000,
                "hotwords": "魔搭"
            })
        );

        let frames = FunAsrProtocol::new(FunAsrConfig {
            mode: RecognitionMode::Offline,
            ..FunAsrConfig::default()
        })
        .setup_frames();
        let value: Value = serde_json::from_str(frames[0].as_text().unwrap()).unwrap();
        assert_eq!(value["mode"], "offline");
        assert!(value.get("hotwords").is_none());
    }

    #[test]
    fn test_encode_and_finalize() {
        let protocol = protocol();
        assert_eq!(
            protocol.encode(&Payload::Audio(vec![1, 2])).unwrap(),
            vec![Frame::Binary(vec![1, 2])]
        );
        assert!(protocol.encode(&Payload::Text("hi".into())).is_err());
        assert_eq!(
            protocol.finalize_message(),
            Frame::text(r#"{"is_speaking":false}"#)
        );
        assert_eq!(protocol.close_message(), None);
    }

    #[test]
    fn test_online_result_is_partial() {
        let raw = protocol()
            .parse(&Frame::text(
                r#"{"text":"你好","mode":"2pass-online","timestamp":[100,400]}"#,
            ))
            .unwrap();
        assert_eq!(
            normalize(raw),
            Some(CanonicalEvent::PartialResult {
                text: "你好".into(),
                start_ms: 100,
                duration_ms: 300
            })
        );
    }

    #[test]
    fn test_offline_result_is_final() {
        let raw = protocol()
            .parse(&Frame::text(
                r#"{"text":"你好世界","mode":"2pass-offline","is_final":false,"timestamp":"[[100,250],[250,610]]"}"#,
            ))
            .unwrap();
        let event = normalize(raw).unwrap();
        assert_eq!(
            event,
            CanonicalEvent::FinalResult {
                text: "你好世界".into(),
                start_ms: 100,
                duration_ms: 510
            }
        );
        assert!(protocol().is_finalize_ack(&event));
    }

    #[test]
    fn test_explicit_final_flag() {
        let raw = protocol()
            .parse(&Frame::text(r#"{"text":"ok","mode":"online","is_final":true}"#))
            .unwrap();
        assert!(matches!(
            normalize(raw),
            Some(CanonicalEvent::FinalResult {
                start_ms: 0,
                duration_ms: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_info_and_garbage() {
        let protocol = protocol();
        assert!(matches!(
            protocol.parse(&Frame::text(r#"{"text":"","mode":"2pass-online"}"#)),
            Ok(RawMessage::Info(_))
        ));
        assert!(matches!(
            protocol.parse(&Frame::Binary(vec![0; 4])),
            Ok(RawMessage::Info(_))
        ));
        assert!(protocol.parse(&Frame::text("not json")).is_err());
    }

    #[test]
    fn test_timestamp_shapes() {
        assert_eq!(parse_timestamp(&json!([10, 20])), (10, 20));
        assert_eq!(parse_timestamp(&json!([10.9, 20.2])), (10, 20));
        assert_eq!(parse_timestamp(&json!([[0, 5], [5, 9], [9, 30]])), (0, 30));
        assert_eq!(parse_timestamp(&json!("[[40,60]]")), (40, 60));
        assert_eq!(parse_timestamp(&json!("garbage")), (0, 0));
        assert_eq!(parse_timestamp(&json!([7])), (0, 0));
        assert_eq!(parse_timestamp(&json!({"start": 1})), (0, 0));
    }
}
