use serde::Deserialize;
use std::fmt;

/// Recognition mode negotiated with the FunASR server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RecognitionMode {
    #[serde(rename = "offline")]
    Offline,
    #[serde(rename = "online")]
    Online,
    /// Fast interim results plus an authoritative offline pass.
    #[default]
    #[serde(rename = "2pass")]
    TwoPass,
}

impl RecognitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionMode::Offline => "offline",
            RecognitionMode::Online => "online",
            RecognitionMode::TwoPass => "2pass",
        }
    }
}

impl fmt::Display for RecognitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecognitionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(RecognitionMode::Offline),
            "online" => Ok(RecognitionMode::Online),
            "2pass" => Ok(RecognitionMode::TwoPass),
            other => Err(format!("unknown FunASR mode: {other}")),
        }
    }
}

/// Connection and recognition settings for a FunASR server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FunAsrConfig {
    pub ws_url: String,
    pub language: String,
    pub model: String,
    pub mode: RecognitionMode,
    /// Space separated hotwords, sent verbatim.
    pub hotwords: String,
    pub sample_rate: u32,
    pub chunk_size: [u32; 3],
    /// Milliseconds between audio chunks, as the server expects them.
    pub chunk_interval: u32,
}

impl Default for FunAsrConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://host.docker.internal:10095".to_string(),
            language: "zh-CN".to_string(),
            model: "paraformer-zh".to_string(),
            mode: RecognitionMode::TwoPass,
            hotwords: String::new(),
            sample_rate: 16_000,
            chunk_size: [5, 10, 5],
            chunk_interval: 10,
        }
    }
}

impl FunAsrConfig {
    /// Parses a JSON property blob; missing fields keep their defaults.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
