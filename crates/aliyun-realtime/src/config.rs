use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

pub const DEFAULT_WS_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/realtime";
pub const DEFAULT_MODEL: &str = "qwen-tts-realtime-latest";

/// Settings for the Aliyun realtime TTS websocket.
///
/// The API key never appears in `Debug` output.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AliyunTtsConfig {
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_key: SecretString,
    pub model: String,
    pub ws_url: String,
    pub voice: String,
    /// Response audio encoding requested from the server.
    pub format: String,
    pub sample_rate: u32,
    /// `server_commit` lets the server decide when to synthesize;
    /// `commit` waits for explicit commits.
    pub mode: String,
}

impl Default for AliyunTtsConfig {
    fn default() -> Self {
        Self {
            api_key: SecretString::from(String::new()),
            model: DEFAULT_MODEL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            voice: "longxiaochun".to_string(),
            format: "pcm".to_string(),
            sample_rate: 16_000,
            mode: "server_commit".to_string(),
        }
    }
}

impl Clone for AliyunTtsConfig {
    fn clone(&self) -> Self {
        Self {
            api_key: SecretString::from(self.api_key.expose_secret().to_string()),
            model: self.model.clone(),
            ws_url: self.ws_url.clone(),
            voice: self.voice.clone(),
            format: self.format.clone(),
            sample_rate: self.sample_rate,
            mode: self.mode.clone(),
        }
    }
}

impl AliyunTtsConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Address including the model query parameter.
    pub fn url(&self) -> String {
        format!("{}?model={}", self.ws_url, self.model)
    }

    /// A loggable one-line summary without the key.
    pub fn redacted(&self) -> String {
        format!(
            "model={} url={} voice={} format={} sample_rate={} mode={}",
            self.model, self.ws_url, self.voice, self.format, self.sample_rate, self.mode
        )
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}
