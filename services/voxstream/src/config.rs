use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use tracing::Level;
use voxstream_aliyun::AliyunTtsConfig;
use voxstream_core::{EngineConfig, reconnect::ReconnectConfig};
use voxstream_funasr::{FunAsrConfig, RecognitionMode};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub funasr: FunAsrConfig,
    pub aliyun: AliyunTtsConfig,
    /// When set, every request's audio is dumped under this directory.
    pub dump_path: Option<PathBuf>,
    pub max_reconnects: u32,
    pub log_level: Level,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
        })
        .transpose()
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let mut funasr = FunAsrConfig::default();
        if let Some(url) = var("FUNASR_URL") {
            funasr.ws_url = url;
        }
        if let Some(mode) = parse_var::<RecognitionMode>("FUNASR_MODE")? {
            funasr.mode = mode;
        }
        if let Some(hotwords) = var("FUNASR_HOTWORDS") {
            funasr.hotwords = hotwords;
        }
        if let Some(rate) = parse_var::<u32>("FUNASR_SAMPLE_RATE")? {
            funasr.sample_rate = rate;
        }

        let mut aliyun = AliyunTtsConfig::default();
        if let Some(key) = var("ALIYUN_API_KEY") {
            aliyun.api_key = SecretString::from(key);
        }
        if let Some(model) = var("ALIYUN_MODEL") {
            aliyun.model = model;
        }
        if let Some(url) = var("ALIYUN_WS_URL") {
            aliyun.ws_url = url;
        }
        if let Some(voice) = var("ALIYUN_VOICE") {
            aliyun.voice = voice;
        }
        if let Some(rate) = parse_var::<u32>("ALIYUN_SAMPLE_RATE")? {
            aliyun.sample_rate = rate;
        }

        let dump_path = var("VOXSTREAM_DUMP_PATH").map(PathBuf::from);

        let max_reconnects = parse_var::<u32>("VOXSTREAM_MAX_RECONNECTS")?
            .unwrap_or(ReconnectConfig::default().max_attempts);
        if max_reconnects == 0 {
            return Err(ConfigError::InvalidValue(
                "VOXSTREAM_MAX_RECONNECTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            funasr,
            aliyun,
            dump_path,
            max_reconnects,
            log_level,
        })
    }

    /// The Aliyun settings, provided an API key was configured.
    pub fn require_aliyun(&self) -> Result<&AliyunTtsConfig, ConfigError> {
        if self.aliyun.api_key.expose_secret().is_empty() {
            return Err(ConfigError::MissingVar(
                "ALIYUN_API_KEY must be set for synthesis".to_string(),
            ));
        }
        Ok(&self.aliyun)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default().with_max_reconnect_attempts(self.max_reconnects)
    }
}
