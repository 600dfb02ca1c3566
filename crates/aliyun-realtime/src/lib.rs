//! Aliyun DashScope realtime text-to-speech for voxstream sessions.

pub mod config;
pub mod protocol;

pub use config::AliyunTtsConfig;
pub use protocol::AliyunTtsProtocol;
