//! FunASR realtime recognition for voxstream sessions.

pub mod config;
pub mod protocol;

pub use config::{FunAsrConfig, RecognitionMode};
pub use protocol::FunAsrProtocol;
