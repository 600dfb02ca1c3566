/// Which way a chunk of audio travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

/// Optional sink for raw audio, e.g. a PCM dumper.
///
/// Called inline from the session driver, so implementations must not block.
/// Errors are logged by the engine and otherwise ignored.
#[cfg_attr(test, mockall::automock)]
pub trait Recorder: Send + Sync {
    fn record(&self, direction: Direction, request_id: &str, bytes: &[u8]) -> std::io::Result<()>;
}
