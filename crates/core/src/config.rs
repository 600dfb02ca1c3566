use crate::reconnect::ReconnectConfig;
use std::time::Duration;

/// Tunables for one streaming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub connect_timeout: Duration,
    /// How long to wait for the vendor's session-ready message.
    pub negotiation_timeout: Duration,
    /// Longest silence tolerated from the vendor while a request is active.
    pub receive_timeout: Duration,
    /// Time allowed for the best-effort flush when a request is cancelled.
    pub cancel_grace: Duration,
    /// An unacknowledged finalize completes as interrupted after this.
    pub finalize_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Upper bound on audio held while the link is down.
    pub backlog_byte_limit: usize,
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_millis(100),
            finalize_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            backlog_byte_limit: 10 * 1024 * 1024,
            command_buffer: 128,
        }
    }
}

impl EngineConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    pub fn with_backlog_byte_limit(mut self, limit: usize) -> Self {
        self.backlog_byte_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.negotiation_timeout, Duration::from_secs(10));
        assert_eq!(config.receive_timeout, Duration::from_secs(30));
        assert_eq!(config.cancel_grace, Duration::from_millis(100));
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(300));
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_receive_timeout(Duration::from_secs(5))
            .with_max_reconnect_attempts(2)
            .with_backlog_byte_limit(64);
        assert_eq!(config.receive_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.backlog_byte_limit, 64);
    }
}
