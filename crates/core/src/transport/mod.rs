//! The transport link: an ordered, full-duplex frame channel.
//!
//! A connector opens a link and hands back its two halves separately so the
//! session driver can wait on inbound frames while it sends.

pub mod memory;
pub mod ws;

use crate::error::EngineError;
use async_trait::async_trait;

pub use memory::{MemoryConnector, MemoryPeer};
pub use ws::WsConnector;

/// One message on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn text(value: impl Into<String>) -> Self {
        Frame::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(t) => Some(t),
            Frame::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where and how to open a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub headers: Vec<(String, String)>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Outbound half of a link.
#[async_trait]
pub trait LinkSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), EngineError>;
    /// Closes the outbound half. Never fails; problems are only logged.
    async fn close(&mut self);
}

/// Inbound half of a link. `None` means the link has ended.
///
/// `next_frame` must be cancel safe: the driver races it against commands.
#[async_trait]
pub trait LinkStream: Send {
    async fn next_frame(&mut self) -> Option<Result<Frame, EngineError>>;
}

/// An open link, split into its halves.
pub struct Link {
    pub sink: Box<dyn LinkSink>,
    pub stream: Box<dyn LinkStream>,
}

/// Opens links. Shared by every generation of one session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, EngineError>;
}
