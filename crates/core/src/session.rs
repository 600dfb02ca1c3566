//! Connection lifecycle for one vendor session.
//!
//! `SessionMachine` exclusively owns the link. Every successful connect opens
//! a new generation and every inbound frame is tagged with the generation it
//! arrived on, so the driver can discard anything left over from a dead link.

use crate::{
    error::EngineError,
    protocol::{Negotiation, VendorProtocol},
    transport::{Connector, Frame, Link, LinkSink, LinkStream},
};
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Negotiating,
    Ready,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// An inbound frame and the generation whose link delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub generation: u64,
    pub frame: Frame,
}

pub struct SessionMachine {
    protocol: Arc<dyn VendorProtocol>,
    connector: Arc<dyn Connector>,
    state: SessionState,
    generation: u64,
    sink: Option<Box<dyn LinkSink>>,
    stream: Option<Box<dyn LinkStream>>,
    connect_timeout: Duration,
    negotiation_timeout: Duration,
}

impl SessionMachine {
    pub fn new(
        protocol: Arc<dyn VendorProtocol>,
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            protocol,
            connector,
            state: SessionState::Idle,
            generation: 0,
            sink: None,
            stream: None,
            connect_timeout,
            negotiation_timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Generation of the current (or most recent) link. Zero before the
    /// first successful connect.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Opens a link, negotiates, and sends the protocol's setup frames.
    ///
    /// On failure the machine returns to the state it was called from and
    /// owns no link.
    pub async fn connect(&mut self) -> Result<u64, EngineError> {
        let prior = self.state;
        if !matches!(
            prior,
            SessionState::Idle | SessionState::Closed | SessionState::Connecting
        ) {
            return Err(EngineError::InvalidState(prior));
        }

        self.state = SessionState::Connecting;
        match self.open().await {
            Ok(link) => {
                self.generation += 1;
                self.sink = Some(link.sink);
                self.stream = Some(link.stream);
                self.state = SessionState::Ready;
                info!(
                    vendor = self.protocol.name(),
                    generation = self.generation,
                    "connected"
                );
                Ok(self.generation)
            }
            Err(e) => {
                self.state = prior;
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> Result<Link, EngineError> {
        let endpoint = self.protocol.endpoint();
        debug!(address = %endpoint.address, "opening link");
        let mut link = timeout(self.connect_timeout, self.connector.connect(&endpoint))
            .await
            .map_err(|_| {
                EngineError::Connect(format!("timed out after {:?}", self.connect_timeout))
            })??;

        self.state = SessionState::Negotiating;
        let protocol = Arc::clone(&self.protocol);
        if let Err(e) = negotiate(protocol.as_ref(), self.negotiation_timeout, &mut link).await {
            link.sink.close().await;
            return Err(e);
        }
        Ok(link)
    }

    /// Sends one frame. Never waits for a reply.
    pub async fn send(&mut self, frame: Frame) -> Result<(), EngineError> {
        if self.state != SessionState::Ready {
            return Err(EngineError::NotConnected);
        }
        let sink = self.sink.as_mut().ok_or(EngineError::NotConnected)?;
        sink.send(frame).await
    }

    /// Next inbound frame of the current generation.
    ///
    /// `None` means the link ended, or that there is no link to read from.
    /// Cancel safe.
    pub async fn receive(&mut self) -> Option<Result<Inbound, EngineError>> {
        let generation = self.generation;
        let stream = self.stream.as_mut()?;
        let next = stream.next_frame().await?;
        Some(next.map(|frame| Inbound { generation, frame }))
    }

    /// Drops a link that died underneath us. The reconnection policy takes
    /// over from `Connecting`.
    pub fn mark_lost(&mut self) {
        self.sink = None;
        self.stream = None;
        self.state = SessionState::Connecting;
    }

    /// Disposes of the link without a termination message. The next connect
    /// starts a new generation.
    pub async fn release(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.close().await;
        }
        self.stream = None;
        if self.state != SessionState::Closed {
            self.state = SessionState::Idle;
        }
    }

    /// Politely terminates and releases the link. Idempotent; transport
    /// errors are logged and swallowed.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_ready = self.state == SessionState::Ready;
        self.state = SessionState::Closing;

        if let Some(mut sink) = self.sink.take() {
            if was_ready {
                if let Some(message) = self.protocol.close_message() {
                    if let Err(e) = sink.send(message).await {
                        warn!(error = %e, "failed to send close message");
                    }
                }
            }
            sink.close().await;
        }
        self.stream = None;
        self.state = SessionState::Closed;
        debug!(generation = self.generation, "session closed");
    }
}

/// Waits for the vendor's greeting if the protocol expects one, then sends
/// the setup frames. Never borrows the machine, whose link halves are not
/// `Sync`.
async fn negotiate(
    protocol: &dyn VendorProtocol,
    negotiation_timeout: Duration,
    link: &mut Link,
) -> Result<(), EngineError> {
    if protocol.negotiation() == Negotiation::AwaitReady {
        let frame = match timeout(negotiation_timeout, link.stream.next_frame()).await {
            Err(_) => return Err(EngineError::NegotiationTimeout(negotiation_timeout)),
            Ok(None) => return Err(EngineError::Link("closed during negotiation".into())),
            Ok(Some(Err(e))) => return Err(e),
            Ok(Some(Ok(frame))) => frame,
        };
        protocol
            .accept_negotiation(&frame)
            .map_err(|e| EngineError::UnexpectedMessage(format!("{e:#}")))?;
    }

    for frame in protocol.setup_frames() {
        link.sink.send(frame).await?;
    }
    Ok(())
}
