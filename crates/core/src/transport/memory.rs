//! In-process links.
//!
//! `MemoryConnector` plays the client side; every successful `connect` hands
//! the matching `MemoryPeer` to whoever holds the accept queue, which lets a
//! test act as the vendor. Refusals can be scripted to exercise reconnects.

use super::{Connector, Endpoint, Frame, Link, LinkSink, LinkStream};
use crate::error::EngineError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::{sync::mpsc, time::Instant};

#[derive(Debug, Default)]
struct ConnectorState {
    /// Remaining connect attempts to refuse.
    refusals: Option<u32>,
    refuse_forever: bool,
    attempts: Vec<(Instant, Endpoint)>,
}

/// Client side of an in-process link factory.
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Accept queue paired with a `MemoryConnector`.
pub struct MemoryAcceptor {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(ConnectorState::default())),
                accept_tx,
            },
            MemoryAcceptor { accept_rx },
        )
    }

    /// Refuses the next `n` connect attempts.
    pub fn refuse_next(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.refusals = Some(n);
            state.refuse_forever = false;
        }
    }

    /// Refuses every connect attempt until `accept_again` is called.
    pub fn refuse_all(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.refuse_forever = true;
        }
    }

    pub fn accept_again(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.refusals = None;
            state.refuse_forever = false;
        }
    }

    /// Instants of every connect attempt so far, refused ones included.
    pub fn attempts(&self) -> Vec<Instant> {
        self.state
            .lock()
            .map(|s| s.attempts.iter().map(|(at, _)| *at).collect())
            .unwrap_or_default()
    }

    /// Endpoint of the most recent connect attempt.
    pub fn last_endpoint(&self) -> Option<Endpoint> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.attempts.last().map(|(_, e)| e.clone()))
    }
}

impl MemoryAcceptor {
    /// Waits for the next successful connect.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, EngineError> {
        let refused = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| EngineError::Connect("connector state poisoned".into()))?;
            state.attempts.push((Instant::now(), endpoint.clone()));
            if state.refuse_forever {
                true
            } else {
                match state.refusals {
                    Some(n) if n > 0 => {
                        state.refusals = Some(n - 1);
                        true
                    }
                    _ => false,
                }
            }
        };
        if refused {
            return Err(EngineError::Connect(format!(
                "connection refused: {}",
                endpoint.address
            )));
        }

        let (client_tx, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, client_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            rx: peer_rx,
            tx: Some(peer_tx),
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| EngineError::Connect("no acceptor listening".into()))?;

        Ok(Link {
            sink: Box::new(MemorySink {
                tx: Some(client_tx),
            }),
            stream: Box::new(MemorySource { rx: client_rx }),
        })
    }
}

/// Remote end of an in-process link.
pub struct MemoryPeer {
    rx: mpsc::UnboundedReceiver<Frame>,
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

impl MemoryPeer {
    /// Next frame from the client; `None` once the client closed its half.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Sends a frame to the client. Returns false if the client is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(frame).is_ok())
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::Text(text.into()))
    }

    /// Drops the outbound half, which the client observes as link loss.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl LinkSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), EngineError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| EngineError::Send("link closed".into()))?;
        tx.send(frame)
            .map_err(|_| EngineError::Send("peer went away".into()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl LinkStream for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<Frame, EngineError>> {
        self.rx.recv().await.map(Ok)
    }
}
