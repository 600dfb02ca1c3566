//! Request serialization.
//!
//! Synthesis requests take turns through `SynthesisGate`: the guard travels
//! with the request's event stream and is released once that stream is
//! exhausted or dropped. Recognition has no gate; payload submitted while the
//! link is down waits in `OutboundBacklog` and is re-sent, in order, once the
//! session is ready again.

use crate::protocol::Payload;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

/// One synthesis request at a time per session.
#[derive(Debug, Clone, Default)]
pub struct SynthesisGate {
    inner: Arc<Mutex<()>>,
}

pub type GatePass = OwnedMutexGuard<()>;

impl SynthesisGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other synthesis request holds the gate.
    pub async fn acquire(&self) -> GatePass {
        self.inner.clone().lock_owned().await
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingPayload {
    pub(crate) request_id: String,
    pub(crate) payload: Payload,
}

/// Payload waiting for the link, oldest first, bounded by total bytes.
#[derive(Debug)]
pub(crate) struct OutboundBacklog {
    entries: VecDeque<PendingPayload>,
    bytes: usize,
    limit: usize,
}

impl OutboundBacklog {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    /// Queues a unit at the back, dropping the oldest entries past the limit.
    ///
    /// The unit just queued is never dropped, so a single unit larger than
    /// the limit still goes out. The driver drains after every push while
    /// ready, which confines the cap to units waiting out a reconnect.
    pub(crate) fn push(&mut self, request_id: &str, payload: Payload) {
        self.bytes += payload.byte_len();
        self.entries.push_back(PendingPayload {
            request_id: request_id.to_string(),
            payload,
        });
        while self.bytes > self.limit && self.entries.len() > 1 {
            let Some(dropped) = self.entries.pop_front() else {
                break;
            };
            self.bytes -= dropped.payload.byte_len();
            warn!(
                request_id = %dropped.request_id,
                bytes = dropped.payload.byte_len(),
                "backlog full, dropping oldest unit"
            );
        }
    }

    /// Puts back a unit that failed to send so it goes out first next time.
    pub(crate) fn push_front(&mut self, pending: PendingPayload) {
        self.bytes += pending.payload.byte_len();
        self.entries.push_front(pending);
    }

    pub(crate) fn pop(&mut self) -> Option<PendingPayload> {
        let pending = self.entries.pop_front()?;
        self.bytes -= pending.payload.byte_len();
        Some(pending)
    }

    /// Drops every unit not attributed to `request_id`.
    pub(crate) fn retain_request(&mut self, request_id: Option<&str>) {
        self.entries
            .retain(|p| Some(p.request_id.as_str()) == request_id);
        self.bytes = self.entries.iter().map(|p| p.payload.byte_len()).sum();
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }
}
