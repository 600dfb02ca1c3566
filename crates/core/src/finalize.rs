//! Finalize/flush handshake bookkeeping.

use crate::{error::EngineError, event::FinalizeComplete};
use tokio::{sync::oneshot, time::Instant};

/// The single outstanding finalize, if any.
struct Outstanding {
    issued_at: Instant,
    waiter: Option<oneshot::Sender<FinalizeComplete>>,
}

/// Tracks at most one outstanding finalize per session.
#[derive(Default)]
pub struct FinalizeCoordinator {
    outstanding: Option<Outstanding>,
}

impl FinalizeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new finalize. A second one while the first is outstanding is
    /// rejected, not queued.
    pub fn begin(
        &mut self,
        waiter: Option<oneshot::Sender<FinalizeComplete>>,
    ) -> Result<(), EngineError> {
        if self.outstanding.is_some() {
            return Err(EngineError::AlreadyFinalizing);
        }
        self.outstanding = Some(Outstanding {
            issued_at: Instant::now(),
            waiter,
        });
        Ok(())
    }

    pub fn is_awaiting(&self) -> bool {
        self.outstanding.is_some()
    }

    /// The vendor acknowledged the finalize.
    pub fn complete(&mut self) -> Option<FinalizeComplete> {
        self.settle(false)
    }

    /// The link dropped, the session closed, or the ack never came.
    pub fn interrupt(&mut self) -> Option<FinalizeComplete> {
        self.settle(true)
    }

    fn settle(&mut self, interrupted: bool) -> Option<FinalizeComplete> {
        let outstanding = self.outstanding.take()?;
        let result = FinalizeComplete {
            latency: outstanding.issued_at.elapsed(),
            interrupted,
        };
        if let Some(waiter) = outstanding.waiter {
            // The caller may have stopped waiting.
            let _ = waiter.send(result);
        }
        Some(result)
    }
}
