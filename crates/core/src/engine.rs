//! The caller-facing session handle and the task that drives it.
//!
//! `StreamSession::open` connects, then hands the `SessionMachine` to a
//! driver task that owns every piece of mutable session state: the link, the
//! active request and its timeline, the finalize handle, the reconnect
//! policy and the outbound backlog. Callers talk to it over a bounded command
//! channel and read each request's events from its own `EventStream`.

use crate::{
    audio::AudioFormat,
    config::EngineConfig,
    error::EngineError,
    event::{CanonicalEvent, FinalizeComplete, SessionNotice},
    finalize::FinalizeCoordinator,
    normalizer::normalize,
    protocol::{Payload, VendorProtocol},
    reconnect::ReconnectPolicy,
    recorder::{Direction, Recorder},
    request::{ActiveRequest, RequestSnapshot, StreamingRequest},
    serializer::{GatePass, OutboundBacklog, SynthesisGate},
    session::{Inbound, SessionMachine, SessionState},
    transport::Connector,
};
use futures::Stream;
use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, sleep, sleep_until, timeout},
};
use tracing::{Instrument, debug, error, info, info_span, warn};

enum Command {
    Submit {
        request: StreamingRequest,
        payload: Payload,
        reply: oneshot::Sender<Accepted>,
    },
    Finalize {
        reply: oneshot::Sender<Result<oneshot::Receiver<FinalizeComplete>, EngineError>>,
    },
    /// `seq` pins the cancel to one started request; without it any
    /// unfinished request with this id is cancelled.
    Cancel {
        request_id: String,
        seq: Option<u64>,
        reply: Option<oneshot::Sender<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Option<RequestSnapshot>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum Accepted {
    Started {
        seq: u64,
        events: mpsc::UnboundedReceiver<CanonicalEvent>,
    },
    Appended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: SessionState,
    generation: u64,
}

/// Result of submitting a payload.
#[derive(Debug)]
pub enum Submission {
    /// The payload opened a new request; its events arrive on the stream.
    Started(EventStream),
    /// The payload was appended to the request that is already streaming.
    Appended,
}

impl Submission {
    pub fn into_stream(self) -> Option<EventStream> {
        match self {
            Submission::Started(stream) => Some(stream),
            Submission::Appended => None,
        }
    }
}

/// Handle to one realtime streaming session.
///
/// Cloning is cheap; the session closes when `close` is called or when the
/// last handle and the last event stream are dropped.
#[derive(Clone)]
pub struct StreamSession {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<Status>,
    gate: SynthesisGate,
}

impl StreamSession {
    /// Connects and starts the session driver.
    ///
    /// Retryable connect failures are retried with the configured backoff;
    /// negotiation failures are returned immediately.
    pub async fn open(
        config: EngineConfig,
        protocol: Arc<dyn VendorProtocol>,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionNotice>), EngineError> {
        Self::open_with_recorder(config, protocol, connector, None).await
    }

    pub async fn open_with_recorder(
        config: EngineConfig,
        protocol: Arc<dyn VendorProtocol>,
        connector: Arc<dyn Connector>,
        recorder: Option<Arc<dyn Recorder>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionNotice>), EngineError> {
        let mut machine = SessionMachine::new(
            protocol.clone(),
            connector,
            config.connect_timeout,
            config.negotiation_timeout,
        );
        let mut policy = ReconnectPolicy::new(config.reconnect);
        let generation = loop {
            match machine.connect().await {
                Ok(generation) => break generation,
                Err(e) if e.is_retryable() => match policy.next_delay() {
                    Some(delay) => {
                        warn!(
                            vendor = protocol.name(),
                            attempt = policy.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "initial connect failed, retrying"
                        );
                        sleep(delay).await;
                    }
                    None => {
                        return Err(EngineError::ReconnectExhausted {
                            attempts: policy.attempts(),
                            last_error: e.to_string(),
                        });
                    }
                },
                Err(e) => return Err(e),
            }
        };
        policy.reset();

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status {
            state: machine.state(),
            generation,
        });
        let _ = notice_tx.send(SessionNotice::Connected { generation });

        let span = info_span!("stream_session", vendor = %protocol.name());
        let driver = Driver {
            format: protocol.audio_format(),
            protocol,
            machine,
            policy,
            finalize: FinalizeCoordinator::new(),
            backlog: OutboundBacklog::new(config.backlog_byte_limit),
            current: None,
            next_seq: 0,
            recorder,
            commands: command_rx,
            notices: notice_tx,
            status: status_tx,
            reconnect_at: None,
            receive_deadline: None,
            finalize_deadline: None,
            closed: false,
            config,
        };
        tokio::spawn(driver.run().instrument(span));

        Ok((
            Self {
                commands: command_tx,
                status: status_rx,
                gate: SynthesisGate::new(),
            },
            notice_rx,
        ))
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn generation(&self) -> u64 {
        self.status.borrow().generation
    }

    /// Pushes one unit of payload for `request`.
    ///
    /// A new request id opens a new event stream, replacing any unfinished
    /// request. The same id while that request is unfinished appends.
    pub async fn submit(
        &self,
        request: StreamingRequest,
        payload: Payload,
    ) -> Result<Submission, EngineError> {
        let request_id = request.request_id.clone();
        let (reply, rx) = oneshot::channel();
        let accepted = self
            .call(
                Command::Submit {
                    request,
                    payload,
                    reply,
                },
                rx,
            )
            .await?;
        Ok(match accepted {
            Accepted::Started { seq, events } => Submission::Started(EventStream::new(
                request_id,
                Some(seq),
                events,
                self.commands.clone(),
                None,
            )),
            Accepted::Appended => Submission::Appended,
        })
    }

    /// Streams a chunk of recognition audio.
    pub async fn send_audio(
        &self,
        request: StreamingRequest,
        pcm: Vec<u8>,
    ) -> Result<Submission, EngineError> {
        self.submit(request, Payload::Audio(pcm)).await
    }

    /// Synthesizes `text`, waiting for any earlier synthesis on this session
    /// to finish first.
    pub async fn synthesize(
        &self,
        request: StreamingRequest,
        text: impl Into<String>,
    ) -> Result<EventStream, EngineError> {
        let text = text.into();
        let pass = self.gate.acquire().await;

        if text.is_empty() {
            debug!(request_id = %request.request_id, "empty synthesis text");
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(CanonicalEvent::StreamEnd);
            return Ok(EventStream::new(
                request.request_id,
                None,
                rx,
                self.commands.clone(),
                Some(pass),
            ));
        }

        let request_id = request.request_id.clone();
        match self.submit(request, Payload::Text(text)).await? {
            Submission::Started(mut stream) => {
                stream.pass = Some(pass);
                Ok(stream)
            }
            Submission::Appended => Err(EngineError::DuplicateRequest(request_id)),
        }
    }

    /// Sends the vendor's finalize/flush message.
    ///
    /// Returns once the message is on the wire; the ticket resolves when the
    /// vendor acknowledges it, the link drops, or the finalize times out.
    pub async fn finalize(&self) -> Result<FinalizeTicket, EngineError> {
        let (reply, rx) = oneshot::channel();
        let completion = self.call(Command::Finalize { reply }, rx).await??;
        Ok(FinalizeTicket { completion })
    }

    /// Cancels the request if it is still streaming. Unknown ids are ignored.
    pub async fn cancel(&self, request_id: &str) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Command::Cancel {
                request_id: request_id.to_string(),
                seq: None,
                reply: Some(reply),
            },
            rx,
        )
        .await
    }

    pub async fn request_snapshot(&self) -> Result<Option<RequestSnapshot>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Snapshot { reply }, rx).await
    }

    /// Closes the session. Idempotent.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.call(Command::Close { reply }, rx).await;
    }

    async fn call<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Closed)?;
        reply.await.map_err(|_| EngineError::Closed)
    }
}

/// Resolves when an issued finalize completes.
#[derive(Debug)]
pub struct FinalizeTicket {
    completion: oneshot::Receiver<FinalizeComplete>,
}

impl FinalizeTicket {
    pub async fn wait(self) -> FinalizeComplete {
        self.completion.await.unwrap_or(FinalizeComplete {
            latency: Duration::ZERO,
            interrupted: true,
        })
    }
}

/// The events of one request, in wire order.
///
/// Ends after the first terminal event. Dropping the stream before that
/// cancels the request it was started for, never a later request that
/// reuses the id.
pub struct EventStream {
    request_id: String,
    /// Driver sequence number; `None` when the driver never saw the request.
    seq: Option<u64>,
    events: mpsc::UnboundedReceiver<CanonicalEvent>,
    commands: mpsc::Sender<Command>,
    pass: Option<GatePass>,
    terminated: bool,
}

impl EventStream {
    fn new(
        request_id: String,
        seq: Option<u64>,
        events: mpsc::UnboundedReceiver<CanonicalEvent>,
        commands: mpsc::Sender<Command>,
        pass: Option<GatePass>,
    ) -> Self {
        Self {
            request_id,
            seq,
            events,
            commands,
            pass,
            terminated: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    fn finish(&mut self) {
        self.terminated = true;
        self.pass = None;
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("request_id", &self.request_id)
            .field("seq", &self.seq)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl Stream for EventStream {
    type Item = CanonicalEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match self.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finish();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let Some(seq) = self.seq.filter(|_| !self.terminated) else {
            return;
        };
        let cancel = Command::Cancel {
            request_id: std::mem::take(&mut self.request_id),
            seq: Some(seq),
            reply: None,
        };
        if let Err(e) = self.commands.try_send(cancel) {
            debug!(seq, error = %e, "could not cancel dropped request");
        }
    }
}

struct Current {
    seq: u64,
    active: ActiveRequest,
    events: mpsc::UnboundedSender<CanonicalEvent>,
}

struct Driver {
    config: EngineConfig,
    protocol: Arc<dyn VendorProtocol>,
    format: AudioFormat,
    machine: SessionMachine,
    policy: ReconnectPolicy,
    finalize: FinalizeCoordinator,
    backlog: OutboundBacklog,
    current: Option<Current>,
    next_seq: u64,
    recorder: Option<Arc<dyn Recorder>>,
    commands: mpsc::Receiver<Command>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    status: watch::Sender<Status>,
    reconnect_at: Option<Instant>,
    receive_deadline: Option<Instant>,
    finalize_deadline: Option<Instant>,
    closed: bool,
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

impl Driver {
    async fn run(mut self) {
        while !self.closed {
            let ready = self.machine.is_ready();
            let reconnect_at = self.reconnect_at;
            let receive_deadline = self.receive_deadline;
            let finalize_deadline = self.finalize_deadline;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => self.shut_down(None).await,
                },
                inbound = self.machine.receive(), if ready => match inbound {
                    Some(Ok(inbound)) => self.on_inbound(inbound),
                    Some(Err(e)) => self.on_link_lost(e.to_string()).await,
                    None => self.on_link_lost("link closed by peer".to_string()).await,
                },
                _ = sleep_until(reconnect_at.unwrap_or_else(far_future)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.attempt_reconnect().await;
                }
                _ = sleep_until(receive_deadline.unwrap_or_else(far_future)), if receive_deadline.is_some() => {
                    self.receive_deadline = None;
                    self.on_receive_timeout();
                }
                _ = sleep_until(finalize_deadline.unwrap_or_else(far_future)), if finalize_deadline.is_some() => {
                    warn!("finalize was never acknowledged");
                    let result = self.finalize.interrupt();
                    self.settle_finalize(result);
                }
            }
            self.publish();
        }
        debug!("session driver stopped");
    }

    fn publish(&self) {
        self.status.send_replace(Status {
            state: self.machine.state(),
            generation: self.machine.generation(),
        });
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    /// Replies go out after `publish`, so a caller that awaited a command
    /// observes its effect on `state()`.
    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                request,
                payload,
                reply,
            } => {
                let accepted = self.submit(request, payload).await;
                self.publish();
                let _ = reply.send(accepted);
            }
            Command::Finalize { reply } => {
                let result = self.begin_finalize().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Cancel {
                request_id,
                seq,
                reply,
            } => {
                self.cancel(&request_id, seq).await;
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.current.as_ref().map(|c| c.active.snapshot()));
            }
            Command::Close { reply } => {
                self.shut_down(None).await;
                let _ = reply.send(());
            }
        }
    }

    async fn submit(&mut self, request: StreamingRequest, payload: Payload) -> Accepted {
        let appending = self
            .current
            .as_ref()
            .is_some_and(|c| !c.active.finished && c.active.id() == request.request_id);

        let accepted = if appending {
            Accepted::Appended
        } else {
            if let Some(previous) = self.current.as_mut().filter(|c| !c.active.finished) {
                info!(
                    request_id = %previous.active.id(),
                    replaced_by = %request.request_id,
                    "request superseded"
                );
                let _ = previous.events.send(CanonicalEvent::error(
                    format!("request superseded by {}", request.request_id),
                    false,
                ));
                previous.active.finished = true;
            }
            debug!(request_id = %request.request_id, turn_id = request.turn_id, "request started");
            self.backlog.retain_request(Some(&request.request_id));
            let (tx, rx) = mpsc::unbounded_channel();
            self.next_seq += 1;
            self.current = Some(Current {
                seq: self.next_seq,
                active: ActiveRequest::new(request.clone()),
                events: tx,
            });
            // Armed at start, then pushed back only by inbound events.
            self.touch_receive_deadline();
            Accepted::Started {
                seq: self.next_seq,
                events: rx,
            }
        };

        if !payload.is_empty() {
            self.backlog.push(&request.request_id, payload);
        }
        self.ensure_link().await;
        self.drain_backlog().await;
        accepted
    }

    /// Reconnects on demand after a cancellation released the link.
    async fn ensure_link(&mut self) {
        if self.machine.state() != SessionState::Idle {
            return;
        }
        match self.machine.connect().await {
            Ok(generation) => self.on_connected(generation),
            Err(e) if e.is_retryable() => {
                self.machine.mark_lost();
                self.schedule_reconnect(e.to_string()).await;
            }
            Err(e) => self.shut_down(Some(e)).await,
        }
    }

    fn on_connected(&mut self, generation: u64) {
        self.policy.reset();
        if let Some(current) = self.current.as_mut() {
            current.active.timeline.on_reconnect();
        }
        self.notify(SessionNotice::Reconnected { generation });
    }

    /// Sends queued payload in order while the link is ready.
    async fn drain_backlog(&mut self) {
        while self.machine.is_ready() {
            let Some(pending) = self.backlog.pop() else {
                return;
            };
            let live = self
                .current
                .as_ref()
                .is_some_and(|c| !c.active.finished && c.active.id() == pending.request_id);
            if !live {
                debug!(request_id = %pending.request_id, "discarding payload of inactive request");
                continue;
            }

            let frames = match self.protocol.encode(&pending.payload) {
                Ok(frames) => frames,
                Err(e) => {
                    self.deliver(CanonicalEvent::error(
                        EngineError::Protocol(format!("{e:#}")).to_string(),
                        false,
                    ));
                    continue;
                }
            };
            for frame in frames {
                if let Err(e) = self.machine.send(frame).await {
                    self.backlog.push_front(pending);
                    self.on_link_lost(e.to_string()).await;
                    return;
                }
            }
            self.record_sent(&pending.request_id, &pending.payload);
        }
    }

    fn record_sent(&mut self, request_id: &str, payload: &Payload) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.active.units_sent += payload.len();
        if let Payload::Audio(bytes) = payload {
            current.active.timeline.record_bytes(bytes.len(), &self.format);
            if let Some(recorder) = &self.recorder {
                if let Err(e) = recorder.record(Direction::Sent, request_id, bytes) {
                    debug!(error = %e, "recorder failed");
                }
            }
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        if inbound.generation != self.machine.generation() {
            debug!(generation = inbound.generation, "dropping frame from a stale generation");
            return;
        }
        let raw = match self.protocol.parse(&inbound.frame) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %format!("{e:#}"), len = inbound.frame.len(), "unparseable frame");
                return;
            }
        };
        let Some(event) = normalize(raw) else {
            return;
        };
        let event = self.rebase(event);

        if let CanonicalEvent::AudioChunk { bytes } = &event {
            if let (Some(recorder), Some(current)) = (&self.recorder, &self.current) {
                if let Err(e) = recorder.record(Direction::Received, current.active.id(), bytes) {
                    debug!(error = %e, "recorder failed");
                }
            }
        }
        // The acknowledging event reaches the request before the waiter wakes.
        let ack = self.finalize.is_awaiting() && self.protocol.is_finalize_ack(&event);
        self.deliver(event);
        if ack {
            let result = self.finalize.complete();
            self.settle_finalize(result);
        }
    }

    /// Maps vendor result timestamps onto the request's own timeline.
    fn rebase(&self, event: CanonicalEvent) -> CanonicalEvent {
        let Some(current) = &self.current else {
            return event;
        };
        let timeline = &current.active.timeline;
        match event {
            CanonicalEvent::PartialResult {
                text,
                start_ms,
                duration_ms,
            } => CanonicalEvent::PartialResult {
                text,
                start_ms: timeline.absolute_time(start_ms),
                duration_ms,
            },
            CanonicalEvent::FinalResult {
                text,
                start_ms,
                duration_ms,
            } => CanonicalEvent::FinalResult {
                text,
                start_ms: timeline.absolute_time(start_ms),
                duration_ms,
            },
            other => other,
        }
    }

    /// Hands an event to the active request, or to the host if there is none.
    fn deliver(&mut self, event: CanonicalEvent) {
        let active = self.current.as_ref().is_some_and(|c| !c.active.finished);
        if !active {
            match event {
                CanonicalEvent::Error { message, .. } => {
                    warn!(message = %message, "vendor error with no active request");
                    self.notify(SessionNotice::VendorError { message });
                }
                other => debug!(event = ?other, "no active request, dropping event"),
            }
            return;
        }
        let Some(current) = self.current.as_mut() else {
            return;
        };

        if event.is_output() {
            let audio_bytes = match &event {
                CanonicalEvent::AudioChunk { bytes } => bytes.len(),
                _ => 0,
            };
            if let Some(ttfb) = current.active.record_output(audio_bytes) {
                info!(
                    request_id = %current.active.id(),
                    ttfb_ms = ttfb.as_millis() as u64,
                    "first output"
                );
            }
        }
        if let CanonicalEvent::Error { message, .. } = &event {
            warn!(request_id = %current.active.id(), message = %message, "request failed");
        }

        let terminal = event.is_terminal();
        if current.events.send(event).is_err() {
            debug!(request_id = %current.active.id(), "event stream already dropped");
        }
        if terminal {
            current.active.finished = true;
            debug!(request_id = %current.active.id(), "request finished");
            self.receive_deadline = None;
        } else {
            self.touch_receive_deadline();
        }
    }

    fn touch_receive_deadline(&mut self) {
        let active = self.current.as_ref().is_some_and(|c| !c.active.finished);
        self.receive_deadline = active.then(|| Instant::now() + self.config.receive_timeout);
    }

    fn on_receive_timeout(&mut self) {
        let timeout = self.config.receive_timeout;
        self.deliver(CanonicalEvent::error(
            format!("no response from vendor within {timeout:?}"),
            false,
        ));
    }

    async fn begin_finalize(
        &mut self,
    ) -> Result<oneshot::Receiver<FinalizeComplete>, EngineError> {
        if self.finalize.is_awaiting() {
            return Err(EngineError::AlreadyFinalizing);
        }
        if !self.machine.is_ready() {
            return Err(EngineError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        self.finalize.begin(Some(tx))?;
        self.finalize_deadline = Some(Instant::now() + self.config.finalize_timeout);
        debug!("finalize issued");

        let message = self.protocol.finalize_message();
        if let Err(e) = self.machine.send(message).await {
            self.on_link_lost(e.to_string()).await;
        }
        Ok(rx)
    }

    fn settle_finalize(&mut self, result: Option<FinalizeComplete>) {
        let Some(result) = result else {
            return;
        };
        self.finalize_deadline = None;
        info!(
            latency_ms = result.latency.as_millis() as u64,
            interrupted = result.interrupted,
            "finalize complete"
        );
        self.notify(SessionNotice::FinalizeComplete(result));
    }

    async fn cancel(&mut self, request_id: &str, seq: Option<u64>) {
        let streaming = self.current.as_ref().is_some_and(|c| {
            !c.active.finished
                && c.active.id() == request_id
                && seq.is_none_or(|seq| seq == c.seq)
        });
        if !streaming {
            debug!(request_id = %request_id, "cancel for an inactive request ignored");
            return;
        }

        if self.machine.is_ready() {
            let flush = self.protocol.finalize_message();
            match timeout(self.config.cancel_grace, self.machine.send(flush)).await {
                Ok(Ok(())) => debug!("flush sent before cancel"),
                Ok(Err(e)) => debug!(error = %e, "flush before cancel failed"),
                Err(_) => debug!("flush before cancel timed out"),
            }
        }
        self.deliver(CanonicalEvent::error("request cancelled", false));
        self.current = None;
        let result = self.finalize.interrupt();
        self.settle_finalize(result);

        self.machine.release().await;
        self.backlog.clear();
        self.reconnect_at = None;
        self.policy.reset();
        info!(request_id = %request_id, "request cancelled, link released");
    }

    async fn on_link_lost(&mut self, reason: String) {
        if !self.machine.is_ready() {
            return;
        }
        warn!(
            generation = self.machine.generation(),
            reason = %reason,
            "link lost"
        );
        self.machine.mark_lost();
        let result = self.finalize.interrupt();
        self.settle_finalize(result);
        self.schedule_reconnect(reason).await;
    }

    async fn schedule_reconnect(&mut self, last_error: String) {
        match self.policy.next_delay() {
            Some(delay) => {
                let attempt = self.policy.attempts();
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "reconnecting"
                );
                self.reconnect_at = Some(Instant::now() + delay);
                self.notify(SessionNotice::Reconnecting { attempt, delay });
            }
            None => {
                let attempts = self.policy.attempts();
                self.shut_down(Some(EngineError::ReconnectExhausted {
                    attempts,
                    last_error,
                }))
                .await;
            }
        }
    }

    async fn attempt_reconnect(&mut self) {
        match self.machine.connect().await {
            Ok(generation) => {
                info!(
                    generation,
                    backlog = self.backlog.len(),
                    backlog_bytes = self.backlog.bytes(),
                    "reconnected"
                );
                self.on_connected(generation);
                self.drain_backlog().await;
            }
            Err(e) if e.is_retryable() => self.schedule_reconnect(e.to_string()).await,
            Err(e) => self.shut_down(Some(e)).await,
        }
    }

    /// Closes the session. With an error, the close is a fatal failure.
    async fn shut_down(&mut self, failure: Option<EngineError>) {
        if self.closed {
            return;
        }
        self.closed = true;

        let message = match &failure {
            Some(e) => e.to_string(),
            None => "session closed".to_string(),
        };
        self.deliver_terminal(CanonicalEvent::error(message.clone(), true));
        let result = self.finalize.interrupt();
        self.settle_finalize(result);

        self.reconnect_at = None;
        self.receive_deadline = None;
        self.backlog.clear();
        self.machine.close().await;

        if failure.is_some() {
            error!(error = %message, "session failed");
            self.notify(SessionNotice::Fatal { message });
        } else {
            info!("session closed");
        }
        self.notify(SessionNotice::Closed);
        self.publish();
    }

    /// Ends the active request, if any, without a host notice.
    fn deliver_terminal(&mut self, event: CanonicalEvent) {
        if self.current.as_ref().is_some_and(|c| !c.active.finished) {
            self.deliver(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::encode_base64,
        recorder::MockRecorder,
        test_support::{JsonProtocol, ready_frame},
        transport::{Frame, MemoryConnector, MemoryPeer, memory::MemoryAcceptor},
    };
    use futures::StreamExt;
    use mockall::predicate::eq;

    async fn open_immediate() -> (
        StreamSession,
        mpsc::UnboundedReceiver<SessionNotice>,
        MemoryConnector,
        MemoryAcceptor,
        MemoryPeer,
    ) {
        let (connector, mut acceptor) = MemoryConnector::new();
        let (session, notices) = StreamSession::open(
            EngineConfig::default(),
            Arc::new(JsonProtocol::immediate()),
            Arc::new(connector.clone()),
        )
        .await
        .unwrap();
        let mut peer = acceptor.accept().await.unwrap();
        // setup frame
        peer.recv().await.unwrap();
        (session, notices, connector, acceptor, peer)
    }

    #[tokio::test]
    async fn test_open_reports_connected() {
        let (session, mut notices, _connector, _acceptor, _peer) = open_immediate().await;
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.generation(), 1);
        assert_eq!(
            notices.recv().await,
            Some(SessionNotice::Connected { generation: 1 })
        );
    }

    #[tokio::test]
    async fn test_open_fails_fast_on_unexpected_negotiation() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let server = tokio::spawn(async move {
            let peer = acceptor.accept().await.unwrap();
            peer.send_text(r#"{"type":"end"}"#);
            peer
        });
        let result = StreamSession::open(
            EngineConfig::default(),
            Arc::new(JsonProtocol::handshake()),
            Arc::new(connector.clone()),
        )
        .await;
        let _peer = server.await.unwrap();
        assert!(matches!(result, Err(EngineError::UnexpectedMessage(_))));
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_open_with_handshake() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let server = tokio::spawn(async move {
            let peer = acceptor.accept().await.unwrap();
            peer.send(ready_frame());
            peer
        });
        let (session, _notices) = StreamSession::open(
            EngineConfig::default(),
            Arc::new(JsonProtocol::handshake()),
            Arc::new(connector),
        )
        .await
        .unwrap();
        let _peer = server.await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_results_are_streamed_in_order() {
        let (session, _notices, _connector, _acceptor, mut peer) = open_immediate().await;
        let stream = session
            .send_audio(StreamingRequest::new("r1"), vec![0; 3200])
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Binary(vec![0; 3200])));

        peer.send_text(r#"{"type":"partial","text":"he","start":0,"end":50}"#);
        peer.send_text(r#"{"type":"final","text":"hello","start":0,"end":100}"#);
        peer.send_text(r#"{"type":"end"}"#);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(
            events,
            vec![
                CanonicalEvent::PartialResult {
                    text: "he".into(),
                    start_ms: 0,
                    duration_ms: 50
                },
                CanonicalEvent::FinalResult {
                    text: "hello".into(),
                    start_ms: 0,
                    duration_ms: 100
                },
                CanonicalEvent::StreamEnd,
            ]
        );
    }

    #[tokio::test]
    async fn test_same_id_appends_and_new_id_supersedes() {
        let (session, _notices, _connector, _acceptor, mut peer) = open_immediate().await;
        let first = session
            .send_audio(StreamingRequest::new("r1"), vec![1; 32])
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        let appended = session
            .send_audio(StreamingRequest::new("r1"), vec![2; 32])
            .await
            .unwrap();
        assert!(matches!(appended, Submission::Appended));

        let second = session
            .send_audio(StreamingRequest::new("r2"), vec![3; 32])
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        assert_eq!(second.request_id(), "r2");

        let old: Vec<_> = first.collect().await;
        assert_eq!(old.len(), 1);
        assert!(matches!(
            &old[0],
            CanonicalEvent::Error { message, fatal: false } if message.contains("superseded")
        ));

        for fill in [1u8, 2, 3] {
            assert_eq!(peer.recv().await, Some(Frame::Binary(vec![fill; 32])));
        }
        let snapshot = session.request_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.request_id, "r2");
        assert_eq!(snapshot.units_sent, 32);
    }

    #[tokio::test]
    async fn test_empty_synthesis_text_skips_vendor() {
        let (session, _notices, _connector, _acceptor, mut peer) = open_immediate().await;
        let events: Vec<_> = session
            .synthesize(StreamingRequest::new("t1"), "")
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events, vec![CanonicalEvent::StreamEnd]);

        session.close().await;
        // Only the polite close message reached the vendor.
        assert_eq!(
            peer.recv().await.unwrap().as_text(),
            Some(r#"{"type":"close"}"#)
        );
    }

    #[tokio::test]
    async fn test_synthesis_is_serialized() {
        let (session, _notices, _connector, _acceptor, mut peer) = open_immediate().await;
        let mut first = session
            .synthesize(StreamingRequest::new("t1"), "one")
            .await
            .unwrap();

        let second = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .synthesize(StreamingRequest::new("t2"), "two")
                    .await
                    .unwrap()
            })
        };

        let sent = peer.recv().await.unwrap();
        assert!(sent.as_text().unwrap().contains("one"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        let audio = encode_base64(&[7; 64]);
        peer.send_text(format!(r#"{{"type":"audio","data":"{audio}"}}"#));
        peer.send_text(r#"{"type":"end"}"#);
        assert_eq!(
            first.next().await,
            Some(CanonicalEvent::AudioChunk { bytes: vec![7; 64] })
        );
        assert_eq!(first.next().await, Some(CanonicalEvent::StreamEnd));
        assert_eq!(first.next().await, None);

        let _second = second.await.unwrap();
        let sent = peer.recv().await.unwrap();
        assert!(sent.as_text().unwrap().contains("two"));
    }

    #[tokio::test]
    async fn test_vendor_error_without_request_is_a_notice() {
        let (_session, mut notices, _connector, _acceptor, peer) = open_immediate().await;
        assert!(matches!(
            notices.recv().await,
            Some(SessionNotice::Connected { .. })
        ));
        peer.send_text(r#"{"type":"error","message":"quota exceeded"}"#);
        assert_eq!(
            notices.recv().await,
            Some(SessionNotice::VendorError {
                message: "quota exceeded".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_timeout_ends_request_only() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let (session, _notices) = StreamSession::open(
            EngineConfig::default().with_receive_timeout(Duration::from_secs(5)),
            Arc::new(JsonProtocol::immediate()),
            Arc::new(connector),
        )
        .await
        .unwrap();
        let _peer = acceptor.accept().await.unwrap();

        let events: Vec<_> = session
            .send_audio(StreamingRequest::new("r1"), vec![0; 320])
            .await
            .unwrap()
            .into_stream()
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            CanonicalEvent::Error { message, fatal: false } if message.contains("no response")
        ));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_cancel_flushes_and_reconnects_lazily() {
        let (session, mut notices, connector, mut acceptor, mut peer) = open_immediate().await;
        let stream = session
            .send_audio(StreamingRequest::new("r1"), vec![0; 64])
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        peer.recv().await.unwrap();

        session.cancel("r1").await.unwrap();
        assert_eq!(
            peer.recv().await.unwrap().as_text(),
            Some(r#"{"type":"finalize"}"#)
        );
        // The link was released.
        assert_eq!(peer.recv().await, None);
        assert_eq!(session.state(), SessionState::Idle);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events, vec![CanonicalEvent::error("request cancelled", false)]);

        let _next = session
            .send_audio(StreamingRequest::new("r2"), vec![5; 64])
            .await
            .unwrap();
        let mut peer = acceptor.accept().await.unwrap();
        peer.recv().await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Binary(vec![5; 64])));
        assert_eq!(connector.attempts().len(), 2);
        assert_eq!(session.generation(), 2);

        assert!(matches!(notices.recv().await, Some(SessionNotice::Connected { .. })));
        assert_eq!(
            notices.recv().await,
            Some(SessionNotice::Reconnected { generation: 2 })
        );
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_request() {
        let (session, _notices, _connector, _acceptor, mut peer) = open_immediate().await;
        let stream = session
            .send_audio(StreamingRequest::new("r1"), vec![0; 64])
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        peer.recv().await.unwrap();
        drop(stream);

        assert_eq!(
            peer.recv().await.unwrap().as_text(),
            Some(r#"{"type":"finalize"}"#)
        );
        assert_eq!(session.request_snapshot().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropping_a_finished_stream_spares_a_reused_id() {
        let (session, _notices, _connector, _acceptor, mut peer) = open_immediate().await;
        let old = session
            .send_audio(StreamingRequest::new("r1"), vec![1; 32])
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        peer.recv().await.unwrap();
        peer.send_text(r#"{"type":"end"}"#);
        while !session.request_snapshot().await.unwrap().unwrap().finished {
            tokio::task::yield_now().await;
        }

        let new = session
            .send_audio(StreamingRequest::new("r1"), vec![2; 32])
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Binary(vec![2; 32])));

        // The old stream never read its end, so dropping it issues a cancel.
        drop(old);
        let snapshot = session.request_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.request_id, "r1");
        assert!(!snapshot.finished);
        assert_eq!(session.state(), SessionState::Ready);

        peer.send_text(r#"{"type":"final","text":"again","start":0,"end":20}"#);
        peer.send_text(r#"{"type":"end"}"#);
        let events: Vec<_> = new.collect().await;
        assert_eq!(
            events,
            vec![
                CanonicalEvent::FinalResult {
                    text: "again".into(),
                    start_ms: 0,
                    duration_ms: 20
                },
                CanonicalEvent::StreamEnd,
            ]
        );
    }

    #[tokio::test]
    async fn test_unit_larger_than_backlog_limit_is_sent() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let (session, _notices) = StreamSession::open(
            EngineConfig::default().with_backlog_byte_limit(64),
            Arc::new(JsonProtocol::immediate()),
            Arc::new(connector),
        )
        .await
        .unwrap();
        let mut peer = acceptor.accept().await.unwrap();
        peer.recv().await.unwrap();

        let _stream = session
            .send_audio(StreamingRequest::new("r1"), vec![4; 100])
            .await
            .unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Binary(vec![4; 100])));
        let snapshot = session.request_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.units_sent, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_appending_does_not_extend_receive_timeout() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let (session, _notices) = StreamSession::open(
            EngineConfig::default().with_receive_timeout(Duration::from_secs(5)),
            Arc::new(JsonProtocol::immediate()),
            Arc::new(connector),
        )
        .await
        .unwrap();
        let _peer = acceptor.accept().await.unwrap();

        let started = Instant::now();
        let mut stream = session
            .send_audio(StreamingRequest::new("r1"), vec![0; 320])
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        sleep(Duration::from_secs(3)).await;
        let appended = session
            .send_audio(StreamingRequest::new("r1"), vec![0; 320])
            .await
            .unwrap();
        assert!(matches!(appended, Submission::Appended));

        assert!(matches!(
            stream.next().await,
            Some(CanonicalEvent::Error { message, fatal: false }) if message.contains("no response")
        ));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_finalize_requires_link() {
        let (session, _notices, _connector, _acceptor, _peer) = open_immediate().await;
        let _stream = session
            .send_audio(StreamingRequest::new("r1"), vec![0; 64])
            .await
            .unwrap();
        session.cancel("r1").await.unwrap();
        assert_eq!(
            session.finalize().await.unwrap_err(),
            EngineError::NotConnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_finalize_times_out() {
        let (session, mut notices, _connector, _acceptor, _peer) = open_immediate().await;
        notices.recv().await.unwrap();

        let ticket = session.finalize().await.unwrap();
        let done = ticket.wait().await;
        assert!(done.interrupted);
        assert_eq!(done.latency, Duration::from_secs(10));
        assert_eq!(
            notices.recv().await,
            Some(SessionNotice::FinalizeComplete(done))
        );
        // A new finalize may be issued afterwards.
        assert!(session.finalize().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_ends_active_request_and_rejects_calls() {
        let (session, mut notices, _connector, _acceptor, _peer) = open_immediate().await;
        let stream = session
            .send_audio(StreamingRequest::new("r1"), vec![0; 64])
            .await
            .unwrap()
            .into_stream()
            .unwrap();

        session.close().await;
        session.close().await;
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events, vec![CanonicalEvent::error("session closed", true)]);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session
                .send_audio(StreamingRequest::new("r2"), vec![0; 64])
                .await
                .unwrap_err(),
            EngineError::Closed
        );

        let mut rest = Vec::new();
        while let Some(notice) = notices.recv().await {
            rest.push(notice);
        }
        assert_eq!(rest.last(), Some(&SessionNotice::Closed));
    }

    #[tokio::test]
    async fn test_recorder_sees_both_directions() {
        let mut recorder = MockRecorder::new();
        recorder
            .expect_record()
            .with(eq(Direction::Sent), eq("r1"), eq(vec![1u8; 32]))
            .times(1)
            .returning(|_, _, _| Ok(()));
        recorder
            .expect_record()
            .with(eq(Direction::Received), eq("r1"), eq(vec![9u8; 16]))
            .times(1)
            .returning(|_, _, _| Err(std::io::Error::other("disk full")));

        let (connector, mut acceptor) = MemoryConnector::new();
        let (session, _notices) = StreamSession::open_with_recorder(
            EngineConfig::default(),
            Arc::new(JsonProtocol::immediate()),
            Arc::new(connector),
            Some(Arc::new(recorder)),
        )
        .await
        .unwrap();
        let mut peer = acceptor.accept().await.unwrap();
        peer.recv().await.unwrap();

        let stream = session
            .send_audio(StreamingRequest::new("r1"), vec![1; 32])
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        peer.recv().await.unwrap();
        let audio = encode_base64(&[9; 16]);
        peer.send_text(format!(r#"{{"type":"audio","data":"{audio}"}}"#));
        peer.send_text(r#"{"type":"end"}"#);

        // A failing recorder does not affect the request.
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], CanonicalEvent::StreamEnd);
    }
}
