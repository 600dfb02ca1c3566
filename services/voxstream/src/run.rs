//! The two flows the CLI drives: stream a PCM file through recognition, and
//! synthesize text into PCM.

use anyhow::{Context, bail};
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{info, warn};
use voxstream_core::{
    CanonicalEvent, EventStream, FinalizeComplete, RequestSnapshot, SessionNotice, StreamSession,
    StreamingRequest, Submission, audio::AudioFormat,
};

#[derive(Debug, Clone)]
pub struct RecognizeOptions {
    pub request_id: String,
    pub chunk_ms: u64,
    /// Sleep one chunk duration between sends, like a live microphone.
    pub pace: bool,
}

#[derive(Debug)]
pub struct RecognitionReport {
    pub finals: Vec<String>,
    pub partials: usize,
    pub errors: Vec<String>,
    pub finalize: FinalizeComplete,
    pub snapshot: Option<RequestSnapshot>,
}

impl RecognitionReport {
    pub fn transcript(&self) -> String {
        self.finals.concat()
    }
}

#[derive(Debug)]
pub struct SynthesisReport {
    pub audio_bytes: usize,
    pub chunks: usize,
    pub snapshot: Option<RequestSnapshot>,
}

/// Logs session notices until the session goes away.
pub fn spawn_notice_logger(
    mut notices: mpsc::UnboundedReceiver<SessionNotice>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                SessionNotice::Reconnecting { attempt, delay } => {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "link lost, reconnecting")
                }
                SessionNotice::VendorError { message } => warn!(%message, "vendor error"),
                SessionNotice::Fatal { message } => warn!(%message, "session failed"),
                SessionNotice::Closed => {
                    info!("session closed");
                    break;
                }
                other => info!(notice = ?other, "session notice"),
            }
        }
    })
}

/// Streams `pcm` in `chunk_ms` slices, then finalizes and waits for the ack.
///
/// `on_event` sees every event of the request as it arrives. Recognition
/// requests stay open after their final result, so the session is closed
/// before returning.
pub async fn recognize(
    session: &StreamSession,
    format: AudioFormat,
    pcm: &[u8],
    options: &RecognizeOptions,
    mut on_event: impl FnMut(&CanonicalEvent),
) -> anyhow::Result<RecognitionReport> {
    if pcm.is_empty() {
        bail!("input contains no audio");
    }
    let chunk_bytes = format.bytes_for_ms(options.chunk_ms.max(1)).max(1);
    let pace = Duration::from_millis(options.chunk_ms);

    let mut report = RecognitionReport {
        finals: Vec::new(),
        partials: 0,
        errors: Vec::new(),
        finalize: FinalizeComplete {
            latency: Duration::ZERO,
            interrupted: true,
        },
        snapshot: None,
    };
    let mut sink = |event: CanonicalEvent| {
        on_event(&event);
        match event {
            CanonicalEvent::PartialResult { .. } => report.partials += 1,
            CanonicalEvent::FinalResult { text, .. } => report.finals.push(text),
            CanonicalEvent::Error { message, .. } => report.errors.push(message),
            _ => {}
        }
    };

    let mut stream: Option<EventStream> = None;
    let mut started = false;
    for chunk in pcm.chunks(chunk_bytes) {
        let submission = session
            .send_audio(
                StreamingRequest::new(options.request_id.clone()),
                chunk.to_vec(),
            )
            .await
            .context("failed to send audio")?;
        if let Submission::Started(events) = submission {
            stream = Some(events);
            started = true;
        }
        if options.pace {
            pump(&mut stream, tokio::time::sleep(pace), &mut sink).await;
        } else {
            drain_ready(&mut stream, &mut sink);
        }
        if started && stream.is_none() {
            warn!("request ended before all audio was sent");
            break;
        }
    }

    let ticket = session.finalize().await.context("failed to finalize")?;
    let finalize = pump(&mut stream, ticket.wait(), &mut sink).await;
    drain_ready(&mut stream, &mut sink);
    drop(sink);

    report.finalize = finalize;
    report.snapshot = session.request_snapshot().await?;
    session.close().await;
    drop(stream);
    Ok(report)
}

/// Synthesizes `text` and writes the audio to `out` as it arrives.
pub async fn synthesize<W>(
    session: &StreamSession,
    request: StreamingRequest,
    text: &str,
    out: &mut W,
) -> anyhow::Result<SynthesisReport>
where
    W: AsyncWrite + Unpin,
{
    let mut stream = session.synthesize(request, text).await?;
    let mut report = SynthesisReport {
        audio_bytes: 0,
        chunks: 0,
        snapshot: None,
    };
    while let Some(event) = stream.next().await {
        match event {
            CanonicalEvent::AudioChunk { bytes } => {
                out.write_all(&bytes).await?;
                report.audio_bytes += bytes.len();
                report.chunks += 1;
            }
            CanonicalEvent::StreamEnd => break,
            CanonicalEvent::Error { message, .. } => bail!("synthesis failed: {message}"),
            other => warn!(event = ?other, "unexpected event during synthesis"),
        }
    }
    out.flush().await?;
    report.snapshot = session.request_snapshot().await?;
    Ok(report)
}

async fn next_event(stream: Option<&mut EventStream>) -> Option<CanonicalEvent> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Forwards events to `sink` until `until` resolves.
async fn pump<F: Future>(
    stream: &mut Option<EventStream>,
    until: F,
    sink: &mut impl FnMut(CanonicalEvent),
) -> F::Output {
    tokio::pin!(until);
    loop {
        let event = {
            let next = next_event(stream.as_mut());
            tokio::select! {
                output = &mut until => return output,
                event = next => event,
            }
        };
        match event {
            Some(event) => sink(event),
            None => *stream = None,
        }
    }
}

/// Forwards whatever is already queued without waiting.
fn drain_ready(stream: &mut Option<EventStream>, sink: &mut impl FnMut(CanonicalEvent)) {
    while let Some(events) = stream.as_mut() {
        let polled = events.next().now_or_never();
        match polled {
            Some(Some(event)) => sink(event),
            Some(None) => *stream = None,
            None => break,
        }
    }
}
