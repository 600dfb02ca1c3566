//! Command line driver for voxstream sessions.
//!
//! `recognize` streams a raw 16-bit PCM file to FunASR and prints results;
//! `synthesize` turns text into raw PCM through Aliyun realtime TTS.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc, time::Instant};
use tracing::info;
use voxstream_aliyun::{AliyunTtsConfig, AliyunTtsProtocol};
use voxstream_core::{
    CanonicalEvent, Recorder, StreamSession, StreamingRequest, VendorProtocol,
    transport::WsConnector,
};
use voxstream_funasr::FunAsrProtocol;
use voxstream_service::{
    config::Config,
    dump::PcmDumper,
    run::{self, RecognizeOptions},
};

#[derive(Parser)]
#[command(name = "voxstream")]
#[command(version, about = "Stream audio to realtime speech vendors", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recognize speech from a raw PCM file
    Recognize {
        /// 16-bit little-endian mono PCM at the configured sample rate
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 100)]
        chunk_ms: u64,
        /// Send in real time instead of as fast as possible
        #[arg(long)]
        pace: bool,
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Synthesize text into a raw PCM file
    Synthesize {
        #[arg(long)]
        text: String,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        turn_id: i64,
    },
}

async fn open_session(
    config: &Config,
    protocol: Arc<dyn VendorProtocol>,
) -> anyhow::Result<(StreamSession, Option<tokio::task::JoinHandle<()>>)> {
    let (recorder, writer) = match &config.dump_path {
        Some(dir) => {
            let (dumper, writer) = PcmDumper::spawn(dir, protocol.name());
            info!(dir = %dir.display(), "dumping audio");
            (Some(Arc::new(dumper) as Arc<dyn Recorder>), Some(writer))
        }
        None => (None, None),
    };
    let (session, notices) = StreamSession::open_with_recorder(
        config.engine_config(),
        protocol,
        Arc::new(WsConnector::new()),
        recorder,
    )
    .await
    .context("Failed to open session")?;
    run::spawn_notice_logger(notices);
    Ok((session, writer))
}

fn print_event(event: &CanonicalEvent) {
    match event {
        CanonicalEvent::PartialResult { text, start_ms, .. } => {
            println!("[partial {start_ms:>6}ms] {text}")
        }
        CanonicalEvent::FinalResult {
            text,
            start_ms,
            duration_ms,
        } => println!("[final   {start_ms:>6}ms +{duration_ms}ms] {text}"),
        CanonicalEvent::Error { message, .. } => eprintln!("[error] {message}"),
        _ => {}
    }
}

async fn recognize(
    config: &Config,
    input: PathBuf,
    options: RecognizeOptions,
) -> anyhow::Result<()> {
    let pcm = tokio::fs::read(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let protocol = Arc::new(FunAsrProtocol::new(config.funasr.clone()));
    let format = protocol.audio_format();
    let (session, writer) = open_session(config, protocol).await?;

    let started = Instant::now();
    let outcome = tokio::select! {
        report = run::recognize(&session, format, &pcm, &options, print_event) => Some(report),
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, closing session");
            None
        }
    };
    session.close().await;
    drop(session);
    if let Some(writer) = writer {
        let _ = writer.await;
    }

    let Some(report) = outcome.transpose()? else {
        return Ok(());
    };
    println!("transcript: {}", report.transcript());
    if let Some(snapshot) = &report.snapshot {
        println!(
            "audio sent: {:?}, ttfb: {:?}",
            snapshot.audio_sent, snapshot.ttfb
        );
    }
    println!(
        "finalize latency: {:?}{}, total: {:?}",
        report.finalize.latency,
        if report.finalize.interrupted {
            " (interrupted)"
        } else {
            ""
        },
        started.elapsed()
    );
    Ok(())
}

async fn synthesize(
    config: &Config,
    aliyun: AliyunTtsConfig,
    text: String,
    output: PathBuf,
    turn_id: i64,
) -> anyhow::Result<()> {
    let protocol = Arc::new(AliyunTtsProtocol::new(aliyun));
    let (session, writer) = open_session(config, protocol).await?;
    let mut file = tokio::fs::File::create(&output)
        .await
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let request = StreamingRequest::new(uuid::Uuid::new_v4().to_string()).with_turn_id(turn_id);
    let started = Instant::now();
    let outcome = tokio::select! {
        report = run::synthesize(&session, request, &text, &mut file) => Some(report),
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, closing session");
            None
        }
    };
    session.close().await;
    drop(session);
    if let Some(writer) = writer {
        let _ = writer.await;
    }

    let Some(report) = outcome.transpose()? else {
        return Ok(());
    };
    println!(
        "wrote {} bytes in {} chunks to {}",
        report.audio_bytes,
        report.chunks,
        output.display()
    );
    if let Some(ttfb) = report.snapshot.and_then(|s| s.ttfb) {
        println!("ttfb: {ttfb:?}");
    }
    println!("total: {:?}", started.elapsed());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    // --- 3. Run ---
    match cli.command {
        Command::Recognize {
            input,
            chunk_ms,
            pace,
            request_id,
        } => {
            let options = RecognizeOptions {
                request_id: request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                chunk_ms,
                pace,
            };
            info!(url = %config.funasr.ws_url, mode = %config.funasr.mode, "recognizing");
            recognize(&config, input, options).await
        }
        Command::Synthesize {
            text,
            output,
            turn_id,
        } => {
            let aliyun = config.require_aliyun()?.clone();
            info!(settings = %aliyun.redacted(), "synthesizing");
            synthesize(&config, aliyun, text, output, turn_id).await
        }
    }
}
