//! Raw PCM dumps of the audio each request sends and receives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};
use voxstream_core::{Direction, Recorder};

struct Chunk {
    request_id: String,
    path: PathBuf,
    bytes: Vec<u8>,
}

/// Appends audio to `<dir>/<vendor>_<request id>_<direction>.pcm`.
///
/// `record` only queues; a background task owns the files and exits once
/// every dumper handle is dropped.
#[derive(Clone)]
pub struct PcmDumper {
    dir: PathBuf,
    vendor: String,
    chunks: mpsc::UnboundedSender<Chunk>,
}

impl PcmDumper {
    /// Must be called from within a tokio runtime.
    pub fn spawn(dir: impl Into<PathBuf>, vendor: &str) -> (Self, JoinHandle<()>) {
        let dir = dir.into();
        let (chunks, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_chunks(dir.clone(), rx));
        (
            Self {
                dir,
                vendor: vendor.to_string(),
                chunks,
            },
            writer,
        )
    }

    pub fn path_for(&self, direction: Direction, request_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.pcm",
            sanitize(&self.vendor),
            sanitize(request_id),
            direction.as_str()
        ))
    }
}

impl Recorder for PcmDumper {
    fn record(&self, direction: Direction, request_id: &str, bytes: &[u8]) -> std::io::Result<()> {
        self.chunks
            .send(Chunk {
                request_id: request_id.to_string(),
                path: self.path_for(direction, request_id),
                bytes: bytes.to_vec(),
            })
            .map_err(|_| std::io::Error::other("dump writer has stopped"))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Open dump files of the request currently being recorded.
///
/// Requests do not interleave on a session, so a chunk for a new request id
/// closes the previous request's files.
struct DumpFiles {
    dir: PathBuf,
    dir_ready: bool,
    request_id: Option<String>,
    files: HashMap<PathBuf, fs::File>,
}

impl DumpFiles {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            dir_ready: false,
            request_id: None,
            files: HashMap::new(),
        }
    }

    fn open_count(&self) -> usize {
        self.files.len()
    }

    async fn write(&mut self, chunk: Chunk) {
        if !self.dir_ready {
            if let Err(e) = fs::create_dir_all(&self.dir).await {
                warn!(dir = %self.dir.display(), error = %e, "cannot create dump directory");
                return;
            }
            self.dir_ready = true;
        }
        if self.request_id.as_deref() != Some(chunk.request_id.as_str()) {
            self.close_all().await;
            self.request_id = Some(chunk.request_id.clone());
        }
        if !self.files.contains_key(&chunk.path) {
            match open_append(&chunk.path).await {
                Ok(file) => {
                    debug!(path = %chunk.path.display(), "dump file opened");
                    self.files.insert(chunk.path.clone(), file);
                }
                Err(e) => {
                    warn!(path = %chunk.path.display(), error = %e, "cannot open dump file");
                    return;
                }
            }
        }
        if let Some(file) = self.files.get_mut(&chunk.path) {
            if let Err(e) = file.write_all(&chunk.bytes).await {
                warn!(path = %chunk.path.display(), error = %e, "dump write failed");
            }
        }
    }

    async fn close_all(&mut self) {
        if self.open_count() > 0 {
            debug!(request_id = ?self.request_id, files = self.open_count(), "closing dump files");
        }
        for (path, mut file) in self.files.drain() {
            if let Err(e) = file.flush().await {
                warn!(path = %path.display(), error = %e, "dump flush failed");
            }
        }
    }
}

async fn write_chunks(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<Chunk>) {
    let mut files = DumpFiles::new(dir);
    while let Some(chunk) = rx.recv().await {
        files.write(chunk).await;
    }
    files.close_all().await;
}

async fn open_append(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
