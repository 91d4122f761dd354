//! Tarpit responder: holds a connection open while slow-feeding bytes.
//!
//! The responder sniffs up to 512 bytes of its content source for MIME
//! detection, emits headers immediately, then drips `bytes_per_second/10`
//! sized chunks on a 100 ms ticker until the content ends, the client
//! disconnects, or the overall timeout elapses. The sniffed bytes are
//! drained through the same pacing, so the byte rate holds from the first
//! chunk. Each chunk is a separate body frame, which the server flushes
//! as it is produced.
//!
//! Content sources: none (hold the connection, send nothing), a local
//! file (validated at configure time), or an HTTP(S) URL fetched once
//! through a file-backed cache.

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::{Body, Frame};
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{text_response, BoxBody, Responder};
use crate::error::{DefenderError, Result};

const TICK: Duration = Duration::from_millis(100);
const SNIFF_LEN: usize = 512;

/// Content source location: `protocol` is one of `""`, `file`, `http`,
/// `https`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentConfig {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub path: String,
}

/// Tarpit responder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TarpitConfig {
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub content: ContentConfig,

    /// Overall response lifetime; the connection closes when it elapses.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_bytes_per_second")]
    pub bytes_per_second: u32,

    #[serde(default = "default_response_code")]
    pub response_code: u16,

    /// Where fetched http(s) content is cached between requests.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_bytes_per_second() -> u32 {
    100
}

fn default_response_code() -> u16 {
    200
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("netdefender-tarpit")
}

impl Default for TarpitConfig {
    fn default() -> Self {
        TarpitConfig {
            headers: HashMap::new(),
            content: ContentConfig::default(),
            timeout_ms: default_timeout_ms(),
            bytes_per_second: default_bytes_per_second(),
            response_code: default_response_code(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl TarpitConfig {
    /// Check parameter bounds and the content specification. Runs at load
    /// time; failures abort startup.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(DefenderError::TarpitConfig(
                "tarpit timeout must be greater than 0".to_string(),
            ));
        }
        if self.bytes_per_second <= 10 {
            return Err(DefenderError::TarpitConfig(
                "tarpit bytes_per_second must be greater than 10".to_string(),
            ));
        }
        if self.content.protocol.is_empty() && !self.content.path.is_empty() {
            return Err(DefenderError::TarpitConfig(
                "missing tarpit content protocol".to_string(),
            ));
        }
        StatusCode::from_u16(self.response_code).map_err(|_| {
            DefenderError::TarpitConfig(format!(
                "invalid tarpit response code: {}",
                self.response_code
            ))
        })?;
        Ok(())
    }
}

/// Where the tarpit's bytes come from.
#[derive(Debug)]
enum ContentSource {
    /// No content: hold the connection open until the timeout.
    Empty,
    File(PathBuf),
    Http { url: String, cache_file: PathBuf },
}

impl ContentSource {
    fn configure(config: &TarpitConfig) -> Result<ContentSource> {
        match config.content.protocol.as_str() {
            "" => Ok(ContentSource::Empty),
            "file" => {
                let path = PathBuf::from(&config.content.path);
                let meta = std::fs::metadata(&path).map_err(|e| {
                    DefenderError::TarpitConfig(format!(
                        "tarpit content file {}: {e}",
                        path.display()
                    ))
                })?;
                if !meta.is_file() {
                    return Err(DefenderError::TarpitConfig(format!(
                        "tarpit content path is not a file: {}",
                        path.display()
                    )));
                }
                Ok(ContentSource::File(path))
            }
            proto @ ("http" | "https") => {
                let url = format!("{proto}://{}", config.content.path);
                reqwest::Url::parse(&url).map_err(|e| {
                    DefenderError::TarpitConfig(format!("invalid tarpit content URL {url}: {e}"))
                })?;
                let mut hasher = Sha256::new();
                hasher.update(url.as_bytes());
                let digest = hasher.finalize();
                let name: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
                Ok(ContentSource::Http {
                    url,
                    cache_file: config.cache_dir.join(format!("{name}.cache")),
                })
            }
            other => Err(DefenderError::TarpitConfig(format!(
                "unsupported tarpit content protocol '{other}'"
            ))),
        }
    }

    async fn open(&self) -> Result<ContentStream> {
        match self {
            ContentSource::Empty => Ok(ContentStream::Empty),
            ContentSource::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(ContentStream::File(file))
            }
            ContentSource::Http { url, cache_file } => {
                if !tokio::fs::try_exists(cache_file).await.unwrap_or(false) {
                    fetch_to_cache(url, cache_file).await?;
                }
                let file = tokio::fs::File::open(cache_file).await?;
                Ok(ContentStream::File(file))
            }
        }
    }
}

async fn fetch_to_cache(url: &str, cache_file: &Path) -> Result<()> {
    let response = reqwest::get(url).await?.error_for_status()?;
    let bytes = response.bytes().await?;
    if let Some(dir) = cache_file.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let staging = cache_file.with_extension("partial");
    tokio::fs::write(&staging, &bytes).await?;
    tokio::fs::rename(&staging, cache_file).await?;
    debug!(url, file = %cache_file.display(), size = bytes.len(), "cached tarpit content");
    Ok(())
}

/// An open content stream being dripped to one client.
enum ContentStream {
    Empty,
    File(tokio::fs::File),
}

/// One read from a content stream: data, nothing right now, or the end.
enum Chunk {
    Data(Bytes),
    Idle,
    Eof,
}

impl ContentStream {
    async fn read_chunk(&mut self, max: usize) -> std::io::Result<Chunk> {
        match self {
            // The empty source never ends; it just has nothing to say.
            ContentStream::Empty => Ok(Chunk::Idle),
            ContentStream::File(file) => {
                let mut buf = vec![0u8; max];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok(Chunk::Eof);
                }
                buf.truncate(n);
                Ok(Chunk::Data(Bytes::from(buf)))
            }
        }
    }
}

/// Streaming responder that slow-feeds content to matched clients.
pub struct TarpitResponder {
    config: TarpitConfig,
    source: ContentSource,
}

impl TarpitResponder {
    pub fn new(config: TarpitConfig) -> Result<TarpitResponder> {
        config.validate()?;
        let source = ContentSource::configure(&config)?;
        Ok(TarpitResponder { config, source })
    }
}

#[async_trait]
impl Responder for TarpitResponder {
    async fn respond(&self) -> Response<BoxBody> {
        let mut stream = match self.source.open().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to open tarpit content");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read content");
            }
        };

        // Sniff the head of the content for MIME detection; the bytes are
        // replayed through the drip below, not sent in one burst.
        let mut sniff = Vec::with_capacity(SNIFF_LEN);
        loop {
            match stream.read_chunk(SNIFF_LEN - sniff.len()).await {
                Ok(Chunk::Data(data)) => {
                    sniff.extend_from_slice(&data);
                    if sniff.len() >= SNIFF_LEN {
                        break;
                    }
                }
                Ok(Chunk::Idle) | Ok(Chunk::Eof) => break,
                Err(e) => {
                    warn!(error = %e, "error reading tarpit content");
                    return text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "error reading content",
                    );
                }
            }
        }

        let mut builder = Response::builder().status(self.config.response_code);
        for (key, value) in &self.config.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        builder = builder.header("Content-Type", detect_content_type(&sniff));

        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let chunk_size = (self.config.bytes_per_second / 10).max(1) as usize;
        let timeout = Duration::from_millis(self.config.timeout_ms);
        tokio::spawn(drip(stream, tx, Bytes::from(sniff), chunk_size, timeout));

        match builder.body(BoxBody::new(DripBody { rx })) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "failed to build tarpit response headers");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid response headers")
            }
        }
    }
}

/// Feed chunks to the client until EOF, disconnect, or timeout. All three
/// are clean exits; closing the channel ends the response body.
async fn drip(
    mut stream: ContentStream,
    tx: mpsc::Sender<Bytes>,
    mut pending: Bytes,
    chunk_size: usize,
    timeout: Duration,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    // First chunk goes out immediately so the client sees headers and
    // data without waiting a full tick.
    let mut first = true;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);

    loop {
        if !first {
            tokio::select! {
                _ = &mut deadline => return,
                _ = ticker.tick() => {}
            }
        }
        first = false;

        let chunk = if !pending.is_empty() {
            let take = pending.len().min(chunk_size);
            pending.split_to(take)
        } else {
            match stream.read_chunk(chunk_size).await {
                Ok(Chunk::Data(data)) => data,
                Ok(Chunk::Idle) => continue,
                Ok(Chunk::Eof) => return,
                Err(e) => {
                    warn!(error = %e, "tarpit content read error");
                    return;
                }
            }
        };

        tokio::select! {
            _ = &mut deadline => return,
            sent = tx.send(chunk) => {
                if sent.is_err() {
                    debug!("tarpit client disconnected");
                    return;
                }
            }
        }
    }
}

/// Body that yields whatever the drip task sends, one frame per chunk.
struct DripBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for DripBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Infallible>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => Poll::Ready(Some(Ok(Frame::data(data)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Minimal MIME sniffing over the first bytes of the content, covering
/// the types a tarpit plausibly serves.
fn detect_content_type(head: &[u8]) -> &'static str {
    let trimmed = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[][..], |i| &head[i..]);

    let html_markers: [&[u8]; 4] = [b"<!doctype html", b"<html", b"<head", b"<body"];
    let lower: Vec<u8> = trimmed
        .iter()
        .take(16)
        .map(|b| b.to_ascii_lowercase())
        .collect();
    if html_markers.iter().any(|m| lower.starts_with(m)) {
        return "text/html; charset=utf-8";
    }
    if head.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if head.starts_with(b"\xff\xd8\xff") {
        return "image/jpeg";
    }
    if head.starts_with(b"PK\x03\x04") {
        return "application/zip";
    }
    if head.starts_with(b"\x1f\x8b") {
        return "application/x-gzip";
    }
    if head.contains(&0) {
        return "application/octet-stream";
    }
    "text/plain; charset=utf-8"
}
