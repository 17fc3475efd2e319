//! BSML integration test harness.
//!
//! Everything runs in-process: the socket tests bind a loopback listener and
//! talk to it over real TCP, the HTTP tests drive the axum router directly.
//! Each test works in its own scratch directory under the system temp dir.

mod http;
mod socket;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use bsml_core::config::StreamingConfig;
use bsml_core::wire::{Block, BlockDecoder, ChecksumMode};
use bsml_core::{SampleChunk, Selection};
use bsml_services::format::ChunkIter;
use bsml_services::{
    FormatError, FormatRegistry, MemoryRepository, OpenRecording, RecordingFormat, RecordingInfo,
    Repository, SampleBuffer, SigTextFormat, SignalError, SignalInfo, SignalRead, StreamContext,
    SIGTEXT_MIMETYPE,
};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Base URI for every test recording.
pub const BASE: &str = "http://test.local";

/// Fresh scratch directory, unique per test and process.
pub fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("bsml-it-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// Two-signal sigtext recording: `ecg` is a ramp, `resp` is constant.
pub fn sigtext(rate: f64, rows: usize) -> String {
    let ecg: Vec<f64> = (0..rows).map(|i| i as f64).collect();
    let resp = vec![0.5; rows];
    SigTextFormat::render(rate, &["ecg", "resp"], &[ecg, resp])
}

/// Write a sigtext file under `dir` and register it as `<BASE>/<name>`.
pub fn register_sigtext(repo: &MemoryRepository, dir: &Path, name: &str, rate: f64, rows: usize) -> String {
    let path = dir.join(name);
    std::fs::write(&path, sigtext(rate, rows)).expect("write recording");
    let uri = format!("{BASE}/{name}");
    let info = SigTextFormat::parse(&sigtext(rate, rows), &uri)
        .expect("parse recording")
        .info()
        .clone();
    repo.register(RecordingInfo {
        source: Some(path),
        ..info
    })
    .expect("register recording");
    uri
}

pub fn context(repo: MemoryRepository, streaming: StreamingConfig) -> Arc<StreamContext> {
    let mut formats = FormatRegistry::with_builtin();
    formats.register(Arc::new(FlakyFormat));
    Arc::new(StreamContext {
        repository: Arc::new(repo),
        formats: Arc::new(formats),
        streaming,
    })
}

/// Start a socket listener on an ephemeral loopback port.
pub async fn start_socket(ctx: Arc<StreamContext>) -> Result<(SocketAddr, broadcast::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(bsml_services::serve_connections(listener, ctx, shutdown_tx.subscribe()));
    Ok((addr, shutdown_tx))
}

/// Decode every complete block in `bytes`.
pub fn decode_all(bytes: &[u8], mode: ChecksumMode) -> Result<Vec<Block>> {
    let mut decoder = BlockDecoder::new(mode);
    decoder.push(bytes);
    let mut blocks = Vec::new();
    while let Some(block) = decoder.next_block().context("decoding response")? {
        blocks.push(block);
    }
    anyhow::ensure!(decoder.is_idle(), "trailing partial block");
    Ok(blocks)
}

// ── A format whose `bad` signal cannot be read ────────────────────────────────

pub const FLAKY_MIMETYPE: &str = "application/x-flaky";

pub struct FlakyFormat;

struct FlakyRecording {
    info: RecordingInfo,
}

struct Unreadable;

impl SignalRead for Unreadable {
    fn read(&self, _selection: Selection, _points: usize) -> Result<ChunkIter<'_>, SignalError> {
        Err(SignalError::Read("media error".into()))
    }

    fn rate(&self) -> Option<f64> {
        Some(10.0)
    }
}

impl RecordingFormat for FlakyFormat {
    fn mimetype(&self) -> &str {
        FLAKY_MIMETYPE
    }

    fn open(&self, source: &Path, uri: &str) -> Result<Box<dyn OpenRecording>, FormatError> {
        let signals = ["bad", "good"]
            .iter()
            .map(|label| SignalInfo {
                uri: format!("{uri}/signal/{label}"),
                label: label.to_string(),
                rate: Some(10.0),
            })
            .collect();
        Ok(Box::new(FlakyRecording {
            info: RecordingInfo {
                uri: uri.to_string(),
                format: FLAKY_MIMETYPE.to_string(),
                source: Some(source.to_path_buf()),
                duration: Some(2.0),
                digest: None,
                signals,
            },
        }))
    }
}

impl OpenRecording for FlakyRecording {
    fn info(&self) -> &RecordingInfo {
        &self.info
    }

    fn signal(&self, uri: &str) -> Option<Arc<dyn SignalRead>> {
        if uri.ends_with("/bad") {
            Some(Arc::new(Unreadable))
        } else if uri.ends_with("/good") {
            Some(Arc::new(SampleBuffer::uniform(10.0, vec![3.0; 20])))
        } else {
            None
        }
    }
}

/// Register a flaky recording at `<BASE>/<name>`.
pub fn register_flaky(repo: &MemoryRepository, dir: &Path, name: &str) -> String {
    let uri = format!("{BASE}/{name}");
    let info = FlakyFormat
        .open(&dir.join(name), &uri)
        .expect("open flaky")
        .info()
        .clone();
    repo.register(info).expect("register flaky");
    uri
}

/// Uniform chunk helper for assertions.
pub fn total_samples(chunks: &[SampleChunk]) -> usize {
    chunks.iter().map(SampleChunk::len).sum()
}
