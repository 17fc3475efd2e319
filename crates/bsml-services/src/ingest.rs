//! Recording ingestion and removal.
//!
//! Uploaded bodies stream into a uniquely named `.partial` file next to their
//! final path and are renamed into place once complete. A storage path is
//! reserved for the whole upload, so a second upload to the same name is a
//! conflict rather than a race. The format reader then opens the
//! stored file to build the catalog entry, and registration happens last. Any
//! failure along the way removes what was written and leaves the catalog
//! untouched.

use std::fmt::Display;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashSet;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::format::{FormatError, FormatRegistry};
use crate::repository::{RecordingInfo, RepoError, Repository, ResourceKind};

/// Uploaded content must carry a vendor mimetype.
const UPLOAD_TYPE_PREFIX: &str = "application/x-";

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Where uploaded recordings live on disk.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    root: PathBuf,
    /// Storage paths with an upload in progress.
    in_flight: Arc<DashSet<PathBuf>>,
}

/// Destination of one upload.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Recording URI to register.
    pub uri: String,
    /// Relative storage name, normally the request path.
    pub name: String,
    pub mimetype: String,
}

impl RecordingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            in_flight: Arc::new(DashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage path for `name`. Only plain relative components are accepted.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, IngestError> {
        let relative = Path::new(name.trim_start_matches('/'));
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if name.trim_matches('/').is_empty() || !plain {
            return Err(IngestError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Store `body` and register it as a new recording.
    pub async fn ingest<S, E>(
        &self,
        repository: &dyn Repository,
        formats: &FormatRegistry,
        upload: &Upload,
        body: S,
    ) -> Result<RecordingInfo, IngestError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        if !upload.mimetype.starts_with(UPLOAD_TYPE_PREFIX) {
            return Err(IngestError::UnsupportedType(upload.mimetype.clone()));
        }
        let format = formats
            .get(&upload.mimetype)
            .ok_or_else(|| IngestError::UnsupportedType(upload.mimetype.clone()))?;
        if repository.kind(&upload.uri).is_some() {
            return Err(IngestError::Conflict(upload.uri.clone()));
        }
        let path = self.path_for(&upload.name)?;
        let _reservation = Reservation::claim(&self.in_flight, &path)
            .ok_or_else(|| IngestError::Conflict(upload.uri.clone()))?;
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| IngestError::Storage(path.clone(), e))?;
        if exists {
            return Err(IngestError::Conflict(upload.uri.clone()));
        }

        let (digest, bytes) = write_body(&path, body).await?;
        let mut stored = PartialFile::new(path.clone());

        let uri = upload.uri.clone();
        let source = path.clone();
        let opened = tokio::task::spawn_blocking(move || {
            format.open(&source, &uri).map(|r| r.info().clone())
        })
        .await
        .map_err(|e| IngestError::Storage(path.clone(), std::io::Error::other(e)))?;
        let mut info = opened?;
        info.source = Some(path.clone());
        info.digest = Some(digest);

        repository.register(info.clone()).map_err(|e| match e {
            RepoError::Conflict(uri) => IngestError::Conflict(uri),
        })?;
        stored.keep();

        tracing::info!(
            uri = %info.uri,
            bytes,
            signals = info.signals.len(),
            path = %path.display(),
            "recording ingested"
        );
        Ok(info)
    }

    /// Remove a recording's file and catalog entry.
    pub async fn delete(&self, repository: &dyn Repository, uri: &str) -> Result<RecordingInfo, IngestError> {
        match repository.kind(uri) {
            None => return Err(IngestError::NotFound(uri.to_string())),
            Some(ResourceKind::Signal) => return Err(IngestError::SubResource(uri.to_string())),
            Some(ResourceKind::Recording) => {}
        }
        let removed = repository
            .deregister(uri)
            .ok_or_else(|| IngestError::NotFound(uri.to_string()))?;
        if let Some(source) = &removed.source {
            if let Err(e) = tokio::fs::remove_file(source).await {
                tracing::warn!(path = %source.display(), error = %e, "failed to remove recording file");
            }
        }
        tracing::info!(uri, "recording deleted");
        Ok(removed)
    }
}

/// Stream `body` into `path` via a temporary file. Returns the hex BLAKE3
/// digest and byte count.
async fn write_body<S, E>(path: &Path, body: S) -> Result<(String, u64), IngestError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let storage = |e: std::io::Error| IngestError::Storage(path.to_path_buf(), e);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(storage)?;
    }
    let partial_path = partial_name(path);
    let mut partial = PartialFile::new(partial_path.clone());
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&partial_path)
        .await
        .map_err(storage)?;

    let mut hasher = blake3::Hasher::new();
    let mut total = 0u64;
    let mut body = std::pin::pin!(body);
    while let Some(item) = body.next().await {
        let bytes = item.map_err(|e| IngestError::Body(e.to_string()))?;
        hasher.update(&bytes);
        file.write_all(&bytes).await.map_err(storage)?;
        total += bytes.len() as u64;
    }
    file.flush().await.map_err(storage)?;
    file.sync_all().await.map_err(storage)?;
    drop(file);

    tokio::fs::rename(&partial_path, path).await.map_err(storage)?;
    partial.keep();
    Ok((hex::encode(hasher.finalize().as_bytes()), total))
}

/// `.<name>.<pid>-<seq>.partial` beside `path`.
fn partial_name(path: &Path) -> PathBuf {
    let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = std::ffi::OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(".{}-{seq}.partial", std::process::id()));
    path.with_file_name(name)
}

/// Holds a storage path for one upload; released on drop.
struct Reservation<'a> {
    set: &'a DashSet<PathBuf>,
    path: PathBuf,
}

impl<'a> Reservation<'a> {
    fn claim(set: &'a DashSet<PathBuf>, path: &Path) -> Option<Self> {
        set.insert(path.to_path_buf()).then(|| Self {
            set,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.path);
    }
}

/// Removes its file on drop unless kept. Covers cancelled uploads too.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unsupported recording type: {0}")]
    UnsupportedType(String),

    #[error("recording '{0}' already exists")]
    Conflict(String),

    #[error("invalid recording name: {0}")]
    InvalidName(String),

    #[error("upload interrupted: {0}")]
    Body(String),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("storage failure at {0}: {1}")]
    Storage(PathBuf, std::io::Error),

    #[error("unknown recording: {0}")]
    NotFound(String),

    #[error("cannot delete '{0}': not a recording")]
    SubResource(String),
}
