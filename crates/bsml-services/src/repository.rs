//! Recording catalog: resolves URIs to recordings and signals.
//!
//! The real catalog is an external metadata store. Everything the streaming
//! layer needs from it goes through [`Repository`]; [`MemoryRepository`] is
//! the in-process implementation used by the daemon and the tests.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// What kind of resource a URI names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Recording,
    Signal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalInfo {
    pub uri: String,
    pub label: String,
    /// Uniform sample rate in Hz; `None` for explicitly clocked signals.
    pub rate: Option<f64>,
}

/// Catalog entry for one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingInfo {
    pub uri: String,
    /// Native mimetype, e.g. `application/x-sigtext`.
    pub format: String,
    /// Backing file. `None` when the recording has no stored content.
    pub source: Option<PathBuf>,
    pub duration: Option<f64>,
    /// Hex BLAKE3 digest of the backing file, set on ingestion.
    pub digest: Option<String>,
    /// Signals in declared order.
    pub signals: Vec<SignalInfo>,
}

impl RecordingInfo {
    pub fn signal(&self, uri: &str) -> Option<&SignalInfo> {
        self.signals.iter().find(|s| s.uri == uri)
    }
}

/// Lookup and registration capabilities of the catalog.
pub trait Repository: Send + Sync {
    fn kind(&self, uri: &str) -> Option<ResourceKind>;

    /// The recording named by `uri`, or the recording containing signal `uri`.
    fn recording(&self, uri: &str) -> Option<RecordingInfo>;

    fn register(&self, recording: RecordingInfo) -> Result<(), RepoError>;

    /// Remove a recording and its signals. Returns what was removed.
    fn deregister(&self, uri: &str) -> Option<RecordingInfo>;

    fn is_recording(&self, uri: &str) -> bool {
        self.kind(uri) == Some(ResourceKind::Recording)
    }

    fn is_signal(&self, uri: &str) -> bool {
        self.kind(uri) == Some(ResourceKind::Signal)
    }
}

/// Concurrent in-memory catalog.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    recordings: Arc<DashMap<String, RecordingInfo>>,
    /// signal uri -> recording uri
    signals: Arc<DashMap<String, String>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.recordings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.is_empty()
    }
}

impl Repository for MemoryRepository {
    fn kind(&self, uri: &str) -> Option<ResourceKind> {
        if self.recordings.contains_key(uri) {
            Some(ResourceKind::Recording)
        } else if self.signals.contains_key(uri) {
            Some(ResourceKind::Signal)
        } else {
            None
        }
    }

    fn recording(&self, uri: &str) -> Option<RecordingInfo> {
        if let Some(rec) = self.recordings.get(uri) {
            return Some(rec.clone());
        }
        let rec_uri = self.signals.get(uri)?.clone();
        self.recordings.get(&rec_uri).map(|r| r.clone())
    }

    fn register(&self, recording: RecordingInfo) -> Result<(), RepoError> {
        if let Some(taken) = recording
            .signals
            .iter()
            .find(|s| self.signals.contains_key(&s.uri) || self.recordings.contains_key(&s.uri))
        {
            return Err(RepoError::Conflict(taken.uri.clone()));
        }
        match self.recordings.entry(recording.uri.clone()) {
            Entry::Occupied(_) => Err(RepoError::Conflict(recording.uri)),
            Entry::Vacant(slot) => {
                for s in &recording.signals {
                    self.signals.insert(s.uri.clone(), recording.uri.clone());
                }
                tracing::debug!(
                    uri = %recording.uri,
                    signals = recording.signals.len(),
                    "recording registered"
                );
                slot.insert(recording);
                Ok(())
            }
        }
    }

    fn deregister(&self, uri: &str) -> Option<RecordingInfo> {
        let (_, removed) = self.recordings.remove(uri)?;
        for s in &removed.signals {
            self.signals.remove(&s.uri);
        }
        tracing::debug!(uri, "recording deregistered");
        Some(removed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepoError {
    #[error("'{0}' is already in the repository")]
    Conflict(String),
}
