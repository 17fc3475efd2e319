//! Recording formats and the signal-reading capability.
//!
//! A [`RecordingFormat`] opens a recording's backing file; the opened
//! recording hands out one [`SignalRead`] per signal. Everything above this
//! module sees signals only through `SignalRead::read`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bsml_core::{SampleChunk, Segment, Selection, TimeInterval};

use crate::repository::{RecordingInfo, SignalInfo};

/// Lazy sequence of sample chunks produced by a reader.
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<SampleChunk, SignalError>> + Send + 'a>;

/// The signal-reading capability.
pub trait SignalRead: Send + Sync {
    /// Read the selected samples in chunks of at most `points` (0 = reader's choice).
    fn read(&self, selection: Selection, points: usize) -> Result<ChunkIter<'_>, SignalError>;

    /// Uniform sample rate, if the signal has one.
    fn rate(&self) -> Option<f64>;
}

/// A recording opened from its backing source.
pub trait OpenRecording: Send + Sync {
    fn info(&self) -> &RecordingInfo;

    fn signal(&self, uri: &str) -> Option<Arc<dyn SignalRead>>;
}

/// A file format that can open recordings.
pub trait RecordingFormat: Send + Sync {
    fn mimetype(&self) -> &str;

    fn open(&self, source: &Path, uri: &str) -> Result<Box<dyn OpenRecording>, FormatError>;
}

/// Resolved reference to one signal, valid for the duration of one request.
#[derive(Clone)]
pub struct SignalHandle {
    pub uri: String,
    pub recording: String,
    pub reader: Arc<dyn SignalRead>,
}

impl std::fmt::Debug for SignalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHandle")
            .field("uri", &self.uri)
            .field("recording", &self.recording)
            .field("rate", &self.reader.rate())
            .finish()
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Maps native mimetypes to format implementations.
#[derive(Clone, Default)]
pub struct FormatRegistry {
    formats: HashMap<String, Arc<dyn RecordingFormat>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in format.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SigTextFormat));
        registry
    }

    pub fn register(&mut self, format: Arc<dyn RecordingFormat>) {
        self.formats.insert(format.mimetype().to_string(), format);
    }

    pub fn get(&self, mimetype: &str) -> Option<Arc<dyn RecordingFormat>> {
        self.formats.get(mimetype).cloned()
    }

    pub fn contains(&self, mimetype: &str) -> bool {
        self.formats.contains_key(mimetype)
    }

    /// Open a catalogued recording through its format.
    pub fn open(&self, recording: &RecordingInfo) -> Result<Box<dyn OpenRecording>, FormatError> {
        let format = self
            .get(&recording.format)
            .ok_or_else(|| FormatError::Unsupported(recording.format.clone()))?;
        let source = recording
            .source
            .as_deref()
            .ok_or_else(|| FormatError::MissingSource(recording.uri.clone()))?;
        format.open(source, &recording.uri)
    }
}

// ── In-memory signal ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum BufferTiming {
    Rate(f64),
    Clock(Arc<Vec<f64>>),
}

/// Signal held entirely in memory, uniform or explicitly clocked.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    timing: BufferTiming,
    samples: Arc<Vec<f64>>,
}

/// Tolerance when mapping times onto sample indices.
const INDEX_EPSILON: f64 = 1e-9;

impl SampleBuffer {
    pub fn uniform(rate: f64, samples: Vec<f64>) -> Self {
        Self {
            timing: BufferTiming::Rate(rate),
            samples: Arc::new(samples),
        }
    }

    /// `times` must be non-decreasing and as long as `samples`.
    pub fn clocked(times: Vec<f64>, samples: Vec<f64>) -> Result<Self, SignalError> {
        if times.len() != samples.len() {
            return Err(SignalError::Read(format!(
                "clock has {} ticks for {} samples",
                times.len(),
                samples.len()
            )));
        }
        if times.windows(2).any(|w| w[1] < w[0]) {
            return Err(SignalError::Read("clock is not monotonic".into()));
        }
        Ok(Self {
            timing: BufferTiming::Clock(Arc::new(times)),
            samples: Arc::new(samples),
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> f64 {
        match &self.timing {
            BufferTiming::Rate(r) => self.samples.len() as f64 / r,
            BufferTiming::Clock(t) => match (t.first(), t.last()) {
                (Some(a), Some(b)) => b - a,
                _ => 0.0,
            },
        }
    }

    /// Index range `[first, end)` covered by `selection`.
    fn index_range(&self, selection: Selection) -> (usize, usize) {
        let len = self.samples.len();
        let (first, end) = match selection {
            Selection::All => (0, len),
            Selection::Segment(Segment { offset, count }) => (offset, offset.saturating_add(count)),
            Selection::Interval(interval) => self.interval_range(interval),
        };
        let end = end.min(len);
        (first.min(end), end)
    }

    fn interval_range(&self, interval: TimeInterval) -> (usize, usize) {
        match &self.timing {
            BufferTiming::Rate(rate) => {
                let index = |t: f64| (t * rate - INDEX_EPSILON).ceil().max(0.0) as usize;
                (index(interval.start), index(interval.end()))
            }
            BufferTiming::Clock(times) => (
                times.partition_point(|&t| t < interval.start),
                times.partition_point(|&t| t < interval.end()),
            ),
        }
    }

    fn chunk(&self, first: usize, end: usize) -> SampleChunk {
        let samples = self.samples[first..end].to_vec();
        match &self.timing {
            BufferTiming::Rate(rate) => SampleChunk::uniform(first as f64 / rate, *rate, samples),
            BufferTiming::Clock(times) => SampleChunk::clocked(times[first..end].to_vec(), samples),
        }
    }
}

impl SignalRead for SampleBuffer {
    fn read(&self, selection: Selection, points: usize) -> Result<ChunkIter<'_>, SignalError> {
        let (first, end) = self.index_range(selection);
        let step = if points == 0 { (end - first).max(1) } else { points };
        Ok(Box::new(
            (first..end)
                .step_by(step)
                .map(move |at| Ok(self.chunk(at, (at + step).min(end)))),
        ))
    }

    fn rate(&self) -> Option<f64> {
        match self.timing {
            BufferTiming::Rate(r) => Some(r),
            BufferTiming::Clock(_) => None,
        }
    }
}

// ── application/x-sigtext ─────────────────────────────────────────────────────

pub const SIGTEXT_MIMETYPE: &str = "application/x-sigtext";

/// Plain-text multi-signal recording.
///
/// ```text
/// rate=250
/// ecg,resp
/// 0.12,1.5
/// 0.15,1.4
/// ```
pub struct SigTextFormat;

impl SigTextFormat {
    /// Render columns in this format. Every column must be the same length.
    pub fn render(rate: f64, labels: &[&str], columns: &[Vec<f64>]) -> String {
        let mut out = format!("rate={rate}\n{}\n", labels.join(","));
        let rows = columns.first().map_or(0, Vec::len);
        for i in 0..rows {
            let row: Vec<String> = columns.iter().map(|c| c[i].to_string()).collect();
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    pub fn parse(text: &str, uri: &str) -> Result<SigTextRecording, FormatError> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        let rate_line = lines
            .next()
            .ok_or_else(|| FormatError::Parse("empty recording".into()))?;
        let rate: f64 = rate_line
            .strip_prefix("rate=")
            .and_then(|r| r.trim().parse().ok())
            .filter(|r: &f64| r.is_finite() && *r > 0.0)
            .ok_or_else(|| FormatError::Parse(format!("bad rate line '{rate_line}'")))?;

        let labels: Vec<String> = lines
            .next()
            .ok_or_else(|| FormatError::Parse("missing signal labels".into()))?
            .split(',')
            .map(|l| l.trim().to_string())
            .collect();
        if labels.iter().any(String::is_empty) {
            return Err(FormatError::Parse("empty signal label".into()));
        }

        let mut columns = vec![Vec::new(); labels.len()];
        for (row_no, line) in lines.enumerate() {
            let values: Vec<&str> = line.split(',').collect();
            if values.len() != labels.len() {
                return Err(FormatError::Parse(format!(
                    "row {} has {} values, expected {}",
                    row_no + 1,
                    values.len(),
                    labels.len()
                )));
            }
            for (column, value) in columns.iter_mut().zip(values) {
                let v: f64 = value.trim().parse().map_err(|_| {
                    FormatError::Parse(format!("row {}: bad value '{value}'", row_no + 1))
                })?;
                column.push(v);
            }
        }

        let rows = columns.first().map_or(0, Vec::len);
        let signals: Vec<(SignalInfo, Arc<dyn SignalRead>)> = labels
            .into_iter()
            .zip(columns)
            .map(|(label, samples)| {
                let info = SignalInfo {
                    uri: format!("{uri}/signal/{label}"),
                    label,
                    rate: Some(rate),
                };
                let reader: Arc<dyn SignalRead> = Arc::new(SampleBuffer::uniform(rate, samples));
                (info, reader)
            })
            .collect();

        Ok(SigTextRecording {
            info: RecordingInfo {
                uri: uri.to_string(),
                format: SIGTEXT_MIMETYPE.to_string(),
                source: None,
                duration: Some(rows as f64 / rate),
                digest: None,
                signals: signals.iter().map(|(i, _)| i.clone()).collect(),
            },
            signals,
        })
    }
}

impl RecordingFormat for SigTextFormat {
    fn mimetype(&self) -> &str {
        SIGTEXT_MIMETYPE
    }

    fn open(&self, source: &Path, uri: &str) -> Result<Box<dyn OpenRecording>, FormatError> {
        let text = std::fs::read_to_string(source)
            .map_err(|e| FormatError::Io(source.to_path_buf(), e))?;
        let mut recording = Self::parse(&text, uri)?;
        recording.info.source = Some(source.to_path_buf());
        Ok(Box::new(recording))
    }
}

pub struct SigTextRecording {
    info: RecordingInfo,
    signals: Vec<(SignalInfo, Arc<dyn SignalRead>)>,
}

impl OpenRecording for SigTextRecording {
    fn info(&self) -> &RecordingInfo {
        &self.info
    }

    fn signal(&self, uri: &str) -> Option<Arc<dyn SignalRead>> {
        self.signals
            .iter()
            .find(|(info, _)| info.uri == uri)
            .map(|(_, reader)| reader.clone())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure reading or converting one signal. Scoped to that signal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalError {
    #[error("read failed: {0}")]
    Read(String),

    #[error("rate conversion failed: {0}")]
    Conversion(String),

    #[error("block encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("recording '{0}' has no source")]
    MissingSource(String),

    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("invalid recording: {0}")]
    Parse(String),
}
