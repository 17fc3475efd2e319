//! Sample chunks and the response blocks that carry them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::wire::{Block, BlockType, Header, SAMPLE_WIDTH};

/// How sample times are known.
#[derive(Debug, Clone, PartialEq)]
pub enum Timing {
    /// Uniform sampling at this rate in Hz.
    Rate(f64),
    /// Explicit time, in seconds, of every sample.
    Clock(Vec<f64>),
}

/// A contiguous run of samples from one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleChunk {
    /// Time of the first sample, in seconds.
    pub start: f64,
    pub timing: Timing,
    pub samples: Vec<f64>,
}

impl SampleChunk {
    pub fn uniform(start: f64, rate: f64, samples: Vec<f64>) -> Self {
        Self {
            start,
            timing: Timing::Rate(rate),
            samples,
        }
    }

    /// Build a clocked chunk. `start` is taken from the first clock tick.
    pub fn clocked(times: Vec<f64>, samples: Vec<f64>) -> Self {
        Self {
            start: times.first().copied().unwrap_or(0.0),
            timing: Timing::Clock(times),
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn rate(&self) -> Option<f64> {
        match self.timing {
            Timing::Rate(r) => Some(r),
            Timing::Clock(_) => None,
        }
    }

    /// Split off the first `n` samples, keeping timing consistent on both halves.
    pub fn split_front(&mut self, n: usize) -> SampleChunk {
        let n = n.min(self.samples.len());
        let rest = self.samples.split_off(n);
        let front = std::mem::replace(&mut self.samples, rest);
        match &mut self.timing {
            Timing::Rate(rate) => {
                let rate = *rate;
                let head = SampleChunk::uniform(self.start, rate, front);
                self.start += n as f64 / rate;
                head
            }
            Timing::Clock(times) => {
                let rest_times = times.split_off(n.min(times.len()));
                let head_times = std::mem::replace(times, rest_times);
                if let Some(&t) = times.first() {
                    self.start = t;
                }
                SampleChunk::clocked(head_times, front)
            }
        }
    }
}

// ── SIGNAL_DATA ───────────────────────────────────────────────────────────────

/// One SIGNAL_DATA block: `{uri, start, count, rate | clock}` + f64 LE payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalData {
    pub uri: String,
    pub chunk: SampleChunk,
}

impl SignalData {
    pub fn new(uri: impl Into<String>, chunk: SampleChunk) -> Self {
        Self {
            uri: uri.into(),
            chunk,
        }
    }

    pub fn to_block(&self) -> Block {
        let mut header = Header::new()
            .with("uri", self.uri.as_str())
            .with("start", self.chunk.start)
            .with("count", self.chunk.samples.len() as u64);
        match &self.chunk.timing {
            Timing::Rate(r) => header.insert("rate", *r),
            Timing::Clock(times) => header.insert("clock", times.clone()),
        }
        let mut payload = BytesMut::with_capacity(self.chunk.samples.len() * SAMPLE_WIDTH);
        for &s in &self.chunk.samples {
            payload.put_f64_le(s);
        }
        Block::new(BlockType::SignalData, header, payload.freeze())
    }

    pub fn from_block(block: &Block) -> Option<Self> {
        if block.kind != BlockType::SignalData || block.payload.len() % SAMPLE_WIDTH != 0 {
            return None;
        }
        let uri = block.header.get("uri")?.as_str()?.to_string();
        let start = block.header.get("start")?.as_f64()?;
        let mut payload: Bytes = block.payload.clone();
        let mut samples = Vec::with_capacity(payload.len() / SAMPLE_WIDTH);
        while payload.has_remaining() {
            samples.push(payload.get_f64_le());
        }
        let timing = if let Some(rate) = block.header.get("rate") {
            Timing::Rate(rate.as_f64()?)
        } else {
            let times = block
                .header
                .get("clock")?
                .as_array()?
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<_>>>()?;
            Timing::Clock(times)
        };
        Some(Self {
            uri,
            chunk: SampleChunk {
                start,
                timing,
                samples,
            },
        })
    }
}

// ── ERROR ─────────────────────────────────────────────────────────────────────

/// Machine-checkable code carried by every ERROR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Request = 1,
    NotFound = 2,
    SignalRead = 3,
    Framing = 4,
    Checksum = 5,
}

impl ErrorCode {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(Self::Request),
            2 => Some(Self::NotFound),
            3 => Some(Self::SignalRead),
            4 => Some(Self::Framing),
            5 => Some(Self::Checksum),
            _ => None,
        }
    }
}

/// One ERROR block: `{code, uri?, request, message}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub code: ErrorCode,
    /// The signal that failed, when the failure is scoped to one signal.
    pub uri: Option<String>,
    /// Echo of the offending request header.
    pub request: Option<Value>,
    pub message: String,
}

impl ErrorReport {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            uri: None,
            request: None,
            message: message.into(),
        }
    }

    pub fn for_signal(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn echoing(mut self, request: &Header) -> Self {
        self.request = Some(request.to_value());
        self
    }

    pub fn to_block(&self) -> Block {
        let mut header = Header::new().with("code", self.code as i64);
        if let Some(uri) = &self.uri {
            header.insert("uri", uri.as_str());
        }
        if let Some(request) = &self.request {
            // Nested objects are not valid header values; carry the echo as text.
            header.insert("request", request.to_string());
        }
        header.insert("message", self.message.as_str());
        Block::new(BlockType::Error, header, Bytes::new())
    }

    pub fn from_block(block: &Block) -> Option<Self> {
        if block.kind != BlockType::Error {
            return None;
        }
        let code = ErrorCode::from_i64(block.header.get("code")?.as_i64()?)?;
        let message = block.header.get("message")?.as_str()?.to_string();
        let uri = block
            .header
            .get("uri")
            .and_then(Value::as_str)
            .map(str::to_string);
        let request = block
            .header
            .get("request")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str(s).ok());
        Some(Self {
            code,
            uri,
            request,
            message,
        })
    }
}
