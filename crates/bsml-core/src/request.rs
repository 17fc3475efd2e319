//! Data requests: what a client asks for in a DATA_REQ block.
//!
//! Validation happens here, before any streaming begins, so a bad request
//! produces a single ERROR block and nothing else.

use std::fmt;

use serde_json::Value;

use crate::wire::{Block, BlockType, Header};

// ── Interval and segment ──────────────────────────────────────────────────────

/// Time-domain selection `[start, start + duration)`, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeInterval {
    pub start: f64,
    pub duration: f64,
}

impl TimeInterval {
    pub fn new(start: f64, duration: f64) -> Result<Self, RequestError> {
        if !start.is_finite() || start < 0.0 {
            return Err(RequestError::InvalidInterval(format!(
                "start must be a non-negative number, got {start}"
            )));
        }
        if !duration.is_finite() || duration <= 0.0 {
            return Err(RequestError::InvalidInterval(format!(
                "duration must be positive, got {duration}"
            )));
        }
        Ok(Self { start, duration })
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Parse `"start-end"` or `"start:length"`.
    pub fn parse(text: &str) -> Result<Self, RequestError> {
        let invalid = || RequestError::InvalidInterval(format!("invalid time interval '{text}'"));
        let text = text.trim();
        let (start, duration) = if let Some((a, b)) = text.split_once('-') {
            let start: f64 = a.trim().parse().map_err(|_| invalid())?;
            let end: f64 = b.trim().parse().map_err(|_| invalid())?;
            (start, end - start)
        } else if let Some((a, b)) = text.split_once(':') {
            let start: f64 = a.trim().parse().map_err(|_| invalid())?;
            let length: f64 = b.trim().parse().map_err(|_| invalid())?;
            (start, length)
        } else {
            return Err(invalid());
        };
        Self::new(start, duration).map_err(|_| invalid())
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.duration)
    }
}

/// Index-domain selection `[offset, offset + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: usize,
    pub count: usize,
}

impl Segment {
    pub fn new(offset: usize, count: usize) -> Result<Self, RequestError> {
        if count == 0 {
            return Err(RequestError::InvalidSegment("count must be positive".into()));
        }
        Ok(Self { offset, count })
    }

    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.count)
    }
}

/// Which part of a signal to read. A segment always wins over an interval.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Selection {
    #[default]
    All,
    Interval(TimeInterval),
    Segment(Segment),
}

impl Selection {
    pub fn from_parts(interval: Option<TimeInterval>, segment: Option<Segment>) -> Self {
        match (segment, interval) {
            (Some(s), _) => Selection::Segment(s),
            (None, Some(i)) => Selection::Interval(i),
            (None, None) => Selection::All,
        }
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// The `uri` field of a request: one URI (signal or recording) or a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriSpec {
    One(String),
    Many(Vec<String>),
}

/// A validated DATA_REQ.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequest {
    pub uri: UriSpec,
    pub interval: Option<TimeInterval>,
    pub segment: Option<Segment>,
    /// Points-per-block cap from the client. `None` means no request cap.
    pub maxsize: Option<usize>,
    /// Target sample rate for on-the-fly conversion.
    pub rate: Option<f64>,
}

impl DataRequest {
    pub fn new(uri: UriSpec) -> Self {
        Self {
            uri,
            interval: None,
            segment: None,
            maxsize: None,
            rate: None,
        }
    }

    pub fn selection(&self) -> Selection {
        Selection::from_parts(self.interval, self.segment)
    }

    pub fn from_block(block: &Block) -> Result<Self, RequestError> {
        if block.kind != BlockType::DataReq {
            return Err(RequestError::UnexpectedBlock(block.kind));
        }
        Self::from_header(&block.header)
    }

    pub fn from_header(header: &Header) -> Result<Self, RequestError> {
        let uri = match header.get("uri") {
            Some(Value::String(s)) if !s.is_empty() => UriSpec::One(s.clone()),
            Some(Value::Array(items)) => {
                let uris = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| RequestError::InvalidField("uri", "list entries must be strings".into()))?;
                UriSpec::Many(uris)
            }
            Some(_) => {
                return Err(RequestError::InvalidField(
                    "uri",
                    "must be a string or a list of strings".into(),
                ))
            }
            None => return Err(RequestError::MissingUri),
        };

        let start = number(header, "start")?;
        let duration = number(header, "duration")?;
        let interval = match (start, duration) {
            (None, None) => None,
            (start, Some(duration)) => Some(TimeInterval::new(start.unwrap_or(0.0), duration)?),
            (Some(_), None) => {
                return Err(RequestError::InvalidInterval("start given without duration".into()))
            }
        };

        let offset = count(header, "offset")?;
        let count_ = count(header, "count")?;
        let segment = match (offset, count_) {
            (None, None) => None,
            (offset, Some(n)) => Some(Segment::new(offset.unwrap_or(0), n)?),
            (Some(_), None) => {
                return Err(RequestError::InvalidSegment("offset given without count".into()))
            }
        };

        let maxsize = count(header, "maxsize")?.filter(|&n| n > 0);

        let rate = number(header, "rate")?;
        if let Some(r) = rate {
            if !r.is_finite() || r <= 0.0 {
                return Err(RequestError::InvalidField("rate", format!("must be positive, got {r}")));
            }
        }

        Ok(Self {
            uri,
            interval,
            segment,
            maxsize,
            rate,
        })
    }

    pub fn to_header(&self) -> Header {
        let mut header = Header::new();
        match &self.uri {
            UriSpec::One(u) => header.insert("uri", u.as_str()),
            UriSpec::Many(us) => header.insert("uri", us.clone()),
        }
        if let Some(i) = self.interval {
            header.insert("start", i.start);
            header.insert("duration", i.duration);
        }
        if let Some(s) = self.segment {
            header.insert("offset", s.offset as u64);
            header.insert("count", s.count as u64);
        }
        if let Some(m) = self.maxsize {
            header.insert("maxsize", m as u64);
        }
        if let Some(r) = self.rate {
            header.insert("rate", r);
        }
        header
    }

    pub fn to_block(&self) -> Block {
        Block::new(BlockType::DataReq, self.to_header(), bytes::Bytes::new())
    }
}

fn number(header: &Header, key: &'static str) -> Result<Option<f64>, RequestError> {
    match header.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| RequestError::InvalidField(key, "must be a number".into())),
    }
}

fn count(header: &Header, key: &'static str) -> Result<Option<usize>, RequestError> {
    match header.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| RequestError::InvalidField(key, "must be a non-negative integer".into())),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("request has no uri")]
    MissingUri,

    #[error("invalid '{0}': {1}")]
    InvalidField(&'static str, String),

    #[error("{0}")]
    InvalidInterval(String),

    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    #[error("unexpected {0} block, expected DATA_REQ")]
    UnexpectedBlock(BlockType),

    #[error("unknown resource: {0}")]
    UnknownResource(String),
}
