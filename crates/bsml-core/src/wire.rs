//! Block wire format: the framing shared by the socket and HTTP transports.
//!
//! Every block on the wire is laid out as:
//!
//! ```text
//! +-----+---------+------+-------+------------+-------------+--------+---------+----------+
//! | '#' | version | type | flags | header_len | payload_len | header | payload | checksum |
//! +-----+---------+------+-------+------------+-------------+--------+---------+----------+
//!   1       1        1      1      u32 BE        u32 BE        JSON     bytes    32 bytes
//!                                                                              (optional)
//! ```
//!
//! The header is a UTF-8 JSON object whose values are scalars or lists of
//! scalars. Field order is insertion order, both when encoding and decoding.
//! The checksum trailer is a BLAKE3 digest over `type ++ header ++ payload`
//! and is present iff bit 0 of `flags` is set.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Constants ─────────────────────────────────────────────────────────────────

/// First byte of every block. Lets the receiver detect misaligned reads.
pub const MAGIC: u8 = b'#';

/// Current block format version.
pub const BLOCK_VERSION: u8 = 0x01;

/// Fixed prelude: magic + version + type + flags + two u32 lengths.
pub const PRELUDE_LEN: usize = 12;

/// Size of the checksum trailer.
pub const CHECKSUM_LEN: usize = 32;

/// Largest header accepted by the decoder.
pub const MAX_HEADER: usize = 1024 * 1024;

/// Largest payload accepted by the decoder.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Bytes per sample in a SIGNAL_DATA payload (little-endian f64).
pub const SAMPLE_WIDTH: usize = 8;

const FLAG_CHECKSUM: u8 = 0x01;
const FLAGS_RESERVED: u8 = !FLAG_CHECKSUM;

// ── Block type ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// Client request for signal data.
    DataReq,
    /// One chunk of samples for one signal.
    SignalData,
    /// Failure report. Never fatal to the connection by itself.
    Error,
}

impl BlockType {
    pub fn as_byte(self) -> u8 {
        match self {
            BlockType::DataReq => b'R',
            BlockType::SignalData => b'D',
            BlockType::Error => b'E',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'R' => Some(BlockType::DataReq),
            b'D' => Some(BlockType::SignalData),
            b'E' => Some(BlockType::Error),
            _ => None,
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockType::DataReq => "DATA_REQ",
            BlockType::SignalData => "SIGNAL_DATA",
            BlockType::Error => "ERROR",
        };
        f.write_str(name)
    }
}

// ── Checksum mode ─────────────────────────────────────────────────────────────

/// Integrity policy for a connection or request.
///
/// `Check` accepts a block without a trailer but rejects a wrong one.
/// `Strict` rejects both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    None,
    #[default]
    Check,
    Strict,
}

impl FromStr for ChecksumMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ChecksumMode::None),
            "check" => Ok(ChecksumMode::Check),
            "strict" => Ok(ChecksumMode::Strict),
            other => Err(format!("unknown checksum mode: {other}")),
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Ordered key → value mapping carried by every block.
///
/// Values are JSON scalars or lists of scalars. Iteration and encoding
/// follow insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header(Map<String, Value>);

impl Header {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder form of [`Header::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The header as a JSON value, e.g. for echoing a request back.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    fn to_bytes(&self) -> Vec<u8> {
        // A Map of JSON values always serializes.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    fn from_bytes(raw: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| CodecError::Malformed(format!("header is not valid JSON: {e}")))?;
        let Value::Object(map) = value else {
            return Err(CodecError::Malformed("header is not a JSON object".into()));
        };
        for (key, value) in &map {
            if !is_header_value(value) {
                return Err(CodecError::Malformed(format!(
                    "header field '{key}' is not a scalar or list of scalars"
                )));
            }
        }
        Ok(Self(map))
    }
}

fn is_header_value(value: &Value) -> bool {
    match value {
        Value::Object(_) => false,
        Value::Array(items) => items
            .iter()
            .all(|v| !matches!(v, Value::Array(_) | Value::Object(_))),
        _ => true,
    }
}

// ── Block ─────────────────────────────────────────────────────────────────────

/// One logical unit of the streaming protocol.
///
/// The checksum is a property of the frame, not of the block: it is produced
/// by [`encode`] and consumed by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockType,
    pub header: Header,
    pub payload: Bytes,
}

impl Block {
    pub fn new(kind: BlockType, header: Header, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            header,
            payload: payload.into(),
        }
    }
}

/// BLAKE3 digest over `type ++ header ++ payload`.
pub fn block_digest(kind: BlockType, header_raw: &[u8], payload: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[kind.as_byte()]);
    hasher.update(header_raw);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode a block. A checksum trailer is written for `Check` and `Strict`.
pub fn encode(block: &Block, mode: ChecksumMode) -> Result<Bytes, CodecError> {
    let header_raw = block.header.to_bytes();
    if header_raw.len() > MAX_HEADER {
        return Err(CodecError::HeaderTooLarge(header_raw.len()));
    }
    if block.payload.len() > MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(block.payload.len()));
    }

    let with_checksum = mode != ChecksumMode::None;
    let total = PRELUDE_LEN
        + header_raw.len()
        + block.payload.len()
        + if with_checksum { CHECKSUM_LEN } else { 0 };

    let mut out = BytesMut::with_capacity(total);
    out.put_u8(MAGIC);
    out.put_u8(BLOCK_VERSION);
    out.put_u8(block.kind.as_byte());
    out.put_u8(if with_checksum { FLAG_CHECKSUM } else { 0 });
    out.put_u32(header_raw.len() as u32);
    out.put_u32(block.payload.len() as u32);
    out.put_slice(&header_raw);
    out.put_slice(&block.payload);
    if with_checksum {
        out.put_slice(&block_digest(block.kind, &header_raw, &block.payload));
    }
    Ok(out.freeze())
}

// ── Decoding ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Prelude {
    kind: BlockType,
    has_checksum: bool,
    header_len: usize,
    payload_len: usize,
}

impl Prelude {
    fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes[0] != MAGIC {
            return Err(CodecError::Malformed(format!(
                "bad magic: expected 0x{MAGIC:02x}, got 0x{:02x}",
                bytes[0]
            )));
        }
        if bytes[1] != BLOCK_VERSION {
            return Err(CodecError::Malformed(format!(
                "unsupported block version 0x{:02x}",
                bytes[1]
            )));
        }
        let kind = BlockType::from_byte(bytes[2]).ok_or_else(|| {
            CodecError::Malformed(format!("unknown block type 0x{:02x}", bytes[2]))
        })?;
        let flags = bytes[3];
        if flags & FLAGS_RESERVED != 0 {
            return Err(CodecError::Malformed(format!(
                "reserved flags are non-zero: 0x{flags:02x}"
            )));
        }
        let mut lengths = &bytes[4..PRELUDE_LEN];
        let header_len = lengths.get_u32() as usize;
        let payload_len = lengths.get_u32() as usize;
        if header_len > MAX_HEADER {
            return Err(CodecError::HeaderTooLarge(header_len));
        }
        if payload_len > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            kind,
            has_checksum: flags & FLAG_CHECKSUM != 0,
            header_len,
            payload_len,
        })
    }

    fn frame_len(&self) -> usize {
        PRELUDE_LEN
            + self.header_len
            + self.payload_len
            + if self.has_checksum { CHECKSUM_LEN } else { 0 }
    }
}

/// Sample data must fill the payload exactly.
fn check_payload_len(prelude: &Prelude, header: &Header) -> Result<(), CodecError> {
    if prelude.kind != BlockType::SignalData {
        return Ok(());
    }
    if let Some(count) = header.get("count") {
        let declared = count
            .as_u64()
            .ok_or_else(|| CodecError::Malformed("count is not a non-negative integer".into()))?;
        if declared.saturating_mul(SAMPLE_WIDTH as u64) != prelude.payload_len as u64 {
            return Err(CodecError::Malformed(format!(
                "payload of {} bytes does not hold {declared} samples",
                prelude.payload_len
            )));
        }
    }
    Ok(())
}

/// Outcome of a one-shot [`decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Complete { block: Block, consumed: usize },
    Incomplete,
}

/// Decode the first block in `buf`.
///
/// Returns `Incomplete` when `buf` holds only a prefix of a block.
pub fn decode(buf: &[u8], mode: ChecksumMode) -> Result<Decoded, CodecError> {
    if buf.len() < PRELUDE_LEN {
        return Ok(Decoded::Incomplete);
    }
    let prelude = Prelude::parse(&buf[..PRELUDE_LEN])?;
    let consumed = prelude.frame_len();
    if buf.len() < consumed {
        return Ok(Decoded::Incomplete);
    }
    let mut decoder = BlockDecoder::new(mode);
    decoder.push(&buf[..consumed]);
    match decoder.next_block()? {
        Some(block) => Ok(Decoded::Complete { block, consumed }),
        None => Ok(Decoded::Incomplete),
    }
}

enum DecodeState {
    AwaitingHeader,
    AwaitingPayload {
        prelude: Prelude,
        header: Header,
        header_raw: Bytes,
    },
    AwaitingChecksum {
        prelude: Prelude,
        header: Header,
        header_raw: Bytes,
        payload: Bytes,
    },
}

/// Incremental block decoder.
///
/// Bytes are pushed in whatever fragments the transport delivers and blocks
/// are pulled out once complete. After a `Malformed` error the byte stream
/// can no longer be trusted and the decoder should be dropped.
pub struct BlockDecoder {
    mode: ChecksumMode,
    buf: BytesMut,
    state: DecodeState,
}

impl BlockDecoder {
    pub fn new(mode: ChecksumMode) -> Self {
        Self {
            mode,
            buf: BytesMut::with_capacity(4096),
            state: DecodeState::AwaitingHeader,
        }
    }

    pub fn mode(&self) -> ChecksumMode {
        self.mode
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet part of a returned block.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True when no partial block is pending.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::AwaitingHeader) && self.buf.is_empty()
    }

    /// Pull the next complete block, or `None` if more bytes are needed.
    pub fn next_block(&mut self) -> Result<Option<Block>, CodecError> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::AwaitingHeader) {
                DecodeState::AwaitingHeader => {
                    if self.buf.len() < PRELUDE_LEN {
                        return Ok(None);
                    }
                    let prelude = Prelude::parse(&self.buf[..PRELUDE_LEN])?;
                    if !prelude.has_checksum && self.mode == ChecksumMode::Strict {
                        return Err(CodecError::Malformed(
                            "checksum trailer required in strict mode".into(),
                        ));
                    }
                    if self.buf.len() < PRELUDE_LEN + prelude.header_len {
                        return Ok(None);
                    }
                    self.buf.advance(PRELUDE_LEN);
                    let header_raw = self.buf.split_to(prelude.header_len).freeze();
                    let header = Header::from_bytes(&header_raw)?;
                    check_payload_len(&prelude, &header)?;
                    self.state = DecodeState::AwaitingPayload {
                        prelude,
                        header,
                        header_raw,
                    };
                }
                DecodeState::AwaitingPayload {
                    prelude,
                    header,
                    header_raw,
                } => {
                    if self.buf.len() < prelude.payload_len {
                        self.state = DecodeState::AwaitingPayload {
                            prelude,
                            header,
                            header_raw,
                        };
                        return Ok(None);
                    }
                    let payload = self.buf.split_to(prelude.payload_len).freeze();
                    if !prelude.has_checksum {
                        return Ok(Some(Block::new(prelude.kind, header, payload)));
                    }
                    self.state = DecodeState::AwaitingChecksum {
                        prelude,
                        header,
                        header_raw,
                        payload,
                    };
                }
                DecodeState::AwaitingChecksum {
                    prelude,
                    header,
                    header_raw,
                    payload,
                } => {
                    if self.buf.len() < CHECKSUM_LEN {
                        self.state = DecodeState::AwaitingChecksum {
                            prelude,
                            header,
                            header_raw,
                            payload,
                        };
                        return Ok(None);
                    }
                    let trailer = self.buf.split_to(CHECKSUM_LEN);
                    if self.mode != ChecksumMode::None
                        && block_digest(prelude.kind, &header_raw, &payload)[..] != trailer[..]
                    {
                        return Err(CodecError::ChecksumMismatch);
                    }
                    return Ok(Some(Block::new(prelude.kind, header, payload)));
                }
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when framing or unframing blocks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed block: {0}")]
    Malformed(String),

    #[error("block checksum mismatch")]
    ChecksumMismatch,

    #[error("header length {0} exceeds maximum {}", MAX_HEADER)]
    HeaderTooLarge(usize),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),
}

impl CodecError {
    /// Framing errors leave the decoder out of step with the byte stream.
    pub fn is_framing(&self) -> bool {
        !matches!(self, CodecError::ChecksumMismatch)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
