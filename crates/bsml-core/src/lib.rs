//! bsml-core — block wire format, request types, and configuration.
//! All other BSML crates depend on this one.

pub mod config;
pub mod request;
pub mod signal;
pub mod wire;

pub use request::{DataRequest, RequestError, Segment, Selection, TimeInterval, UriSpec};
pub use signal::{ErrorCode, ErrorReport, SampleChunk, SignalData, Timing};
pub use wire::{Block, BlockDecoder, BlockType, ChecksumMode, CodecError, Header};
