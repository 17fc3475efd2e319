//! bsml-services — the streaming engine behind both transports: catalog,
//! recording formats, windowing, rate conversion, sessions, and ingestion.

pub mod format;
pub mod ingest;
pub mod metadata;
pub mod repository;
pub mod resample;
pub mod session;
pub mod transport;
pub mod windower;

pub use format::{
    FormatError, FormatRegistry, OpenRecording, RecordingFormat, SampleBuffer, SigTextFormat,
    SignalError, SignalHandle, SignalRead, SIGTEXT_MIMETYPE,
};
pub use ingest::{IngestError, RecordingStore, Upload};
pub use metadata::{describe, MetadataFormat};
pub use repository::{MemoryRepository, RecordingInfo, RepoError, Repository, ResourceKind, SignalInfo};
pub use resample::RateConverter;
pub use session::{Flow, SessionState, SignalOutcome, StreamContext, StreamSession};
pub use transport::{serve_connections, ChunkWriter, FramedWriter, SocketWriter, TransportError};
pub use windower::SignalWindower;
