//! Stream sessions: the per-connection block protocol state machine.
//!
//! A session decodes request blocks, resolves the requested URIs against the
//! repository, and streams each signal in turn through the windower and the
//! optional rate converter. A failure reading one signal produces an ERROR
//! block for that signal and the session moves on to the next.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::{Handle, RuntimeFlavor};

use bsml_core::config::StreamingConfig;
use bsml_core::wire::{encode, Block, BlockDecoder, ChecksumMode, Header};
use bsml_core::{
    CodecError, DataRequest, ErrorCode, ErrorReport, RequestError, SampleChunk, SignalData, UriSpec,
};

use crate::format::{FormatRegistry, OpenRecording, SignalError, SignalHandle};
use crate::repository::{Repository, ResourceKind};
use crate::resample::RateConverter;
use crate::transport::{FramedWriter, TransportError};
use crate::windower::SignalWindower;

/// Read buffer size for socket sessions.
const READ_CHUNK: usize = 8 * 1024;

/// Shared, read-only state every session serves from.
pub struct StreamContext {
    pub repository: Arc<dyn Repository>,
    pub formats: Arc<FormatRegistry>,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingRequest,
    Dispatching,
    /// Serving signal `signal` (zero-based) of `of`.
    Streaming {
        signal: usize,
        of: usize,
    },
    Done,
    Closed,
}

/// What happened to one signal of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Streamed { blocks: usize, samples: usize },
    Failed(SignalError),
}

/// Whether the transport should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Why streaming one signal stopped early.
enum Halt {
    Transport(TransportError),
    Signal(SignalError),
}

impl From<TransportError> for Halt {
    fn from(e: TransportError) -> Self {
        Halt::Transport(e)
    }
}

impl From<SignalError> for Halt {
    fn from(e: SignalError) -> Self {
        Halt::Signal(e)
    }
}

/// A requested signal, or the reason it cannot be served.
enum Resolved {
    Ready(SignalHandle),
    Unavailable { uri: String, error: SignalError },
}

pub struct StreamSession<W> {
    ctx: Arc<StreamContext>,
    writer: W,
    decoder: BlockDecoder,
    response_mode: ChecksumMode,
    windower: SignalWindower,
    state: SessionState,
}

impl<W: FramedWriter> StreamSession<W> {
    /// Session with the configured checksum policies.
    pub fn new(ctx: Arc<StreamContext>, writer: W) -> Self {
        let request_mode = ctx.streaming.request_checksum;
        let response_mode = ctx.streaming.response_checksum;
        Self::with_modes(ctx, writer, request_mode, response_mode)
    }

    pub fn with_modes(
        ctx: Arc<StreamContext>,
        writer: W,
        request_mode: ChecksumMode,
        response_mode: ChecksumMode,
    ) -> Self {
        let windower = SignalWindower::new(ctx.streaming.max_points);
        Self {
            ctx,
            writer,
            decoder: BlockDecoder::new(request_mode),
            response_mode,
            windower,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn open(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::AwaitingRequest;
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Drive the session from a byte stream until EOF or close.
    pub async fn run<R: AsyncRead + Unpin + Send>(mut self, mut reader: R) -> Result<(), TransportError> {
        self.open();
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let result = loop {
            buf.clear();
            match reader.read_buf(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e.into()),
            }
            match self.receive(&buf).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.close();
        result
    }

    /// Feed received bytes. Every complete block is handled before returning.
    pub async fn receive(&mut self, bytes: &[u8]) -> Result<Flow, TransportError> {
        if self.state == SessionState::Closed {
            return Err(TransportError::Closed);
        }
        self.open();
        self.decoder.push(bytes);
        loop {
            match self.decoder.next_block() {
                Ok(Some(block)) => {
                    self.handle_block(block).await?;
                    if self.state == SessionState::Done {
                        if self.ctx.streaming.close_after_request {
                            self.close();
                            return Ok(Flow::Close);
                        }
                        self.state = SessionState::AwaitingRequest;
                    }
                }
                Ok(None) => return Ok(Flow::Continue),
                Err(e) => {
                    if self.framing_failure(e).await? == Flow::Close {
                        return Ok(Flow::Close);
                    }
                }
            }
        }
    }

    async fn framing_failure(&mut self, error: CodecError) -> Result<Flow, TransportError> {
        let code = if error.is_framing() {
            ErrorCode::Framing
        } else {
            ErrorCode::Checksum
        };
        tracing::warn!(error = %error, "rejecting malformed block");
        self.send_report(&ErrorReport::new(code, error.to_string())).await?;
        if self.ctx.streaming.close_on_framing_error {
            self.close();
            return Ok(Flow::Close);
        }
        // A checksum mismatch consumes exactly the bad frame, so anything
        // buffered behind it is still aligned. Other errors lose the stream
        // position and the buffer is discarded.
        if error.is_framing() {
            self.decoder = BlockDecoder::new(self.decoder.mode());
        }
        self.state = SessionState::AwaitingRequest;
        Ok(Flow::Continue)
    }

    async fn handle_block(&mut self, block: Block) -> Result<(), TransportError> {
        self.state = SessionState::Dispatching;
        match DataRequest::from_block(&block) {
            Ok(request) => {
                self.serve(&request).await?;
            }
            Err(e) => {
                tracing::debug!(error = %e, kind = %block.kind, "invalid request");
                let report = ErrorReport::new(ErrorCode::Request, e.to_string()).echoing(&block.header);
                self.send_report(&report).await?;
                self.state = SessionState::Done;
            }
        }
        Ok(())
    }

    /// Serve one validated request. Per-signal failures are reported in-band
    /// and returned as outcomes; only transport failures end the call early.
    pub async fn serve(&mut self, request: &DataRequest) -> Result<Vec<SignalOutcome>, TransportError> {
        if self.state == SessionState::Closed {
            return Err(TransportError::Closed);
        }
        self.state = SessionState::Dispatching;
        let echo = request.to_header();

        let resolved = match read_blocking(|| self.resolve(&request.uri)) {
            Ok(resolved) => resolved,
            Err(e) => {
                let code = match e {
                    RequestError::UnknownResource(_) => ErrorCode::NotFound,
                    _ => ErrorCode::Request,
                };
                tracing::debug!(error = %e, "request not resolvable");
                self.send_report(&ErrorReport::new(code, e.to_string()).echoing(&echo)).await?;
                self.state = SessionState::Done;
                return Ok(Vec::new());
            }
        };

        let total = resolved.len();
        tracing::info!(signals = total, "serving data request");
        let mut outcomes = Vec::with_capacity(total);
        for (i, entry) in resolved.into_iter().enumerate() {
            self.state = SessionState::Streaming { signal: i, of: total };
            let outcome = match entry {
                Resolved::Ready(handle) => self.stream_signal(&handle, request, &echo).await?,
                Resolved::Unavailable { uri, error } => {
                    self.report_signal_failure(&uri, &error, &echo).await?;
                    SignalOutcome::Failed(error)
                }
            };
            outcomes.push(outcome);
        }
        self.state = SessionState::Done;
        Ok(outcomes)
    }

    // ── Resolution ────────────────────────────────────────────────────────────

    fn resolve(&self, uri: &UriSpec) -> Result<Vec<Resolved>, RequestError> {
        let repo = self.ctx.repository.as_ref();
        let mut opened: HashMap<String, Result<Arc<dyn OpenRecording>, String>> = HashMap::new();

        match uri {
            UriSpec::One(uri) => match repo.kind(uri) {
                None => Err(RequestError::UnknownResource(uri.clone())),
                Some(ResourceKind::Signal) => Ok(vec![self.resolve_signal(uri, &mut opened)]),
                Some(ResourceKind::Recording) => {
                    let recording = repo
                        .recording(uri)
                        .ok_or_else(|| RequestError::UnknownResource(uri.clone()))?;
                    Ok(recording
                        .signals
                        .iter()
                        .map(|s| self.resolve_signal(&s.uri, &mut opened))
                        .collect())
                }
            },
            UriSpec::Many(uris) => {
                let mut resolved = Vec::with_capacity(uris.len());
                for uri in uris {
                    if repo.is_signal(uri) {
                        resolved.push(self.resolve_signal(uri, &mut opened));
                    } else {
                        tracing::warn!(uri = %uri, "skipping list entry that is not a known signal");
                    }
                }
                if resolved.is_empty() && !uris.is_empty() {
                    return Err(RequestError::UnknownResource(uris.join(", ")));
                }
                Ok(resolved)
            }
        }
    }

    /// Resolve one signal, opening its recording at most once per request.
    fn resolve_signal(
        &self,
        uri: &str,
        opened: &mut HashMap<String, Result<Arc<dyn OpenRecording>, String>>,
    ) -> Resolved {
        let unavailable = |message: String| Resolved::Unavailable {
            uri: uri.to_string(),
            error: SignalError::Read(message),
        };
        let Some(recording) = self.ctx.repository.recording(uri) else {
            return unavailable("signal has no recording".into());
        };
        let open = opened
            .entry(recording.uri.clone())
            .or_insert_with(|| {
                self.ctx
                    .formats
                    .open(&recording)
                    .map(Arc::from)
                    .map_err(|e| e.to_string())
            })
            .clone();
        match open {
            Err(e) => unavailable(format!("cannot open recording: {e}")),
            Ok(open) => match open.signal(uri) {
                Some(reader) => Resolved::Ready(SignalHandle {
                    uri: uri.to_string(),
                    recording: recording.uri,
                    reader,
                }),
                None => unavailable("signal missing from recording source".into()),
            },
        }
    }

    // ── Streaming ─────────────────────────────────────────────────────────────

    async fn stream_signal(
        &mut self,
        handle: &SignalHandle,
        request: &DataRequest,
        echo: &Header,
    ) -> Result<SignalOutcome, TransportError> {
        match self.pump(handle, request).await {
            Ok((blocks, samples)) => {
                tracing::debug!(uri = %handle.uri, blocks, samples, "signal streamed");
                Ok(SignalOutcome::Streamed { blocks, samples })
            }
            Err(Halt::Transport(e)) => Err(e),
            Err(Halt::Signal(e)) => {
                self.report_signal_failure(&handle.uri, &e, echo).await?;
                Ok(SignalOutcome::Failed(e))
            }
        }
    }

    async fn pump(&mut self, handle: &SignalHandle, request: &DataRequest) -> Result<(usize, usize), Halt> {
        let windower = self.windower;
        let limit = windower.limit(request.maxsize);
        let mut windows =
            read_blocking(|| windower.windows(handle, request.selection(), request.maxsize))?;
        let mut converter = request.rate.map(RateConverter::new).transpose()?;

        let (mut blocks, mut samples) = (0, 0);
        while let Some(next) = read_blocking(|| windows.next()) {
            let mut chunk = next?;
            if let Some(conv) = converter.as_mut() {
                chunk = conv.convert(chunk)?;
            }
            blocks += self.emit(&handle.uri, chunk, limit, &mut samples).await?;
        }
        if let Some(mut conv) = converter {
            let tail = conv.finish()?;
            blocks += self.emit(&handle.uri, tail, limit, &mut samples).await?;
        }
        Ok((blocks, samples))
    }

    /// Write `chunk` as one or more SIGNAL_DATA blocks of at most `limit` samples.
    async fn emit(
        &mut self,
        uri: &str,
        mut chunk: SampleChunk,
        limit: usize,
        samples: &mut usize,
    ) -> Result<usize, Halt> {
        let mut blocks = 0;
        while !chunk.is_empty() {
            let head = chunk.split_front(limit);
            *samples += head.len();
            let block = SignalData::new(uri, head).to_block();
            let frame = encode(&block, self.response_mode)
                .map_err(|e| SignalError::Encode(e.to_string()))?;
            self.writer.write_frame(frame).await?;
            blocks += 1;
        }
        Ok(blocks)
    }

    async fn report_signal_failure(
        &mut self,
        uri: &str,
        error: &SignalError,
        echo: &Header,
    ) -> Result<(), TransportError> {
        tracing::warn!(uri = %uri, error = %error, "signal failed");
        let report = ErrorReport::new(ErrorCode::SignalRead, error.to_string())
            .for_signal(uri)
            .echoing(echo);
        self.send_report(&report).await
    }

    async fn send_report(&mut self, report: &ErrorReport) -> Result<(), TransportError> {
        let frame = encode(&report.to_block(), self.response_mode)?;
        self.writer.write_frame(frame).await
    }
}

/// Run a signal read without stalling the other tasks on this worker.
fn read_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
