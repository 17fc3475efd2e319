//! GET / PUT / DELETE on recording resources.

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;

use bsml_core::{ChecksumMode, DataRequest, UriSpec};
use bsml_services::metadata::escape_xml;
use bsml_services::{describe, ChunkWriter, MetadataFormat, RecordingInfo, StreamSession, Upload};

use super::negotiate::{Accept, StreamQuery};
use super::{attachment_name, ApiError, ApiState, BSML_MIMETYPE, STREAM_MIMETYPE};

/// Turtle mimetypes a client may ask for.
const TURTLE_TYPES: [&str; 2] = ["text/turtle", "application/x-turtle"];

// ── GET ───────────────────────────────────────────────────────────────────────

pub async fn handle_get(
    State(state): State<ApiState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (uri, _fragment) = state.resource_uri(&path);
    let recording = state
        .ctx
        .repository
        .recording(&uri)
        .ok_or_else(|| ApiError::NotFound(format!("unknown resource: {uri}")))?;
    let accept = Accept::from_headers(&headers);

    if accept.accepts(&recording.format) {
        return raw_download(&state, &recording).await;
    }
    if accept.accepts(STREAM_MIMETYPE) {
        let query = StreamQuery::parse(query.as_deref())?;
        check_openable(&state, &recording).await?;
        return Ok(stream_blocks(&state, &uri, query));
    }

    let format = if TURTLE_TYPES.iter().any(|t| accept.accepts(t)) {
        MetadataFormat::Turtle
    } else {
        MetadataFormat::RdfXml
    };
    let body = describe(&recording, &uri, format);
    Ok((
        [
            (header::CONTENT_TYPE, format.mimetype()),
            (header::VARY, "Accept"),
        ],
        body,
    )
        .into_response())
}

/// Backing file bytes in transport-sized chunks.
async fn raw_download(state: &ApiState, recording: &RecordingInfo) -> Result<Response, ApiError> {
    let source = recording
        .source
        .as_ref()
        .ok_or_else(|| ApiError::NotFound(format!("no stored content for {}", recording.uri)))?;
    let file = tokio::fs::File::open(source)
        .await
        .map_err(|e| ApiError::Internal(format!("cannot open {}: {e}", source.display())))?;
    let chunk_size = state.ctx.streaming.http_chunk_size.max(1);
    let body = Body::from_stream(ReaderStream::with_capacity(file, chunk_size));

    tracing::debug!(uri = %recording.uri, "raw download");
    let disposition = format!("attachment; filename={}", attachment_name(&recording.uri));
    Ok((
        [
            (header::CONTENT_TYPE, recording.format.clone()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// A recording whose source cannot be opened is not found, before any
/// block is streamed.
async fn check_openable(state: &ApiState, recording: &RecordingInfo) -> Result<(), ApiError> {
    let formats = state.ctx.formats.clone();
    let info = recording.clone();
    tokio::task::spawn_blocking(move || formats.open(&info).map(drop))
        .await
        .map_err(|e| ApiError::Internal(format!("open task failed: {e}")))?
        .map_err(|e| {
            tracing::debug!(uri = %recording.uri, error = %e, "recording cannot be opened");
            ApiError::NotFound(format!("cannot open {}: {e}", recording.uri))
        })
}

/// Block-protocol response: one DATA_REQ per interval through one session.
fn stream_blocks(state: &ApiState, uri: &str, query: StreamQuery) -> Response {
    let mut requests: Vec<DataRequest> = Vec::new();
    let base = || {
        let mut req = DataRequest::new(UriSpec::One(uri.to_string()));
        req.rate = query.rate;
        req.maxsize = query.maxsize;
        req
    };
    if query.intervals.is_empty() {
        requests.push(base());
    }
    for interval in &query.intervals {
        let mut req = base();
        req.interval = Some(*interval);
        requests.push(req);
    }

    let (writer, rx) = ChunkWriter::channel();
    let ctx = state.ctx.clone();
    let request_mode = ctx.streaming.request_checksum;
    let target = uri.to_string();
    tokio::spawn(async move {
        let mut session = StreamSession::with_modes(ctx, writer, request_mode, ChecksumMode::Strict);
        session.open();
        for request in &requests {
            if let Err(e) = session.serve(request).await {
                tracing::debug!(uri = %target, error = %e, "stream response ended early");
                break;
            }
        }
        session.close();
    });

    (
        [(header::CONTENT_TYPE, STREAM_MIMETYPE)],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

// ── PUT ───────────────────────────────────────────────────────────────────────

pub async fn handle_put(
    State(state): State<ApiState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let mimetype = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let (uri, fragment) = state.resource_uri(&path);
    if fragment.is_some() {
        return Err(ApiError::BadRequest("cannot store a fragment".into()));
    }
    let upload = Upload {
        uri,
        name: path,
        mimetype,
    };

    let info = state
        .store
        .ingest(
            state.ctx.repository.as_ref(),
            &state.ctx.formats,
            &upload,
            body.into_data_stream(),
        )
        .await?;

    let doc = format!(
        "<bsml>\n <created\n  class=\"recording\"\n  uri=\"{}\"\n  mimetype=\"{}\"\n  />\n</bsml>\n",
        escape_xml(&info.uri),
        escape_xml(&info.format)
    );
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, BSML_MIMETYPE.to_string()),
            (header::LOCATION, info.uri.clone()),
        ],
        doc,
    )
        .into_response())
}

// ── DELETE ────────────────────────────────────────────────────────────────────

pub async fn handle_delete(
    State(state): State<ApiState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let (uri, fragment) = state.resource_uri(&path);
    if let Some(fragment) = fragment {
        return Err(ApiError::BadRequest(format!("cannot delete fragment #{fragment}")));
    }
    let removed = state.store.delete(state.ctx.repository.as_ref(), &uri).await?;
    let doc = format!("<bsml>\n <deleted uri=\"{}\"/>\n</bsml>\n", escape_xml(&removed.uri));
    Ok(([(header::CONTENT_TYPE, BSML_MIMETYPE)], doc).into_response())
}
