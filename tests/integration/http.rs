use crate::*;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use bsml_api::{router, ApiState};
use bsml_core::wire::BlockType;
use bsml_core::SignalData;
use bsml_services::RecordingStore;

struct Api {
    app: Router,
    dir: PathBuf,
}

impl Api {
    fn new(name: &str) -> Self {
        let dir = scratch(name);
        let ctx = context(MemoryRepository::new(), StreamingConfig::default());
        let state = ApiState {
            ctx,
            store: Arc::new(RecordingStore::new(dir.join("recordings"))),
            base_uri: format!("{BASE}/"),
        };
        Self {
            app: router(state),
            dir,
        }
    }

    async fn send(&self, request: Request<Body>) -> Result<(StatusCode, axum::http::HeaderMap, bytes::Bytes)> {
        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, headers, body))
    }

    async fn put(&self, path: &str, mimetype: &str, body: impl Into<Body>) -> Result<(StatusCode, axum::http::HeaderMap, bytes::Bytes)> {
        let request = Request::builder()
            .method("PUT")
            .uri(path)
            .header(header::CONTENT_TYPE, mimetype)
            .body(body.into())?;
        self.send(request).await
    }

    async fn get(&self, path: &str, accept: Option<&str>) -> Result<(StatusCode, axum::http::HeaderMap, bytes::Bytes)> {
        let mut builder = Request::builder().method("GET").uri(path);
        if let Some(accept) = accept {
            builder = builder.header(header::ACCEPT, accept);
        }
        self.send(builder.body(Body::empty())?).await
    }

    async fn delete(&self, path: &str) -> Result<(StatusCode, axum::http::HeaderMap, bytes::Bytes)> {
        let request = Request::builder().method("DELETE").uri(path).body(Body::empty())?;
        self.send(request).await
    }
}

impl Drop for Api {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn text(body: &bytes::Bytes) -> String {
    String::from_utf8_lossy(body).into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_registers_and_reports_location() -> Result<()> {
    let api = Api::new("http-put");
    let (status, headers, body) = api.put("/study/rec1", SIGTEXT_MIMETYPE, sigtext(10.0, 50)).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::LOCATION], format!("{BASE}/study/rec1").as_str());
    assert!(text(&body).contains("class=\"recording\""));
    assert!(text(&body).contains(&format!("uri=\"{BASE}/study/rec1\"")));

    let (status, _, _) = api.put("/study/rec1", SIGTEXT_MIMETYPE, sigtext(10.0, 50)).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_rejects_unsupported_types() -> Result<()> {
    let api = Api::new("http-415");
    let (status, headers, body) = api.put("/rec", "text/plain", "rate=1\na\n1\n").await?;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(headers[header::CONTENT_TYPE], "application/x-bsml+xml");
    assert!(text(&body).starts_with("<bsml>\n <error>"));

    let (status, _, _) = api.put("/rec", "application/x-unknown", "x").await?;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupted_put_registers_nothing() -> Result<()> {
    let api = Api::new("http-interrupted");
    let pieces: Vec<Result<bytes::Bytes, std::io::Error>> = vec![
        Ok(bytes::Bytes::from_static(b"rate=10\necg\n1\n2\n")),
        Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "client hung up")),
    ];
    let (status, _, _) = api
        .put("/rec", SIGTEXT_MIMETYPE, Body::from_stream(futures::stream::iter(pieces)))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = api.get("/rec", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!api.dir.join("recordings/rec").exists());
    assert!(!api.dir.join("recordings/rec.partial").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_serves_each_interval_in_order() -> Result<()> {
    let api = Api::new("http-stream");
    api.put("/rec", SIGTEXT_MIMETYPE, sigtext(100.0, 1000)).await?;

    let (status, headers, body) = api.get("/rec?0-1;5:0.5", Some("application/x-stream")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/x-stream");

    let blocks = decode_all(&body, ChecksumMode::Strict)?;
    let data: Vec<SignalData> = blocks.iter().filter_map(SignalData::from_block).collect();
    assert_eq!(data.len(), blocks.len());
    let summary: Vec<(String, usize, f64)> = data
        .iter()
        .map(|d| (d.uri.rsplit('/').next().unwrap_or("").to_string(), d.chunk.len(), d.chunk.start))
        .collect();
    assert_eq!(summary.len(), 4);
    assert_eq!((summary[0].0.as_str(), summary[0].1), ("ecg", 100));
    assert_eq!((summary[1].0.as_str(), summary[1].1), ("resp", 100));
    assert_eq!((summary[2].0.as_str(), summary[2].1), ("ecg", 50));
    assert!((summary[2].2 - 5.0).abs() < 1e-9);
    assert_eq!(data[2].chunk.samples[0], 500.0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_options_bound_and_convert() -> Result<()> {
    let api = Api::new("http-rate");
    api.put("/rec", SIGTEXT_MIMETYPE, sigtext(100.0, 1000)).await?;

    let (status, _, body) = api
        .get("/rec/signal/resp?rate=250;maxsize=300", Some("application/x-stream"))
        .await?;
    assert_eq!(status, StatusCode::OK);

    let chunks: Vec<SampleChunk> = decode_all(&body, ChecksumMode::Strict)?
        .iter()
        .filter_map(SignalData::from_block)
        .map(|d| d.chunk)
        .collect();
    assert!(chunks.iter().all(|c| c.len() <= 300 && c.rate() == Some(250.0)));
    assert!((total_samples(&chunks) as i64 - 2500).abs() <= 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_interval_is_a_client_error() -> Result<()> {
    let api = Api::new("http-400");
    api.put("/rec", SIGTEXT_MIMETYPE, sigtext(10.0, 10)).await?;
    let (status, _, body) = api.get("/rec?5:0", Some("application/x-stream")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(text(&body).contains("<error>"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_of_unopenable_recording_is_not_found() -> Result<()> {
    let api = Api::new("http-gone");
    api.put("/rec", SIGTEXT_MIMETYPE, sigtext(10.0, 10)).await?;
    std::fs::remove_file(api.dir.join("recordings/rec"))?;

    let (status, headers, body) = api.get("/rec", Some("application/x-stream")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers[header::CONTENT_TYPE], "application/x-bsml+xml");
    assert!(text(&body).contains("<error>"));

    // Metadata comes from the catalog and is still served.
    let (status, _, _) = api.get("/rec", Some("text/turtle")).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_native_type_gets_raw_bytes() -> Result<()> {
    let api = Api::new("http-raw");
    let original = sigtext(10.0, 5000);
    api.put("/study/rec1", SIGTEXT_MIMETYPE, original.clone()).await?;

    let (status, headers, body) = api.get("/study/rec1", Some(SIGTEXT_MIMETYPE)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_DISPOSITION], "attachment; filename=rec1");
    assert_eq!(body, original.as_bytes());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metadata_is_negotiated() -> Result<()> {
    let api = Api::new("http-meta");
    api.put("/rec", SIGTEXT_MIMETYPE, sigtext(10.0, 10)).await?;

    let (status, headers, body) = api.get("/rec", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/rdf+xml");
    assert_eq!(headers[header::VARY], "Accept");
    assert!(text(&body).contains(&format!("rdf:about=\"{BASE}/rec\"")));

    let (_, headers, body) = api.get("/rec", Some("text/turtle")).await?;
    assert_eq!(headers[header::CONTENT_TYPE], "text/turtle");
    assert!(text(&body).contains("a bsml:Recording"));
    assert!(text(&body).contains("bsml:digest \"blake3:"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_removes_recording() -> Result<()> {
    let api = Api::new("http-delete");
    api.put("/rec", SIGTEXT_MIMETYPE, sigtext(10.0, 10)).await?;

    let (status, _, _) = api.delete("/rec/signal/ecg").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = api.delete("/rec%23frag").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = api.delete("/rec").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text(&body), format!("<bsml>\n <deleted uri=\"{BASE}/rec\"/>\n</bsml>\n"));
    assert!(!api.dir.join("recordings/rec").exists());

    let (status, _, _) = api.get("/rec", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = api.delete("/rec").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unrouted_methods_are_refused() -> Result<()> {
    let api = Api::new("http-405");
    let request = Request::builder().method("POST").uri("/rec").body(Body::empty())?;
    let (status, _, _) = api.send(request).await?;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_reports_unreadable_signal_in_band() -> Result<()> {
    let api = Api::new("http-flaky");
    let (status, _, _) = api.put("/flaky", FLAKY_MIMETYPE, "anything").await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = api.get("/flaky", Some("application/x-stream")).await?;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<BlockType> = decode_all(&body, ChecksumMode::Strict)?.iter().map(|b| b.kind).collect();
    assert_eq!(kinds, [BlockType::Error, BlockType::SignalData]);
    Ok(())
}
