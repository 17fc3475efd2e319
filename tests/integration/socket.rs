use crate::*;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use bsml_core::wire::{encode, BlockType};
use bsml_core::{DataRequest, ErrorCode, ErrorReport, SignalData, UriSpec};

/// Read from `stream` until the server closes it.
async fn read_to_close(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    timeout(Duration::from_secs(10), stream.read_to_end(&mut out))
        .await
        .context("server did not close the connection")??;
    Ok(out)
}

/// Read until `want` complete blocks have arrived.
async fn read_blocks(stream: &mut TcpStream, want: usize) -> Result<Vec<Block>> {
    let mut decoder = BlockDecoder::new(ChecksumMode::Strict);
    let mut blocks = Vec::new();
    let mut buf = [0u8; 4096];
    while blocks.len() < want {
        let n = timeout(Duration::from_secs(10), stream.read(&mut buf))
            .await
            .context("timed out waiting for blocks")??;
        anyhow::ensure!(n > 0, "connection closed after {} blocks", blocks.len());
        decoder.push(&buf[..n]);
        while let Some(block) = decoder.next_block()? {
            blocks.push(block);
        }
    }
    Ok(blocks)
}

fn request_frame(request: &DataRequest) -> bytes::Bytes {
    encode(&request.to_block(), ChecksumMode::Check).expect("encode request")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recording_request_streams_all_signals_then_closes() -> Result<()> {
    let dir = scratch("sock-recording");
    let repo = MemoryRepository::new();
    let uri = register_sigtext(&repo, &dir, "rec", 100.0, 1000);
    let (addr, _shutdown) = start_socket(context(repo, StreamingConfig::default())).await?;

    let mut stream = TcpStream::connect(addr).await?;
    let mut request = DataRequest::new(UriSpec::One(uri.clone()));
    request.maxsize = Some(256);
    stream.write_all(&request_frame(&request)).await?;

    let blocks = decode_all(&read_to_close(&mut stream).await?, ChecksumMode::Strict)?;
    let data: Vec<SignalData> = blocks
        .iter()
        .map(|b| SignalData::from_block(b).context("expected SIGNAL_DATA"))
        .collect::<Result<_>>()?;

    assert!(data.iter().all(|d| d.chunk.len() <= 256));
    let ecg: Vec<SampleChunk> = data.iter().filter(|d| d.uri.ends_with("/ecg")).map(|d| d.chunk.clone()).collect();
    let resp: Vec<SampleChunk> = data.iter().filter(|d| d.uri.ends_with("/resp")).map(|d| d.chunk.clone()).collect();
    assert_eq!(total_samples(&ecg), 1000);
    assert_eq!(total_samples(&resp), 1000);

    // Every ecg block precedes every resp block, in increasing time.
    let first_resp = data.iter().position(|d| d.uri.ends_with("/resp")).unwrap();
    assert!(data[..first_resp].iter().all(|d| d.uri.ends_with("/ecg")));
    assert!(ecg.windows(2).all(|w| w[0].start < w[1].start));

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_signal_is_isolated_and_connection_stays_open() -> Result<()> {
    let dir = scratch("sock-isolation");
    let repo = MemoryRepository::new();
    let uri = register_flaky(&repo, &dir, "flaky");
    let streaming = StreamingConfig {
        close_after_request: false,
        ..StreamingConfig::default()
    };
    let (addr, _shutdown) = start_socket(context(repo, streaming)).await?;
    let mut stream = TcpStream::connect(addr).await?;

    let request = DataRequest::new(UriSpec::Many(vec![
        format!("{uri}/signal/bad"),
        format!("{uri}/signal/good"),
    ]));
    stream.write_all(&request_frame(&request)).await?;
    let blocks = read_blocks(&mut stream, 2).await?;

    assert_eq!(blocks[0].kind, BlockType::Error);
    let report = ErrorReport::from_block(&blocks[0]).unwrap();
    assert_eq!(report.code, ErrorCode::SignalRead);
    assert_eq!(report.uri.as_deref(), Some(format!("{uri}/signal/bad").as_str()));
    assert_eq!(report.request.unwrap()["uri"][1], format!("{uri}/signal/good"));

    let good = SignalData::from_block(&blocks[1]).unwrap();
    assert_eq!(good.uri, format!("{uri}/signal/good"));
    assert_eq!(good.chunk.len(), 20);

    // Same connection, second request.
    let again = DataRequest::new(UriSpec::One(format!("{uri}/signal/good")));
    stream.write_all(&request_frame(&again)).await?;
    let blocks = read_blocks(&mut stream, 1).await?;
    assert_eq!(blocks[0].kind, BlockType::SignalData);

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupted_request_gets_checksum_error_and_close() -> Result<()> {
    let dir = scratch("sock-corrupt");
    let repo = MemoryRepository::new();
    let uri = register_sigtext(&repo, &dir, "rec", 10.0, 10);
    let (addr, _shutdown) = start_socket(context(repo, StreamingConfig::default())).await?;

    let mut frame = request_frame(&DataRequest::new(UriSpec::One(uri))).to_vec();
    let mid = frame.len() / 2;
    frame[mid] ^= 0x20;

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&frame).await?;
    let blocks = decode_all(&read_to_close(&mut stream).await?, ChecksumMode::Strict)?;

    assert_eq!(blocks.len(), 1);
    let report = ErrorReport::from_block(&blocks[0]).unwrap();
    assert!(matches!(report.code, ErrorCode::Checksum | ErrorCode::Framing));

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_strict_server_rejects_unchecked_request() -> Result<()> {
    let dir = scratch("sock-strict");
    let repo = MemoryRepository::new();
    let uri = register_sigtext(&repo, &dir, "rec", 10.0, 10);
    let streaming = StreamingConfig {
        request_checksum: ChecksumMode::Strict,
        ..StreamingConfig::default()
    };
    let (addr, _shutdown) = start_socket(context(repo, streaming)).await?;

    let block = DataRequest::new(UriSpec::One(uri)).to_block();
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&encode(&block, ChecksumMode::None)?).await?;
    let blocks = decode_all(&read_to_close(&mut stream).await?, ChecksumMode::Strict)?;

    assert_eq!(blocks.len(), 1);
    assert_eq!(ErrorReport::from_block(&blocks[0]).unwrap().code, ErrorCode::Framing);

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_request_yields_one_error_and_no_data() -> Result<()> {
    let dir = scratch("sock-invalid");
    let repo = MemoryRepository::new();
    let uri = register_sigtext(&repo, &dir, "rec", 10.0, 10);
    let (addr, _shutdown) = start_socket(context(repo, StreamingConfig::default())).await?;

    let header = bsml_core::Header::new().with("uri", uri).with("duration", 0.0);
    let block = Block::new(BlockType::DataReq, header, bytes::Bytes::new());
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&encode(&block, ChecksumMode::Check)?).await?;
    let blocks = decode_all(&read_to_close(&mut stream).await?, ChecksumMode::Strict)?;

    assert_eq!(blocks.len(), 1);
    let report = ErrorReport::from_block(&blocks[0]).unwrap();
    assert_eq!(report.code, ErrorCode::Request);
    assert_eq!(report.request.unwrap()["duration"], 0.0);

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_stops_on_shutdown() -> Result<()> {
    let ctx = context(MemoryRepository::new(), StreamingConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let task = tokio::spawn(bsml_services::serve_connections(listener, ctx, shutdown_tx.subscribe()));

    shutdown_tx.send(())?;
    timeout(Duration::from_secs(5), task).await???;
    Ok(())
}
