//! End-to-end scenarios spanning both transports and the supervisor's
//! shutdown arbitration, exercised against the public API rather than
//! module-internal test helpers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bridge_transport::{
    BodyStream, BridgeConfig, DirectEngine, FramePusher, Handler, ResponseSink, ResponseStart,
    Result, Supervisor, Tunnel, TransportMode, WholeRequest,
};
use bridge_transport::codec::{self, FrameKind, RequestHead};
use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;

fn head(method: &str, path: &str) -> RequestHead {
    RequestHead {
        method: method.into(),
        scheme: "http".into(),
        authority: "x".into(),
        path: path.into(),
        query: "".into(),
        protocol: "1.1".into(),
        headers: vec![],
    }
}

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn call(&self, request: WholeRequest) -> Result<(ResponseStart, Bytes)> {
        Ok((ResponseStart::new(StatusCode::OK, Vec::new()), request.body))
    }

    async fn call_streamed(
        &self,
        _head: RequestHead,
        mut body: BodyStream,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        sink.start(ResponseStart::new(StatusCode::OK, vec![])).await?;
        while let Some(chunk) = body.next().await {
            sink.chunk(chunk?).await?;
        }
        sink.end().await
    }
}

/// A handler that treats any request to `/ws` as a protocol upgrade: it
/// starts a detached response instead of an ordinary one, matching the
/// websocket/CONNECT upgrade path described for the stream engine.
struct UpgradeHandler;

#[async_trait]
impl Handler for UpgradeHandler {
    async fn call(&self, request: WholeRequest) -> Result<(ResponseStart, Bytes)> {
        Ok((ResponseStart::new(StatusCode::OK, Vec::new()), request.body))
    }

    async fn call_streamed(
        &self,
        head: RequestHead,
        mut body: BodyStream,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        while let Some(chunk) = body.next().await {
            chunk?;
        }
        if head.path == "/ws" {
            sink.start(ResponseStart::detached(StatusCode::SWITCHING_PROTOCOLS, vec![]))
                .await
        } else {
            sink.start(ResponseStart::new(StatusCode::OK, vec![])).await?;
            sink.end().await
        }
    }

    async fn run_tunnel(&self, tunnel: &mut dyn Tunnel) -> Result<()> {
        while let Some(chunk) = tunnel.recv().await {
            if &chunk[..] == b"ping" {
                tunnel.write_chunk(b"pong").await?;
            }
        }
        tunnel.close().await
    }
}

#[tokio::test]
async fn websocket_upgrade_detaches_into_tunnel_mode() {
    let (client, server) = tokio::io::duplex(8192);
    let handler = Arc::new(UpgradeHandler);
    let limits = bridge_transport::Limits::default();
    let serve_task = tokio::spawn(bridge_transport::stream_engine::serve(
        server,
        handler,
        limits.clone(),
        None,
    ));

    let (mut read_half, mut write_half) = tokio::io::split(client);

    let start = codec::encode_request_start(&head("GET", "/ws")).unwrap();
    codec::write_frame(&mut write_half, &start, limits.frame_limit, limits.coalesce_threshold)
        .await
        .unwrap();
    let end = codec::encode_request_end();
    codec::write_frame(&mut write_half, &end, limits.frame_limit, limits.coalesce_threshold)
        .await
        .unwrap();

    let response_start = codec::read_frame(&mut read_half, limits.frame_limit).await.unwrap().unwrap();
    let (status, _headers) = codec::decode_response_start(&response_start).unwrap();
    assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);

    // Now tunneling: the handler's run_tunnel echoes "ping" as "pong" over
    // the wire before observing the tunnel close.
    let chunk = codec::encode_tunnel_chunk(b"ping").unwrap();
    codec::write_frame(&mut write_half, &chunk, limits.frame_limit, limits.coalesce_threshold)
        .await
        .unwrap();

    let echoed = codec::read_frame(&mut read_half, limits.frame_limit).await.unwrap().unwrap();
    assert!(matches!(codec::classify(&echoed).unwrap(), FrameKind::TunnelChunk));
    assert_eq!(&codec::decode_tunnel_chunk(&echoed).unwrap()[..], b"pong");

    let close = codec::encode_tunnel_close();
    codec::write_frame(&mut write_half, &close, limits.frame_limit, limits.coalesce_threshold)
        .await
        .unwrap();

    let close_response = codec::read_frame(&mut read_half, limits.frame_limit).await.unwrap().unwrap();
    assert!(matches!(codec::classify(&close_response).unwrap(), FrameKind::TunnelClose));

    drop(write_half);
    drop(read_half);
    let _ = serve_task.await;
}

struct RecordingPusher {
    frames: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl RecordingPusher {
    fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
        }
    }

    fn frames_for(&self, request_id: u64) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .iter()
            .filter(|(id, _)| *id == request_id)
            .map(|(_, frame)| frame.clone())
            .collect()
    }
}

impl FramePusher for RecordingPusher {
    fn push(&self, request_id: u64, frame: &[u8]) -> bool {
        self.frames.lock().push((request_id, frame.to_vec()));
        true
    }
}

#[tokio::test]
async fn concurrent_direct_requests_stay_isolated_by_request_id() {
    let pusher = Arc::new(RecordingPusher::new());
    let handler = Arc::new(EchoHandler);
    let engine = DirectEngine::new(pusher.clone(), handler, bridge_transport::Limits::default());

    // Interleave request id 7 (streamed) and request id 8 (streamed):
    // start both, then alternate chunks, then end both, out of order.
    let start7 = codec::encode_request_start(&head("POST", "/a")).unwrap();
    let start8 = codec::encode_request_start(&head("POST", "/b")).unwrap();
    engine.dispatch(7, Bytes::from(start7));
    engine.dispatch(8, Bytes::from(start8));

    engine.dispatch(7, Bytes::from(codec::encode_request_chunk(b"seven-1").unwrap()));
    engine.dispatch(8, Bytes::from(codec::encode_request_chunk(b"eight-1").unwrap()));
    engine.dispatch(8, Bytes::from(codec::encode_request_chunk(b"eight-2").unwrap()));
    engine.dispatch(7, Bytes::from(codec::encode_request_chunk(b"seven-2").unwrap()));

    engine.dispatch(8, Bytes::from(codec::encode_request_end()));
    engine.dispatch(7, Bytes::from(codec::encode_request_end()));

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let done = pusher.frames_for(7).len() >= 3 && pusher.frames_for(8).len() >= 3;
        if done || Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let frames7 = pusher.frames_for(7);
    let frames8 = pusher.frames_for(8);
    assert!(frames7.len() >= 3, "request 7 should see start/chunk.../end frames");
    assert!(frames8.len() >= 3, "request 8 should see start/chunk.../end frames");
    assert!(matches!(codec::classify(&frames7[0]).unwrap(), FrameKind::ResponseStart { .. }));
    assert!(matches!(codec::classify(&frames8[0]).unwrap(), FrameKind::ResponseStart { .. }));

    let body7: Vec<u8> = frames7[1..frames7.len() - 1]
        .iter()
        .flat_map(|frame| codec::decode_response_chunk(frame).unwrap().to_vec())
        .collect();
    let body8: Vec<u8> = frames8[1..frames8.len() - 1]
        .iter()
        .flat_map(|frame| codec::decode_response_chunk(frame).unwrap().to_vec())
        .collect();
    assert_eq!(body7, b"seven-1seven-2");
    assert_eq!(body8, b"eight-1eight-2");
}

#[tokio::test]
async fn supervisor_graceful_shutdown_completes_well_within_five_seconds() {
    let mut config = BridgeConfig::default();
    config.port = 0;
    config.transport_mode = TransportMode::Stream;

    let proxy = Supervisor::start(config, Arc::new(EchoHandler))
        .await
        .expect("bind should succeed");

    let started = Instant::now();
    proxy.stop(false).await;
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_secs(5),
        "graceful stop took {elapsed:?}, expected well under the 5s forced-shutdown timer"
    );
}
