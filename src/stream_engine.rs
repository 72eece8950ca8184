//! Bridge Stream Engine: operates a single framed byte connection
//! carrying interleaved request lifecycles and, after detach, tunnel
//! traffic. One connection serves requests sequentially.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::codec::{self, FrameKind, HeaderField};
use crate::config::Limits;
use crate::error::{BridgeError, Result};
use crate::request::{body_channel, BodyStream, ResponseStart, WholeRequest};
use crate::response::{Handler, ResponseSink};

/// Runs the stream engine over one connection until the stream ends or a
/// fatal frame-protocol error occurs.
pub async fn serve<S, H>(
    stream: S,
    handler: Arc<H>,
    limits: Limits,
    idle_timeout: Option<Duration>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    H: Handler + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = Vec::new();

    loop {
        let has_frame = match read_next_frame(&mut reader, &mut buf, limits.frame_limit, idle_timeout).await {
            FrameRead::Frame(Ok(has_frame)) => has_frame,
            FrameRead::Frame(Err(err)) => {
                write_synthesized_error(&mut writer, &err, &limits).await?;
                continue;
            }
            FrameRead::IdleTimeout => return Ok(()),
        };
        if !has_frame {
            return Ok(());
        }

        let kind = match codec::classify(&buf) {
            Ok(kind) => kind,
            Err(err) => {
                write_synthesized_error(&mut writer, &err, &limits).await?;
                continue;
            }
        };

        match kind {
            FrameKind::RequestInline { .. } => {
                handle_inline(&buf, handler.as_ref(), &mut writer, &limits).await?;
            }
            FrameKind::RequestStart { .. } => {
                let detach =
                    handle_streamed(&mut reader, &buf, handler.as_ref(), &mut writer, &limits).await?;
                if let Some(tunnel_start) = detach {
                    run_tunnel(reader, writer, handler.as_ref(), &limits, tunnel_start).await?;
                    return Ok(());
                }
            }
            other => {
                let err = BridgeError::ProtocolViolation(format!(
                    "unexpected frame kind at request boundary: {other:?}"
                ));
                write_synthesized_error(&mut writer, &err, &limits).await?;
            }
        }
    }
}

enum FrameRead {
    Frame(Result<bool>),
    IdleTimeout,
}

async fn read_next_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    frame_limit: usize,
    idle_timeout: Option<Duration>,
) -> FrameRead {
    match idle_timeout {
        None => FrameRead::Frame(codec::read_frame_reuse(reader, buf, frame_limit).await),
        Some(dur) => match tokio::time::timeout(dur, codec::read_frame_reuse(reader, buf, frame_limit)).await {
            Ok(result) => FrameRead::Frame(result),
            Err(_) => FrameRead::IdleTimeout,
        },
    }
}

fn content_type_header() -> HeaderField {
    HeaderField {
        name: http::header::CONTENT_TYPE,
        value: Bytes::from_static(b"text/plain; charset=utf-8"),
    }
}

fn synthesize_error_text(err: &BridgeError) -> (StatusCode, String) {
    match err {
        BridgeError::HandlerFailure(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("internal handler error: {msg}"),
        ),
        // Every other variant's own `Display` is already a complete,
        // non-redundant message (`Malformed`'s included) — don't re-wrap it.
        other => (StatusCode::BAD_REQUEST, other.to_string()),
    }
}

async fn write_synthesized_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    err: &BridgeError,
    limits: &Limits,
) -> Result<()> {
    let (status, body) = synthesize_error_text(err);
    tracing::warn!(status = status.as_u16(), "synthesizing bridge error response");
    let payload = codec::encode_response_inline(status, &[content_type_header()], body.as_bytes())?;
    codec::write_frame(writer, &payload, limits.frame_limit, limits.coalesce_threshold).await
}

/// Handles a `RequestInline` frame: decode, invoke the whole-handler, and
/// write a single response frame.
async fn handle_inline<W, H>(payload: &[u8], handler: &H, writer: &mut W, limits: &Limits) -> Result<()>
where
    W: AsyncWrite + Unpin,
    H: Handler,
{
    let view = match codec::decode_request_view(payload) {
        Ok(view) => view,
        Err(err) => return write_synthesized_error(writer, &err, limits).await,
    };
    let head = match view.to_owned_head() {
        Ok(head) => head,
        Err(err) => return write_synthesized_error(writer, &err, limits).await,
    };
    let body = Bytes::copy_from_slice(view.body);

    match handler.call(WholeRequest { head, body }).await {
        Ok((start, body)) => {
            let payload = codec::encode_response_inline(start.head.status, &start.head.headers, &body)?;
            codec::write_frame(writer, &payload, limits.frame_limit, limits.coalesce_threshold).await
        }
        Err(err) if err.is_pre_response_recoverable() => write_synthesized_error(writer, &err, limits).await,
        Err(err) => Err(err),
    }
}

/// Handles a `RequestStart` frame: decodes the head, spawns the streamed
/// handler concurrently with reading the remaining chunk/end frames into
/// the body channel. Returns `Some(ResponseStart)` when the response
/// detached (caller should transition to tunnel mode).
async fn handle_streamed<R, W, H>(
    reader: &mut R,
    start_payload: &[u8],
    handler: &H,
    writer: &mut W,
    limits: &Limits,
) -> Result<Option<ResponseStart>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: Handler,
{
    let view = match codec::decode_request_view(start_payload) {
        Ok(view) => view,
        Err(err) => return write_synthesized_error(writer, &err, limits).await.map(|_| None),
    };
    let head = match view.to_owned_head() {
        Ok(head) => head,
        Err(err) => return write_synthesized_error(writer, &err, limits).await.map(|_| None),
    };

    if let Some(declared) = declared_content_length(&head) {
        if declared > limits.body_limit {
            let err = BridgeError::LimitExceeded {
                kind: crate::error::LimitKind::Body,
                size: declared,
                limit: limits.body_limit,
            };
            write_synthesized_error(writer, &err, limits).await?;
            drain_request_body_frames(reader, limits.frame_limit).await?;
            return Ok(None);
        }
    }

    let (tx, body) = body_channel(8);
    let mut sink = SocketSink::new(writer, limits.clone());

    let feed = feed_body_channel(reader, tx, limits.clone());
    let drive = handler.call_streamed(head, body, &mut sink);

    let (feed_result, drive_result) = tokio::join!(feed, drive);

    match drive_result {
        Ok(()) => {
            feed_result?;
            Ok(sink.into_detach())
        }
        Err(err) if !sink.response_started() && err.is_pre_response_recoverable() => {
            sink.write_error(&err, limits).await?;
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Reads `content-length` off a decoded head, if present and well-formed.
/// Used to reject an over-limit body before the handler ever runs.
fn declared_content_length(head: &crate::codec::RequestHead) -> Option<usize> {
    head.headers
        .iter()
        .find(|h| h.name == http::header::CONTENT_LENGTH)
        .and_then(|h| std::str::from_utf8(&h.value).ok())
        .and_then(|s| s.parse().ok())
}

/// Discards the remaining `RequestChunk`/`RequestEnd` frames of a request
/// whose head was already rejected, so the connection stays in sync for
/// the next request.
async fn drain_request_body_frames<R: AsyncRead + Unpin>(reader: &mut R, frame_limit: usize) -> Result<()> {
    let mut buf = Vec::new();
    loop {
        if !codec::read_frame_reuse(reader, &mut buf, frame_limit).await? {
            return Ok(());
        }
        match codec::classify(&buf)? {
            FrameKind::RequestEnd => return Ok(()),
            FrameKind::RequestChunk => continue,
            other => {
                return Err(BridgeError::ProtocolViolation(format!(
                    "unexpected frame while draining rejected request body: {other:?}"
                )))
            }
        }
    }
}

async fn feed_body_channel<R: AsyncRead + Unpin>(
    reader: &mut R,
    tx: crate::request::BodySender,
    limits: Limits,
) -> Result<()> {
    let mut buf = Vec::new();
    let mut total = 0usize;
    loop {
        if !codec::read_frame_reuse(reader, &mut buf, limits.frame_limit).await? {
            let _ = tx
                .send(Err(BridgeError::ProtocolViolation(
                    "connection closed mid-request body".into(),
                )))
                .await;
            return Ok(());
        }
        match codec::classify(&buf)? {
            FrameKind::RequestChunk => {
                let chunk = codec::decode_request_chunk(&buf)?;
                total += chunk.len();
                if total > limits.body_limit {
                    let err = BridgeError::LimitExceeded {
                        kind: crate::error::LimitKind::Body,
                        size: total,
                        limit: limits.body_limit,
                    };
                    let _ = tx.send(Err(clone_err(&err))).await;
                    return Err(err);
                }
                if tx.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                    return Ok(());
                }
            }
            FrameKind::RequestEnd => {
                codec::decode_request_end(&buf)?;
                return Ok(());
            }
            other => {
                let err = BridgeError::ProtocolViolation(format!(
                    "unexpected frame during request body: {other:?}"
                ));
                let _ = tx.send(Err(clone_err(&err))).await;
                return Err(err);
            }
        }
    }
}

fn clone_err(err: &BridgeError) -> BridgeError {
    match err {
        BridgeError::LimitExceeded { kind, size, limit } => BridgeError::LimitExceeded {
            kind: *kind,
            size: *size,
            limit: *limit,
        },
        other => BridgeError::ProtocolViolation(other.to_string()),
    }
}

/// A [`ResponseSink`] that writes frames directly to the connection's
/// write half, enforcing the exactly-one-start invariant.
struct SocketSink<'a, W> {
    writer: &'a mut W,
    limits: Limits,
    started: bool,
    detach: Option<ResponseStart>,
}

impl<'a, W: AsyncWrite + Unpin> SocketSink<'a, W> {
    fn new(writer: &'a mut W, limits: Limits) -> Self {
        Self {
            writer,
            limits,
            started: false,
            detach: None,
        }
    }

    fn response_started(&self) -> bool {
        self.started
    }

    fn into_detach(self) -> Option<ResponseStart> {
        self.detach
    }

    /// Synthesizes and writes an inline error response. Only valid before
    /// `start` has been called.
    async fn write_error(&mut self, err: &BridgeError, limits: &Limits) -> Result<()> {
        let (status, body) = synthesize_error_text(err);
        tracing::warn!(status = status.as_u16(), "synthesizing bridge error response");
        let payload = codec::encode_response_inline(status, &[content_type_header()], body.as_bytes())?;
        codec::write_frame(self.writer, &payload, limits.frame_limit, limits.coalesce_threshold).await
    }
}

#[async_trait]
impl<'a, W: AsyncWrite + Unpin + Send> ResponseSink for SocketSink<'a, W> {
    async fn start(&mut self, start: ResponseStart) -> Result<()> {
        debug_assert!(!self.started, "exactly one ResponseStarted per request");
        if self.started {
            return Err(BridgeError::ProtocolViolation("response already started".into()));
        }
        let payload = codec::encode_response_start(start.head.status, &start.head.headers)?;
        codec::write_frame(self.writer, &payload, self.limits.frame_limit, self.limits.coalesce_threshold).await?;
        self.started = true;
        if start.detach {
            self.detach = Some(start);
        }
        Ok(())
    }

    async fn chunk(&mut self, bytes: Bytes) -> Result<()> {
        if !self.started {
            return Err(BridgeError::ProtocolViolation("chunk before start".into()));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        codec::write_chunk_frame(
            self.writer,
            codec::RESPONSE_CHUNK,
            &bytes,
            self.limits.frame_limit,
            self.limits.coalesce_threshold,
        )
        .await
    }

    async fn end(&mut self) -> Result<()> {
        let payload = codec::encode_response_end();
        codec::write_frame(self.writer, &payload, self.limits.frame_limit, self.limits.coalesce_threshold).await
    }
}

/// Runs the post-detach tunnel phase: promotes the connection's two
/// halves into a [`TunnelSocket`] and hands it to `handler.run_tunnel`,
/// so a handler that cares about tunnel bytes can read and write them
/// concurrently with the frame pump reading inbound `TunnelChunk`/
/// `TunnelClose` frames off the wire.
async fn run_tunnel<S, H>(
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    handler: &H,
    limits: &Limits,
    _start: ResponseStart,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    let inbound = spawn_tunnel_reader(reader, limits.clone());
    let mut tunnel = TunnelSocket {
        writer: Box::new(writer),
        limits: limits.clone(),
        inbound,
    };
    handler.run_tunnel(&mut tunnel).await
}

/// Handle given to [`Handler::run_tunnel`]: `write_chunk` encodes and
/// writes a `TunnelChunk` frame; `recv` yields inbound tunnel chunks
/// until a close frame or EOF closes the reader pump.
pub struct TunnelSocket {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    limits: Limits,
    inbound: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl crate::response::Tunnel for TunnelSocket {
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        codec::write_chunk_frame(&mut self.writer, codec::TUNNEL_CHUNK, bytes, self.limits.frame_limit, self.limits.coalesce_threshold)
            .await
    }

    async fn close(&mut self) -> Result<()> {
        let payload = codec::encode_tunnel_close();
        codec::write_frame(&mut self.writer, &payload, self.limits.frame_limit, self.limits.coalesce_threshold).await
    }

    async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }
}

/// Spawns the reader pump for a [`TunnelSocket`], forwarding inbound
/// `TunnelChunk` payloads into the returned receiver and stopping on
/// `TunnelClose` or EOF.
pub fn spawn_tunnel_reader<R>(mut reader: R, limits: Limits) -> mpsc::Receiver<Bytes>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut buf = Vec::new();
        loop {
            match codec::read_frame_reuse(&mut reader, &mut buf, limits.frame_limit).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    tracing::warn!(%err, "tunnel reader pump error");
                    return;
                }
            }
            match codec::classify(&buf) {
                Ok(FrameKind::TunnelChunk) => match codec::decode_tunnel_chunk(&buf) {
                    Ok(chunk) => {
                        if !chunk.is_empty() && tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "malformed tunnel chunk");
                        return;
                    }
                },
                Ok(FrameKind::TunnelClose) => return,
                _ => return,
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RequestHead;
    use crate::error::BridgeError;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn call(&self, request: WholeRequest) -> Result<(ResponseStart, Bytes)> {
            if request.head.path == "/ping" {
                return Ok((
                    ResponseStart::new(StatusCode::OK, vec![content_type_header()]),
                    Bytes::from_static(b"pong"),
                ));
            }
            Ok((ResponseStart::new(StatusCode::OK, vec![]), Bytes::new()))
        }

        async fn call_streamed(
            &self,
            _head: RequestHead,
            mut body: BodyStream,
            sink: &mut dyn ResponseSink,
        ) -> Result<()> {
            sink.start(ResponseStart::new(StatusCode::OK, vec![])).await?;
            while let Some(chunk) = body.next().await {
                let _ = chunk?;
            }
            sink.end().await
        }
    }

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

    #[tokio::test]
    async fn inline_get_round_trip() {
        let (client, server) = tokio::io::duplex(8192);
        let handler = Arc::new(EchoHandler);
        let limits = Limits::default();
        let serve_task = tokio::spawn(serve(server, handler, limits.clone(), None));

        let request = codec::encode_request_inline(&head("GET", "/ping"), b"").unwrap();
        let (mut read_half, mut write_half) = tokio::io::split(client);
        codec::write_frame(&mut write_half, &request, limits.frame_limit, limits.coalesce_threshold)
            .await
            .unwrap();
        let response = codec::read_frame(&mut read_half, limits.frame_limit).await.unwrap().unwrap();
        let (status, _headers, body) = codec::decode_response_inline(&response).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"pong");

        drop(write_half);
        drop(read_half);
        let _ = serve_task.await;
    }

    #[tokio::test]
    async fn streamed_post_chunks_then_end() {
        let (client, server) = tokio::io::duplex(8192);
        let handler = Arc::new(EchoHandler);
        let limits = Limits::default();
        let serve_task = tokio::spawn(serve(server, handler, limits.clone(), None));

        let (mut read_half, mut write_half) = tokio::io::split(client);
        let start = codec::encode_request_start(&head("POST", "/upload")).unwrap();
        codec::write_frame(&mut write_half, &start, limits.frame_limit, limits.coalesce_threshold)
            .await
            .unwrap();
        for chunk in [b"ab".as_slice(), b"cd".as_slice(), b"".as_slice()] {
            let payload = codec::encode_request_chunk(chunk).unwrap();
            codec::write_frame(&mut write_half, &payload, limits.frame_limit, limits.coalesce_threshold)
                .await
                .unwrap();
        }
        let end = codec::encode_request_end();
        codec::write_frame(&mut write_half, &end, limits.frame_limit, limits.coalesce_threshold)
            .await
            .unwrap();

        let response_start = codec::read_frame(&mut read_half, limits.frame_limit).await.unwrap().unwrap();
        assert!(matches!(codec::classify(&response_start).unwrap(), FrameKind::ResponseStart { .. }));
        let response_end = codec::read_frame(&mut read_half, limits.frame_limit).await.unwrap().unwrap();
        assert!(matches!(codec::classify(&response_end).unwrap(), FrameKind::ResponseEnd));

        drop(write_half);
        drop(read_half);
        let _ = serve_task.await;
    }

    #[tokio::test]
    async fn over_limit_body_synthesizes_400() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let handler = Arc::new(EchoHandler);
        let mut limits = Limits::default();
        limits.body_limit = 1024;
        let serve_task = tokio::spawn(serve(server, handler, limits.clone(), None));

        let (mut read_half, mut write_half) = tokio::io::split(client);
        let mut oversized = head("POST", "/upload");
        oversized.headers.push(HeaderField {
            name: http::header::CONTENT_LENGTH,
            value: Bytes::from_static(b"2048"),
        });
        let start = codec::encode_request_start(&oversized).unwrap();
        codec::write_frame(&mut write_half, &start, limits.frame_limit, limits.coalesce_threshold)
            .await
            .unwrap();
        let end = codec::encode_request_end();
        codec::write_frame(&mut write_half, &end, limits.frame_limit, limits.coalesce_threshold)
            .await
            .unwrap();

        let response = codec::read_frame(&mut read_half, limits.frame_limit).await.unwrap().unwrap();
        let (status, _headers, body) = codec::decode_response_inline(&response).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body_text = std::str::from_utf8(&body).unwrap();
        assert!(body_text.starts_with("bridge limit exceeded:"));
        assert!(body_text.contains("2048"));

        drop(write_half);
        drop(read_half);
        let _ = serve_task.await;
    }

    #[test]
    fn bridge_error_display_includes_size() {
        let err = BridgeError::LimitExceeded {
            kind: crate::error::LimitKind::Body,
            size: 2048,
            limit: 1024,
        };
        assert!(err.to_string().contains("2048"));
    }

    #[test]
    fn malformed_error_text_is_not_double_prefixed() {
        let err = BridgeError::Malformed("truncated frame".into());
        let (status, text) = synthesize_error_text(&err);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text, "invalid bridge request: truncated frame");
    }

    struct UpgradeHandler;

    #[async_trait]
    impl Handler for UpgradeHandler {
        async fn call(&self, _request: WholeRequest) -> Result<(ResponseStart, Bytes)> {
            Ok((ResponseStart::new(StatusCode::OK, vec![]), Bytes::new()))
        }

        async fn call_streamed(
            &self,
            _head: RequestHead,
            _body: BodyStream,
            sink: &mut dyn ResponseSink,
        ) -> Result<()> {
            sink.start(ResponseStart::detached(StatusCode::SWITCHING_PROTOCOLS, vec![]))
                .await
        }

        async fn run_tunnel(&self, tunnel: &mut dyn crate::response::Tunnel) -> Result<()> {
            while let Some(chunk) = tunnel.recv().await {
                if &chunk[..] == b"ping" {
                    tunnel.write_chunk(b"pong").await?;
                }
            }
            tunnel.close().await
        }
    }

    #[tokio::test]
    async fn detached_response_forwards_tunnel_chunks_to_handler() {
        let (client, server) = tokio::io::duplex(8192);
        let handler = Arc::new(UpgradeHandler);
        let limits = Limits::default();
        let serve_task = tokio::spawn(serve(server, handler, limits.clone(), None));

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
        assert!(matches!(codec::classify(&response_start).unwrap(), FrameKind::ResponseStart { .. }));

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

        let echoed_close = codec::read_frame(&mut read_half, limits.frame_limit).await.unwrap().unwrap();
        assert!(matches!(codec::classify(&echoed_close).unwrap(), FrameKind::TunnelClose));

        drop(write_half);
        drop(read_half);
        let _ = serve_task.await;
    }
}
