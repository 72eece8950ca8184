//! Direct Callback Engine: the non-socket transport. Request frames
//! arrive keyed by `requestId` from the native proxy's FFI surface
//! ([`crate::ffi`]); responses leave the same way via [`FramePusher`]
//! instead of a byte stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::codec::{self, FrameKind};
use crate::config::Limits;
use crate::error::{BridgeError, LimitKind, Result};
use crate::request::{body_channel, BodySender, ResponseStart, WholeRequest};
use crate::response::{Handler, ResponseSink, Tunnel};

/// Delivers one encoded response frame to the native proxy for a given
/// request id, mirroring `push_response_frame`. Returns `false` when the
/// native side no longer recognizes the request (already timed out or
/// the connection it belonged to is gone) — not a fatal error, just a
/// signal to stop pushing further frames for that id.
pub trait FramePusher: Send + Sync {
    fn push(&self, request_id: u64, frame: &[u8]) -> bool;
}

/// How long a `RequestStart` is allowed to wait for its matching
/// `RequestEnd` before the pending entry is garbage-collected.
const PENDING_REQUEST_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

enum PendingKind {
    Body(BodySender),
    /// Response detached: inbound `TunnelChunk` payloads are forwarded
    /// here for the handler's `run_tunnel` to consume.
    Tunnel(mpsc::Sender<Bytes>),
}

struct PendingDirectRequest {
    kind: PendingKind,
}

/// Registry of in-flight direct-callback requests plus the handler that
/// serves them.
pub struct DirectEngine<P, H> {
    pusher: Arc<P>,
    handler: Arc<H>,
    limits: Limits,
    pending: Arc<Mutex<HashMap<u64, PendingDirectRequest>>>,
}

impl<P, H> Clone for DirectEngine<P, H> {
    fn clone(&self) -> Self {
        Self {
            pusher: self.pusher.clone(),
            handler: self.handler.clone(),
            limits: self.limits,
            pending: self.pending.clone(),
        }
    }
}

impl<P, H> DirectEngine<P, H>
where
    P: FramePusher + 'static,
    H: Handler + 'static,
{
    pub fn new(pusher: Arc<P>, handler: Arc<H>, limits: Limits) -> Self {
        Self {
            pusher,
            handler,
            limits,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Routes one inbound frame, as delivered by `poll_request_frame` or
    /// the registered callback trampoline. Never blocks; request
    /// handling and response pushing happen on spawned tasks.
    pub fn dispatch(&self, request_id: u64, payload: Bytes) {
        let kind = match codec::classify(&payload) {
            Ok(kind) => kind,
            Err(err) => {
                tracing::warn!(request_id, %err, "dropping malformed direct-callback frame");
                return;
            }
        };

        match kind {
            FrameKind::RequestInline { .. } => self.spawn_inline(request_id, payload),
            FrameKind::RequestStart { .. } => self.spawn_streamed(request_id, payload),
            FrameKind::RequestChunk => self.feed_chunk(request_id, &payload),
            FrameKind::RequestEnd => self.feed_end(request_id),
            FrameKind::TunnelChunk => self.feed_tunnel_chunk(request_id, &payload),
            FrameKind::TunnelClose => self.feed_tunnel_close(request_id),
            other => {
                tracing::warn!(request_id, ?other, "unexpected frame kind for direct-callback request");
            }
        }
    }

    fn remove_pending(&self, request_id: u64) {
        self.pending.lock().remove(&request_id);
    }

    fn spawn_inline(&self, request_id: u64, payload: Bytes) {
        let engine = self.clone();
        tokio::spawn(async move {
            let view = match codec::decode_request_view(&payload) {
                Ok(view) => view,
                Err(err) => return engine.push_error(request_id, &err),
            };
            let head = match view.to_owned_head() {
                Ok(head) => head,
                Err(err) => return engine.push_error(request_id, &err),
            };
            let body = Bytes::copy_from_slice(view.body);

            match engine.handler.call(WholeRequest { head, body }).await {
                Ok((start, body)) => {
                    if let Ok(frame) = codec::encode_response_inline(start.head.status, &start.head.headers, &body) {
                        engine.pusher.push(request_id, &frame);
                    }
                }
                Err(err) if err.is_pre_response_recoverable() => engine.push_error(request_id, &err),
                Err(err) => tracing::warn!(request_id, %err, "direct-callback handler failed"),
            }
        });
    }

    fn spawn_streamed(&self, request_id: u64, payload: Bytes) {
        let (tx, body) = body_channel(8);
        self.pending.lock().insert(request_id, PendingDirectRequest { kind: PendingKind::Body(tx) });

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PENDING_REQUEST_IDLE_TIMEOUT).await;
            // Only reap a request still waiting on its body; a promoted
            // tunnel is expected to outlive this timeout.
            let still_awaiting_body = matches!(
                engine.pending.lock().get(&request_id).map(|entry| &entry.kind),
                Some(PendingKind::Body(_))
            );
            if still_awaiting_body {
                engine.pending.lock().remove(&request_id);
                tracing::warn!(request_id, "direct-callback request body never completed; dropped");
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let view = match codec::decode_request_view(&payload) {
                Ok(view) => view,
                Err(err) => {
                    engine.remove_pending(request_id);
                    return engine.push_error(request_id, &err);
                }
            };
            let head = match view.to_owned_head() {
                Ok(head) => head,
                Err(err) => {
                    engine.remove_pending(request_id);
                    return engine.push_error(request_id, &err);
                }
            };

            let mut sink = DirectSink::new(engine.pusher.clone(), request_id);
            let result = engine.handler.call_streamed(head, body, &mut sink).await;
            match result {
                Ok(()) if sink.detach_requested() => {
                    let (tunnel_tx, tunnel_rx) = mpsc::channel(16);
                    engine
                        .pending
                        .lock()
                        .insert(request_id, PendingDirectRequest { kind: PendingKind::Tunnel(tunnel_tx) });
                    let mut tunnel = DirectTunnel {
                        pusher: engine.pusher.clone(),
                        request_id,
                        inbound: tunnel_rx,
                    };
                    if let Err(err) = engine.handler.run_tunnel(&mut tunnel).await {
                        tracing::warn!(request_id, %err, "direct-callback tunnel handler failed");
                    }
                    engine.remove_pending(request_id);
                }
                Ok(()) => engine.remove_pending(request_id),
                Err(err) if !sink.response_started() && err.is_pre_response_recoverable() => {
                    engine.remove_pending(request_id);
                    engine.push_error(request_id, &err)
                }
                Err(err) => {
                    engine.remove_pending(request_id);
                    tracing::warn!(request_id, %err, "direct-callback streamed handler failed");
                }
            }
        });
    }

    fn feed_chunk(&self, request_id: u64, payload: &[u8]) {
        let chunk = match codec::decode_request_chunk(payload) {
            Ok(chunk) => Bytes::copy_from_slice(chunk),
            Err(err) => {
                tracing::warn!(request_id, %err, "malformed direct-callback chunk frame");
                return;
            }
        };
        let tx = {
            let pending = self.pending.lock();
            match pending.get(&request_id).map(|entry| &entry.kind) {
                Some(PendingKind::Body(tx)) => Some(tx.clone()),
                _ => None,
            }
        };
        let Some(tx) = tx else {
            tracing::warn!(request_id, "chunk frame for unknown direct-callback request");
            return;
        };
        if chunk.len() > self.limits.body_limit {
            let err = BridgeError::LimitExceeded {
                kind: LimitKind::Body,
                size: chunk.len(),
                limit: self.limits.body_limit,
            };
            self.remove_pending(request_id);
            let _ = tx.try_send(Err(err));
            return;
        }
        let _ = tx.try_send(Ok(chunk));
    }

    fn feed_end(&self, request_id: u64) {
        // Dropping the sender closes the body channel, which is how
        // `BodyStream` observes end-of-request.
        self.pending.lock().remove(&request_id);
    }

    fn feed_tunnel_chunk(&self, request_id: u64, payload: &[u8]) {
        let chunk = match codec::decode_tunnel_chunk(payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(request_id, %err, "malformed direct-callback tunnel chunk frame");
                return;
            }
        };
        let tx = {
            let pending = self.pending.lock();
            match pending.get(&request_id).map(|entry| &entry.kind) {
                Some(PendingKind::Tunnel(tx)) => Some(tx.clone()),
                _ => None,
            }
        };
        let Some(tx) = tx else {
            tracing::warn!(request_id, "tunnel chunk frame for unknown or non-tunneling direct-callback request");
            return;
        };
        let _ = tx.try_send(chunk);
    }

    fn feed_tunnel_close(&self, request_id: u64) {
        // Dropping the sender ends the tunnel's inbound channel, which is
        // how `Tunnel::recv` observes the peer closing.
        self.pending.lock().remove(&request_id);
    }

    fn push_error(&self, request_id: u64, err: &BridgeError) {
        let (status, body) = match err {
            BridgeError::HandlerFailure(msg) => (
                http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal handler error: {msg}"),
            ),
            // Every other variant's own `Display` is already a complete,
            // non-redundant message (`Malformed`'s included) — don't re-wrap it.
            other => (http::StatusCode::BAD_REQUEST, other.to_string()),
        };
        let headers = vec![codec::HeaderField {
            name: http::header::CONTENT_TYPE,
            value: Bytes::from_static(b"text/plain; charset=utf-8"),
        }];
        if let Ok(frame) = codec::encode_response_inline(status, &headers, body.as_bytes()) {
            self.pusher.push(request_id, &frame);
        }
    }
}

/// A [`ResponseSink`] that pushes each frame through [`FramePusher`]
/// instead of writing to a byte stream.
struct DirectSink<P> {
    pusher: Arc<P>,
    request_id: u64,
    started: bool,
    detach: bool,
}

impl<P: FramePusher> DirectSink<P> {
    fn new(pusher: Arc<P>, request_id: u64) -> Self {
        Self {
            pusher,
            request_id,
            started: false,
            detach: false,
        }
    }

    fn response_started(&self) -> bool {
        self.started
    }

    fn detach_requested(&self) -> bool {
        self.detach
    }
}

#[async_trait]
impl<P: FramePusher> ResponseSink for DirectSink<P> {
    async fn start(&mut self, start: ResponseStart) -> Result<()> {
        if self.started {
            return Err(BridgeError::ProtocolViolation("response already started".into()));
        }
        let frame = codec::encode_response_start(start.head.status, &start.head.headers)?;
        self.pusher.push(self.request_id, &frame);
        self.started = true;
        self.detach = start.detach;
        Ok(())
    }

    async fn chunk(&mut self, bytes: Bytes) -> Result<()> {
        if !self.started {
            return Err(BridgeError::ProtocolViolation("chunk before start".into()));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let frame = codec::encode_response_chunk(&bytes)?;
        self.pusher.push(self.request_id, &frame);
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        let frame = codec::encode_response_end();
        self.pusher.push(self.request_id, &frame);
        Ok(())
    }
}

/// The direct-callback transport's tunnel handle: the frame-pushing
/// analogue of `stream_engine::TunnelSocket`. Writing pushes a
/// `TunnelChunk` frame through [`FramePusher`]; reading drains the
/// channel `DirectEngine::feed_tunnel_chunk` feeds from inbound frames.
struct DirectTunnel<P> {
    pusher: Arc<P>,
    request_id: u64,
    inbound: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl<P: FramePusher> Tunnel for DirectTunnel<P> {
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = codec::encode_tunnel_chunk(bytes)?;
        self.pusher.push(self.request_id, &frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        let frame = codec::encode_tunnel_close();
        self.pusher.push(self.request_id, &frame);
        Ok(())
    }
}
