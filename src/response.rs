//! Response production and the post-detach tunnel handle.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::request::{BodyStream, ResponseStart, WholeRequest};

/// Sink the engine hands to a streamed handler: `start` must be called
/// exactly once, before any `chunk` call; `end` finalizes the response.
#[async_trait]
pub trait ResponseSink: Send {
    async fn start(&mut self, start: ResponseStart) -> Result<()>;
    async fn chunk(&mut self, bytes: Bytes) -> Result<()>;
    async fn end(&mut self) -> Result<()>;
}

/// Handle given to [`Handler::run_tunnel`] once a streamed response has
/// detached: opaque bytes flow both ways over it until either side closes.
/// Implemented by the stream engine's socket-backed tunnel and the direct
/// callback engine's frame-push-backed tunnel, so one `run_tunnel`
/// implementation works over either transport.
#[async_trait]
pub trait Tunnel: Send {
    /// Writes one chunk of application bytes as an outbound tunnel-chunk
    /// frame.
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()>;

    /// Yields the next inbound tunnel-chunk payload, or `None` once the
    /// peer has closed the tunnel or the connection has ended.
    async fn recv(&mut self) -> Option<Bytes>;

    /// Sends a tunnel-close frame. Idempotent where the underlying
    /// transport allows it.
    async fn close(&mut self) -> Result<()>;
}

/// User-supplied request handler, invoked on either the inline or
/// streamed path depending on which frame kind opened the request. The
/// engine never calls both for the same request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: WholeRequest) -> Result<(ResponseStart, Bytes)>;

    async fn call_streamed(
        &self,
        head: crate::codec::RequestHead,
        body: BodyStream,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        let body_bytes = body.collect(usize::MAX).await?;
        let (start, bytes) = self.call(WholeRequest { head, body: body_bytes }).await?;
        sink.start(start).await?;
        if !bytes.is_empty() {
            sink.chunk(bytes).await?;
        }
        sink.end().await
    }

    /// Runs the post-detach tunnel phase for a response that called
    /// `sink.start(ResponseStart::detached(..))`. Only invoked after
    /// `call_streamed` has returned successfully with a detached start.
    /// The default drains inbound chunks and echoes a close once the
    /// peer closes or the connection ends, matching a handler that has
    /// no use for tunnel bytes.
    async fn run_tunnel(&self, tunnel: &mut dyn Tunnel) -> Result<()> {
        while tunnel.recv().await.is_some() {}
        tunnel.close().await
    }
}

/// A [`ResponseSink`] that buffers everything a streamed handler emits,
/// used by the stream engine to adapt a streamed-only handler over an
/// inline request (the mirror of [`Handler`]'s default `call_streamed`,
/// which adapts a whole-only handler over a streamed request).
#[derive(Default)]
pub struct BufferingSink {
    start: Option<ResponseStart>,
    body: Vec<u8>,
}

impl BufferingSink {
    pub fn into_result(self) -> Result<(ResponseStart, Bytes)> {
        let start = self
            .start
            .ok_or_else(|| crate::error::BridgeError::ProtocolViolation("handler never called start".into()))?;
        Ok((start, Bytes::from(self.body)))
    }
}

#[async_trait]
impl ResponseSink for BufferingSink {
    async fn start(&mut self, start: ResponseStart) -> Result<()> {
        self.start = Some(start);
        Ok(())
    }

    async fn chunk(&mut self, bytes: Bytes) -> Result<()> {
        self.body.extend_from_slice(&bytes);
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

