//! Per-request state vocabulary shared between the Bridge Stream Engine
//! and the Direct Callback Engine.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::codec::{HeaderField, RequestHead};
use crate::error::{BridgeError, Result};

/// Lifecycle of one request, as seen by either engine. Used for
/// debug-mode invariant assertions (exactly-one-start, no chunks outside
/// start/end, etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLifecycle {
    Idle,
    Receiving,
    Dispatched,
    ResponseStarted,
    ResponseChunk,
    ResponseEnded,
    Tunneling,
    Closed,
    FailedBadRequest,
    FailedConnectionReset,
}

impl RequestLifecycle {
    pub fn fail(self) -> Self {
        if matches!(self, RequestLifecycle::ResponseStarted | RequestLifecycle::ResponseChunk) {
            RequestLifecycle::FailedConnectionReset
        } else {
            RequestLifecycle::FailedBadRequest
        }
    }
}

/// The request body as seen by a streamed handler: a bounded channel of
/// chunks, fed by the engine's frame reader and terminated by an
/// end-of-stream or error signal.
pub struct BodyStream {
    rx: mpsc::Receiver<std::result::Result<Bytes, BridgeError>>,
}

impl BodyStream {
    pub fn new(rx: mpsc::Receiver<std::result::Result<Bytes, BridgeError>>) -> Self {
        Self { rx }
    }

    /// Fully buffers the stream up to `limit` bytes, for adapting a
    /// whole-body handler over a streamed request.
    pub async fn collect(mut self, limit: usize) -> Result<Bytes> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(BridgeError::LimitExceeded {
                    kind: crate::error::LimitKind::Body,
                    size: buf.len() + chunk.len(),
                    limit,
                });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(buf))
    }

    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await.map(|r| r.map_err(Into::into))
    }
}

/// Producer side of [`BodyStream`], owned by the engine's frame reader.
pub type BodySender = mpsc::Sender<std::result::Result<Bytes, BridgeError>>;

pub fn body_channel(capacity: usize) -> (BodySender, BodyStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, BodyStream::new(rx))
}

/// A response the handler wants to send, plus an optional detach flag for
/// protocol upgrades (see [`crate::response::ResponseSink`]).
#[derive(Debug, Clone)]
pub struct ResponseStart {
    pub head: crate::codec::ResponseHead,
    pub detach: bool,
}

impl ResponseStart {
    pub fn new(status: http::StatusCode, headers: Vec<HeaderField>) -> Self {
        Self {
            head: crate::codec::ResponseHead { status, headers },
            detach: false,
        }
    }

    pub fn detached(status: http::StatusCode, headers: Vec<HeaderField>) -> Self {
        Self {
            head: crate::codec::ResponseHead { status, headers },
            detach: true,
        }
    }
}

/// One fully-decoded inline request, handed to a whole-body handler.
#[derive(Debug, Clone)]
pub struct WholeRequest {
    pub head: RequestHead,
    pub body: Bytes,
}
