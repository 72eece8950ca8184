//! A handler-side implementation of the HTTP bridge transport protocol:
//! the frame codec, the two request/response engines (stream and direct
//! callback), and the listener supervisor that boots the native proxy
//! this crate's handler serves behind.
//!
//! Applications implement [`response::Handler`] and pass it to either
//! [`supervisor::Supervisor::start`] (stream transport, this crate owns
//! the socket) or [`direct_engine::DirectEngine`] driven by
//! [`ffi::run_poll_loop`] (callback transport, no socket — requests
//! arrive polled from the native proxy across the FFI boundary).

pub mod codec;
pub mod config;
pub mod direct_engine;
pub mod error;
pub mod ffi;
pub mod request;
pub mod response;
pub mod stream_engine;
pub mod supervisor;

pub use config::{BackendKind, BridgeConfig, Limits, TransportMode};
pub use direct_engine::{DirectEngine, FramePusher};
pub use error::{BridgeError, Result};
pub use ffi::NativeProxyHandle;
pub use request::{BodyStream, ResponseStart, WholeRequest};
pub use response::{BufferingSink, Handler, ResponseSink, Tunnel};
pub use supervisor::{BridgeEndpoint, ConnectionsInfo, RunningProxy, Supervisor};
