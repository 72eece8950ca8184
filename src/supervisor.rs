//! Listener Supervisor: boots the bridge transport, selects stream vs.
//! callback transport, tracks connection accounting, and arbitrates
//! graceful vs. forced shutdown.

use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{BridgeConfig, TransportMode};
use crate::error::{BridgeError, Result};
use crate::ffi::NativeProxyHandle;
use crate::response::Handler;
use crate::stream_engine;

trait BridgeTransportStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> BridgeTransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}
type BoxBridgeStream = Box<dyn BridgeTransportStream>;

/// Where the native proxy should dial to reach the stream bridge.
#[derive(Debug, Clone)]
pub enum BridgeEndpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

enum AnyListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl AnyListener {
    async fn accept(&self) -> std::io::Result<BoxBridgeStream> {
        match self {
            AnyListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            AnyListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[derive(Default)]
struct ConnectionCounters {
    total: AtomicUsize,
    active: AtomicUsize,
    closing: AtomicUsize,
}

/// Snapshot returned by [`RunningProxy::connections_info`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionsInfo {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub closing: usize,
}

/// A started bridge transport. Dropping this without calling [`stop`]
/// leaves the accept loop and, on Unix, the socket file behind; always
/// call `stop`.
///
/// [`stop`]: RunningProxy::stop
pub struct RunningProxy {
    endpoint: Option<BridgeEndpoint>,
    /// Set only by [`Supervisor::start_dual_stack_loopback`]: the IPv6
    /// sibling of `endpoint`, sharing the same handler and counters.
    secondary_endpoint: Option<BridgeEndpoint>,
    counters: Arc<ConnectionCounters>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    native_handle: Option<NativeProxyHandle>,
    #[cfg(unix)]
    unix_path: Option<PathBuf>,
}

impl RunningProxy {
    pub fn endpoint(&self) -> Option<&BridgeEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn secondary_endpoint(&self) -> Option<&BridgeEndpoint> {
        self.secondary_endpoint.as_ref()
    }

    pub fn native_handle(&self) -> Option<&NativeProxyHandle> {
        self.native_handle.as_ref()
    }

    pub fn connections_info(&self) -> ConnectionsInfo {
        let active = self.counters.active.load(Ordering::SeqCst);
        let closing = self.counters.closing.load(Ordering::SeqCst);
        ConnectionsInfo {
            total: self.counters.total.load(Ordering::SeqCst),
            active,
            idle: active.saturating_sub(closing),
            closing,
        }
    }

    /// Stops accepting, closes the listener, and waits (up to 5s, unless
    /// `force`) for in-flight connections to finish on their own before
    /// aborting the accept task.
    pub async fn stop(mut self, force: bool) {
        if let Some(handle) = self.native_handle.take() {
            handle.stop().await;
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.accept_task.take() {
            if force {
                task.abort();
            } else if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("listener supervisor: forced shutdown after 5s grace period");
            }
        }
        #[cfg(unix)]
        if let Some(path) = self.unix_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Boots and tears down the stream transport (the handler side never
/// registers a callback itself; that happens through `ffi` for
/// [`TransportMode::Callback`]).
pub struct Supervisor;

impl Supervisor {
    /// Starts the stream bridge according to `config.transport_mode`.
    /// `Callback` mode is rejected here: it has no listener to supervise
    /// and is wired up instead via `ffi::register` + `direct_engine`.
    pub async fn start<H>(config: BridgeConfig, handler: Arc<H>) -> Result<RunningProxy>
    where
        H: Handler + 'static,
    {
        if config.transport_mode != TransportMode::Stream {
            return Err(BridgeError::NativeFailure(
                "callback transport has no listener; use `ffi::register` instead of `Supervisor::start`".into(),
            ));
        }

        let counters = Arc::new(ConnectionCounters::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let limits = config.limits;
        let idle_timeout = config.idle_timeout;

        #[cfg(unix)]
        {
            match bind_unix_listener() {
                Ok((listener, path)) => {
                    let backend = BridgeEndpoint::Unix(path.clone());
                    let native_handle = match NativeProxyHandle::start(config.clone(), Some(backend.clone())).await {
                        Ok((handle, _public_port)) => Some(handle),
                        Err(error) => {
                            tracing::warn!(%error, "native proxy failed to boot against the unix-domain backend");
                            let _ = std::fs::remove_file(&path);
                            return Err(error);
                        }
                    };
                    let accept_task = tokio::spawn(accept_loop(
                        AnyListener::Unix(listener),
                        handler,
                        counters.clone(),
                        limits,
                        idle_timeout,
                        shutdown_rx,
                    ));
                    return Ok(RunningProxy {
                        endpoint: Some(backend),
                        secondary_endpoint: None,
                        counters,
                        shutdown_tx: Some(shutdown_tx),
                        accept_task: Some(accept_task),
                        native_handle,
                        unix_path: Some(path),
                    });
                }
                Err(error) => {
                    tracing::warn!(%error, "unix-domain bridge bind failed, falling back to loopback TCP");
                }
            }
        }

        let listener = bind_tcp_listener(&config.host, config.port, config.backlog, config.v6_only, config.shared).await?;
        let addr = listener.local_addr().map_err(|error| BridgeError::NativeFailure(error.to_string()))?;
        let backend = BridgeEndpoint::Tcp(addr);
        let native_handle = NativeProxyHandle::start(config.clone(), Some(backend.clone())).await?;
        let accept_task = tokio::spawn(accept_loop(
            AnyListener::Tcp(listener),
            handler,
            counters.clone(),
            limits,
            idle_timeout,
            shutdown_rx,
        ));
        Ok(RunningProxy {
            endpoint: Some(backend),
            secondary_endpoint: None,
            counters,
            shutdown_tx: Some(shutdown_tx),
            accept_task: Some(accept_task),
            native_handle: Some(native_handle.0),
            #[cfg(unix)]
            unix_path: None,
        })
    }

    /// Starts a dual-stack loopback stream bridge (IPv4 + IPv6 on the
    /// same port, per `bind_dual_stack_loopback`), serving both listeners
    /// with the same handler and connection counters. Always picks the
    /// stream transport; `config.transport_mode` must be `Stream` and
    /// `config.host`/`config.port` are ignored in favor of the loopback
    /// probe (`config.port == 0` still requests an ephemeral port).
    pub async fn start_dual_stack_loopback<H>(config: BridgeConfig, handler: Arc<H>) -> Result<RunningProxy>
    where
        H: Handler + 'static,
    {
        if config.transport_mode != TransportMode::Stream {
            return Err(BridgeError::NativeFailure(
                "callback transport has no listener; use `ffi::register` instead of `Supervisor::start_dual_stack_loopback`".into(),
            ));
        }

        let (v4, v6, port) = bind_dual_stack_loopback(config.backlog, config.shared).await?;
        let v4_addr = v4.local_addr().map_err(|error| BridgeError::NativeFailure(error.to_string()))?;
        let v6_addr = v6.local_addr().map_err(|error| BridgeError::NativeFailure(error.to_string()))?;
        let backend = BridgeEndpoint::Tcp(v4_addr);
        let secondary = BridgeEndpoint::Tcp(v6_addr);
        let _ = port;

        let native_handle = NativeProxyHandle::start(config.clone(), Some(backend.clone())).await?;

        let counters = Arc::new(ConnectionCounters::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop_pair(
            v4,
            v6,
            handler,
            counters.clone(),
            config.limits,
            config.idle_timeout,
            shutdown_rx,
        ));

        Ok(RunningProxy {
            endpoint: Some(backend),
            secondary_endpoint: Some(secondary),
            counters,
            shutdown_tx: Some(shutdown_tx),
            accept_task: Some(accept_task),
            native_handle: Some(native_handle.0),
            #[cfg(unix)]
            unix_path: None,
        })
    }
}

async fn accept_loop<H>(
    listener: AnyListener,
    handler: Arc<H>,
    counters: Arc<ConnectionCounters>,
    limits: crate::config::Limits,
    idle_timeout: Option<Duration>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    H: Handler + 'static,
{
    let mut connections = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok(stream) => stream,
                    Err(error) => {
                        tracing::warn!(%error, "bridge accept failed");
                        continue;
                    }
                };
                counters.total.fetch_add(1, Ordering::SeqCst);
                counters.active.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                let counters = counters.clone();
                connections.spawn(async move {
                    if let Err(error) = stream_engine::serve(stream, handler, limits, idle_timeout).await {
                        tracing::warn!(%error, "bridge connection ended with error");
                    }
                    counters.active.fetch_sub(1, Ordering::SeqCst);
                    decrement_closing(&counters);
                });
            }
            Some(_) = connections.join_next() => {}
        }
    }
    // Shutdown requested: every connection still active is now draining.
    counters.closing.store(counters.active.load(Ordering::SeqCst), Ordering::SeqCst);
    connections.shutdown().await;
}

/// Saturating decrement: a no-op once `closing` has already reached 0,
/// which is the steady state before any shutdown has been requested.
fn decrement_closing(counters: &ConnectionCounters) {
    let _ = counters
        .closing
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)));
}

/// Like `accept_loop` but races two TCP listeners (the IPv4/IPv6
/// dual-stack loopback pair) against the same shutdown signal and
/// connection accounting, since `tokio::select!` can't loop over a
/// dynamically-sized listener set.
async fn accept_loop_pair<H>(
    v4: TcpListener,
    v6: TcpListener,
    handler: Arc<H>,
    counters: Arc<ConnectionCounters>,
    limits: crate::config::Limits,
    idle_timeout: Option<Duration>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    H: Handler + 'static,
{
    let mut connections = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = v4.accept() => {
                spawn_accepted(accepted.map(|(s, _)| s), &handler, &counters, limits, idle_timeout, &mut connections);
            }
            accepted = v6.accept() => {
                spawn_accepted(accepted.map(|(s, _)| s), &handler, &counters, limits, idle_timeout, &mut connections);
            }
            Some(_) = connections.join_next() => {}
        }
    }
    counters.closing.store(counters.active.load(Ordering::SeqCst), Ordering::SeqCst);
    connections.shutdown().await;
}

fn spawn_accepted<H>(
    accepted: std::io::Result<tokio::net::TcpStream>,
    handler: &Arc<H>,
    counters: &Arc<ConnectionCounters>,
    limits: crate::config::Limits,
    idle_timeout: Option<Duration>,
    connections: &mut tokio::task::JoinSet<()>,
) where
    H: Handler + 'static,
{
    let stream = match accepted {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(%error, "bridge accept failed");
            return;
        }
    };
    if let Err(error) = stream.set_nodelay(true) {
        tracing::warn!(%error, "failed to set TCP_NODELAY on accepted bridge connection");
    }
    counters.total.fetch_add(1, Ordering::SeqCst);
    counters.active.fetch_add(1, Ordering::SeqCst);
    let handler = handler.clone();
    let counters = counters.clone();
    connections.spawn(async move {
        if let Err(error) = stream_engine::serve(stream, handler, limits, idle_timeout).await {
            tracing::warn!(%error, "bridge connection ended with error");
        }
        counters.active.fetch_sub(1, Ordering::SeqCst);
        decrement_closing(&counters);
    });
}

#[cfg(unix)]
fn bind_unix_listener() -> std::result::Result<(UnixListener, PathBuf), std::io::Error> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let pid = std::process::id();
    let timestamp_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or_default();
    let path = std::env::temp_dir().join(format!("bridge_transport_{pid}_{timestamp_us}.sock"));
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    Ok((listener, path))
}

async fn bind_tcp_listener(host: &str, port: u16, backlog: u32, v6_only: bool, shared: bool) -> Result<TcpListener> {
    let mut resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|error| BridgeError::NativeFailure(format!("resolve {host}:{port} failed: {error}")))?;
    let mut last_error = None;
    while let Some(addr) = resolved.next() {
        match bind_tcp_listener_addr(addr, backlog, v6_only, shared) {
            Ok(listener) => return Ok(listener),
            Err(error) => last_error = Some(format!("bind {addr} failed: {error}")),
        }
    }
    Err(BridgeError::NativeFailure(
        last_error.unwrap_or_else(|| format!("no resolved addresses for {host}:{port}")),
    ))
}

fn bind_tcp_listener_addr(addr: SocketAddr, backlog: u32, v6_only: bool, shared: bool) -> std::result::Result<TcpListener, String> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|error| format!("socket create failed: {error}"))?;

    if addr.is_ipv6() {
        socket.set_only_v6(v6_only).map_err(|error| format!("set_only_v6 failed: {error}"))?;
    }
    if shared {
        socket.set_reuse_address(true).map_err(|error| format!("set_reuse_address failed: {error}"))?;
        #[cfg(unix)]
        socket.set_reuse_port(true).map_err(|error| format!("set_reuse_port failed: {error}"))?;
    }
    socket.bind(&addr.into()).map_err(|error| format!("socket bind failed: {error}"))?;

    let backlog = if backlog == 0 { 1024 } else { backlog.min(i32::MAX as u32) };
    socket.listen(backlog as i32).map_err(|error| format!("socket listen failed: {error}"))?;
    socket.set_nonblocking(true).map_err(|error| format!("set_nonblocking failed: {error}"))?;

    let listener = std::net::TcpListener::from(socket);
    TcpListener::from_std(listener).map_err(|error| format!("from_std failed: {error}"))
}

/// Probes a single ephemeral port that is free on both stacks: binds
/// IPv4 loopback first, then retries IPv6 loopback on the same port
/// number, retrying with a fresh IPv4 pick on collision.
pub async fn bind_dual_stack_loopback(backlog: u32, shared: bool) -> Result<(TcpListener, TcpListener, u16)> {
    const MAX_ATTEMPTS: usize = 16;
    let mut last_error = None;
    for _ in 0..MAX_ATTEMPTS {
        let v4_addr: SocketAddr = "127.0.0.1:0".parse().expect("valid loopback address");
        let v4 = match bind_tcp_listener_addr(v4_addr, backlog, false, shared) {
            Ok(listener) => listener,
            Err(error) => {
                last_error = Some(error);
                continue;
            }
        };
        let port = v4.local_addr().map_err(|error| BridgeError::NativeFailure(error.to_string()))?.port();
        let v6_addr: SocketAddr = format!("[::1]:{port}").parse().expect("valid loopback address");
        match bind_tcp_listener_addr(v6_addr, backlog, true, shared) {
            Ok(v6) => return Ok((v4, v6, port)),
            Err(error) => {
                last_error = Some(error);
                drop(v4);
            }
        }
    }
    Err(BridgeError::NativeFailure(
        last_error.unwrap_or_else(|| "dual-stack loopback probe exhausted retries".into()),
    ))
}

/// Drives a started proxy to completion: waits for `install_signal_handlers`
/// host signals (if enabled) or an externally supplied `shutdown_signal`
/// future, then runs the graceful-with-forced-fallback shutdown sequence.
/// A second signal while already shutting down forces an immediate abort.
pub async fn run_until_shutdown(proxy: RunningProxy, install_signal_handlers: bool, shutdown_signal: Option<impl std::future::Future<Output = ()>>) {
    if let Some(external) = shutdown_signal {
        external.await;
        proxy.stop(false).await;
        return;
    }
    if !install_signal_handlers {
        std::future::pending::<()>().await;
        return;
    }

    wait_for_signal().await;
    tracing::info!("listener supervisor: shutdown signal received, starting graceful stop");
    tokio::select! {
        _ = proxy.stop(false) => {}
        _ = wait_for_signal() => {
            tracing::warn!("listener supervisor: second shutdown signal received, forcing exit");
            std::process::exit(1);
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ResponseStart, WholeRequest};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::StatusCode;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn call(&self, request: WholeRequest) -> Result<(ResponseStart, Bytes)> {
            Ok((ResponseStart::new(StatusCode::OK, Vec::new()), request.body))
        }
    }

    #[tokio::test]
    async fn stream_supervisor_binds_and_reports_connections() {
        let mut config = BridgeConfig::default();
        config.port = 0;
        config.transport_mode = TransportMode::Stream;
        let proxy = Supervisor::start(config, Arc::new(EchoHandler)).await.expect("bind should succeed");
        assert!(proxy.endpoint().is_some());
        let info = proxy.connections_info();
        assert_eq!(info.total, 0);
        proxy.stop(true).await;
    }

    #[tokio::test]
    async fn dual_stack_loopback_binds_both_families_on_the_same_port() {
        let mut config = BridgeConfig::default();
        config.transport_mode = TransportMode::Stream;
        let proxy = Supervisor::start_dual_stack_loopback(config, Arc::new(EchoHandler))
            .await
            .expect("dual-stack bind should succeed");
        let BridgeEndpoint::Tcp(v4_addr) = proxy.endpoint().expect("v4 endpoint") else {
            panic!("expected a TCP endpoint");
        };
        let BridgeEndpoint::Tcp(v6_addr) = proxy.secondary_endpoint().expect("v6 endpoint") else {
            panic!("expected a TCP endpoint");
        };
        assert_eq!(v4_addr.port(), v6_addr.port());
        proxy.stop(true).await;
    }

    #[tokio::test]
    async fn callback_mode_is_rejected_by_stream_supervisor() {
        let mut config = BridgeConfig::default();
        config.transport_mode = TransportMode::Callback;
        let result = Supervisor::start(config, Arc::new(EchoHandler)).await;
        assert!(result.is_err());
    }
}
