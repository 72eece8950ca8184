//! Native proxy ABI: the six `extern "C"` entry points this crate calls
//! into the native proxy (the external collaborator that terminates
//! HTTP/TLS and owns the client-facing socket). The shape mirrors
//! `routed_ffi_*`/`server_native_*` exports from the native proxy's own
//! library, just from the other side of the boundary — there it is the
//! exporter, here it is the importer.

use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::config::{BridgeConfig, TransportMode};
use crate::direct_engine::{DirectEngine, FramePusher};
use crate::error::{BridgeError, Result};
use crate::response::Handler;
use crate::supervisor::BridgeEndpoint;

#[cfg(not(any(test, feature = "mock-native-ffi")))]
extern "C" {
    /// Must return > 0; a return of 0 means the linked native proxy is
    /// not ABI-compatible with this crate.
    fn abi_version() -> u32;

    /// Boots the native proxy. Returns null on failure. On success,
    /// `out_port` receives the bound public port.
    fn start_proxy(config: *const NativeProxyConfig, out_port: *mut u16) -> *mut c_void;

    fn stop_proxy(handle: *mut c_void);

    fn push_response_frame(handle: *mut c_void, request_id: u64, ptr: *const u8, len: u64) -> bool;

    fn poll_request_frame(
        handle: *mut c_void,
        timeout_ms: i64,
        req_id_out: *mut u64,
        payload_ptr_out: *mut *mut u8,
        payload_len_out: *mut u64,
    ) -> bool;

    fn free_request_payload(ptr: *mut u8, len: u64);
}

// This crate's test suite can't link the real native proxy shared
// library (there isn't one in this workspace), so test builds swap in
// an in-process stand-in with the same six signatures. Unit tests get
// this via plain `cfg(test)`; integration tests under `tests/` link
// this crate as an ordinary dependency with `cfg(test)` unset, so they
// reach the mock through the `mock-native-ffi` feature instead (enabled
// for dev builds via the self-referential dev-dependency below).
// Production builds always use the real `extern "C"` block above.
#[cfg(any(test, feature = "mock-native-ffi"))]
use mock_native::{abi_version, free_request_payload, poll_request_frame, push_response_frame, start_proxy, stop_proxy};

#[cfg(any(test, feature = "mock-native-ffi"))]
mod mock_native {
    use super::NativeProxyConfig;
    use std::os::raw::c_void;
    use std::sync::Mutex;

    struct MockState {
        pushed: Vec<(u64, Vec<u8>)>,
    }

    static NEXT_PORT: Mutex<u16> = Mutex::new(41000);

    pub unsafe fn abi_version() -> u32 {
        1
    }

    pub unsafe fn start_proxy(_config: *const NativeProxyConfig, out_port: *mut u16) -> *mut c_void {
        let mut next = NEXT_PORT.lock().unwrap();
        *out_port = *next;
        *next += 1;
        Box::into_raw(Box::new(Mutex::new(MockState { pushed: Vec::new() }))) as *mut c_void
    }

    pub unsafe fn stop_proxy(handle: *mut c_void) {
        if !handle.is_null() {
            drop(Box::from_raw(handle as *mut Mutex<MockState>));
        }
    }

    pub unsafe fn push_response_frame(handle: *mut c_void, request_id: u64, ptr: *const u8, len: u64) -> bool {
        if handle.is_null() {
            return false;
        }
        let state = &*(handle as *mut Mutex<MockState>);
        let bytes = std::slice::from_raw_parts(ptr, len as usize).to_vec();
        state.lock().unwrap().pushed.push((request_id, bytes));
        true
    }

    pub unsafe fn poll_request_frame(
        _handle: *mut c_void,
        _timeout_ms: i64,
        _req_id_out: *mut u64,
        _payload_ptr_out: *mut *mut u8,
        _payload_len_out: *mut u64,
    ) -> bool {
        false
    }

    pub unsafe fn free_request_payload(_ptr: *mut u8, _len: u64) {}
}

const BACKEND_KIND_TCP: u8 = 0;
const BACKEND_KIND_UNIX: u8 = 1;
const BACKEND_KIND_DIRECT: u8 = 2;

/// C-compatible boot configuration passed to [`start_proxy`]. Field set
/// mirrors `ServerNativeProxyConfig`/`RoutedFfiProxyConfig` (public bind +
/// backend selection + TLS toggles), adapted to also carry a
/// `backend_kind = DIRECT` variant for the callback transport, which the
/// native side those configs come from never needed (it only ever dialed
/// a bridge socket, never polled a callback queue).
#[repr(C)]
struct NativeProxyConfig {
    host: *const c_char,
    port: u16,
    backend_kind: u8,
    backend_host: *const c_char,
    backend_port: u16,
    backend_path: *const c_char,
    backlog: u32,
    v6_only: u8,
    shared: u8,
    request_client_certificate: u8,
    http2: u8,
    http3: u8,
    tls_cert_path: *const c_char,
    tls_key_path: *const c_char,
    tls_cert_password: *const c_char,
}

/// Keeps the `CString`s referenced by a [`NativeProxyConfig`] alive for
/// the duration of the `start_proxy` call.
struct ConfigStrings {
    host: CString,
    backend_host: Option<CString>,
    backend_path: Option<CString>,
    tls_cert_path: Option<CString>,
    tls_key_path: Option<CString>,
    tls_cert_password: Option<CString>,
}

fn optional_cstring(value: &Option<String>) -> Result<Option<CString>> {
    match value {
        Some(s) => Ok(Some(
            CString::new(s.as_str()).map_err(|_| BridgeError::NativeFailure(format!("{s:?} contains an interior nul byte")))?,
        )),
        None => Ok(None),
    }
}

fn build_config(config: &BridgeConfig, backend: Option<&BridgeEndpoint>) -> Result<(NativeProxyConfig, ConfigStrings)> {
    let host = CString::new(config.host.as_str()).map_err(|_| BridgeError::NativeFailure("host contains an interior nul byte".into()))?;
    let tls_cert_path = optional_cstring(&config.tls_cert_path)?;
    let tls_key_path = optional_cstring(&config.tls_key_path)?;
    let tls_cert_password = optional_cstring(&config.tls_cert_password)?;

    let (backend_kind, backend_host, backend_port, backend_path) = match (config.transport_mode, backend) {
        (TransportMode::Callback, _) => (BACKEND_KIND_DIRECT, None, 0u16, None),
        (TransportMode::Stream, Some(BridgeEndpoint::Tcp(addr))) => {
            let host = CString::new(addr.ip().to_string()).map_err(|_| BridgeError::NativeFailure("backend host contains an interior nul byte".into()))?;
            (BACKEND_KIND_TCP, Some(host), addr.port(), None)
        }
        #[cfg(unix)]
        (TransportMode::Stream, Some(BridgeEndpoint::Unix(path))) => {
            let path = CString::new(path.to_string_lossy().into_owned())
                .map_err(|_| BridgeError::NativeFailure("backend path contains an interior nul byte".into()))?;
            (BACKEND_KIND_UNIX, None, 0u16, Some(path))
        }
        (TransportMode::Stream, None) => {
            return Err(BridgeError::NativeFailure("stream transport requires a bound backend endpoint".into()));
        }
    };

    let strings = ConfigStrings {
        host,
        backend_host,
        backend_path,
        tls_cert_path,
        tls_key_path,
        tls_cert_password,
    };

    let native_config = NativeProxyConfig {
        host: strings.host.as_ptr(),
        port: config.port,
        backend_kind,
        backend_host: strings.backend_host.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()),
        backend_port,
        backend_path: strings.backend_path.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()),
        backlog: config.backlog,
        v6_only: config.v6_only as u8,
        shared: config.shared as u8,
        request_client_certificate: config.request_client_certificate as u8,
        http2: config.http2 as u8,
        http3: config.effective_http3() as u8,
        tls_cert_path: strings.tls_cert_path.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()),
        tls_key_path: strings.tls_key_path.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()),
        tls_cert_password: strings.tls_cert_password.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()),
    };

    Ok((native_config, strings))
}

/// Raw handle pointer, wrapped so it can cross thread/task boundaries.
/// Safety: the native proxy's documented contract is that `push`/`poll`/
/// `stop` may be called concurrently from any thread once `start`
/// returns a non-null handle.
struct RawHandle(*mut c_void);
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

/// Owns a running native proxy instance. Must be stopped exactly once
/// (via [`NativeProxyHandle::stop`]); a late call after process teardown
/// is harmless because the native side is expected to tolerate it.
pub struct NativeProxyHandle {
    raw: RawHandle,
}

impl NativeProxyHandle {
    /// Verifies the linked native proxy's ABI version is nonzero.
    pub fn check_abi_version() -> Result<u32> {
        let version = unsafe { abi_version() };
        if version == 0 {
            return Err(BridgeError::NativeFailure("native proxy reported abi_version() == 0".into()));
        }
        Ok(version)
    }

    /// Boots the native proxy with `config`, passing `backend` as the
    /// bridge backend endpoint (`None` only valid for callback mode).
    /// `start_proxy` is expected to return quickly (it hands its own
    /// accept loop to a background thread), so this calls it inline
    /// rather than via the blocking pool.
    pub async fn start(config: BridgeConfig, backend: Option<BridgeEndpoint>) -> Result<(Self, u16)> {
        Self::check_abi_version()?;
        let (native_config, _strings) = build_config(&config, backend.as_ref())?;
        let mut out_port: u16 = 0;
        let out_port_ptr: *mut u16 = &mut out_port;
        let config_ptr: *const NativeProxyConfig = &native_config;

        // `NativeProxyConfig` embeds raw pointers borrowed from `_strings`
        // and is only dereferenced synchronously inside `start_proxy`, so
        // it is sound to call directly without moving it across threads.
        let handle = unsafe { start_proxy(config_ptr, out_port_ptr) };
        if handle.is_null() {
            return Err(BridgeError::NativeFailure("start_proxy returned null".into()));
        }
        Ok((NativeProxyHandle { raw: RawHandle(handle) }, out_port))
    }

    pub async fn stop(self) {
        let raw = self.raw.0;
        let _ = tokio::task::spawn_blocking(move || unsafe { stop_proxy(raw) }).await;
    }

    fn push(&self, request_id: u64, frame: &[u8]) -> bool {
        unsafe { push_response_frame(self.raw.0, request_id, frame.as_ptr(), frame.len() as u64) }
    }
}

impl FramePusher for NativeProxyHandle {
    fn push(&self, request_id: u64, frame: &[u8]) -> bool {
        NativeProxyHandle::push(self, request_id, frame)
    }
}

fn poll_once(raw: *mut c_void, timeout_ms: i64) -> Result<Option<(u64, Bytes)>> {
    let mut req_id: u64 = 0;
    let mut ptr: *mut u8 = std::ptr::null_mut();
    let mut len: u64 = 0;
    let got = unsafe { poll_request_frame(raw, timeout_ms, &mut req_id, &mut ptr, &mut len) };
    if !got {
        return Ok(None);
    }
    if ptr.is_null() {
        return Err(BridgeError::NativeFailure("poll_request_frame returned a null payload".into()));
    }
    let owned = unsafe { Bytes::copy_from_slice(std::slice::from_raw_parts(ptr, len as usize)) };
    unsafe { free_request_payload(ptr, len) };
    Ok(Some((req_id, owned)))
}

/// Drives the Direct Callback Engine from `poll_request_frame`, stopping
/// when `shutdown` resolves. Each poll runs on the blocking thread pool
/// since the native proxy's contract allows it to block up to
/// `timeout_ms`; `engine.dispatch` itself always runs back on the async
/// runtime so it can freely `tokio::spawn`.
pub async fn run_poll_loop<P, H>(handle: Arc<NativeProxyHandle>, engine: DirectEngine<P, H>, timeout_ms: i64, mut shutdown: oneshot::Receiver<()>)
where
    P: FramePusher + 'static,
    H: Handler + 'static,
{
    loop {
        let raw = RawHandle(handle.raw.0);
        let poll = tokio::task::spawn_blocking(move || poll_once(raw.0, timeout_ms));
        tokio::select! {
            _ = &mut shutdown => break,
            result = poll => {
                match result {
                    Ok(Ok(Some((request_id, payload)))) => engine.dispatch(request_id, payload),
                    Ok(Ok(None)) => {}
                    Ok(Err(error)) => tracing::warn!(%error, "poll_request_frame reported a malformed payload"),
                    Err(join_error) => tracing::warn!(%join_error, "poll_request_frame task panicked"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_stop_direct_callback_proxy() {
        let config = BridgeConfig {
            transport_mode: TransportMode::Callback,
            ..BridgeConfig::default()
        };
        let (handle, port) = NativeProxyHandle::start(config, None).await.expect("mock start_proxy should succeed");
        assert!(port >= 41000);
        assert!(handle.push(1, b"frame"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn stream_mode_without_backend_is_rejected() {
        let config = BridgeConfig {
            transport_mode: TransportMode::Stream,
            ..BridgeConfig::default()
        };
        let result = NativeProxyHandle::start(config, None).await;
        assert!(result.is_err());
    }
}
