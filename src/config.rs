use serde::{Deserialize, Serialize};

/// Recognized configuration options for the Listener Supervisor, mirroring
/// the native proxy's own boot configuration (see
/// `ServerNativeProxyConfig` in the collaborator's FFI surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: String,
    /// `0` requests an ephemeral OS-assigned port.
    pub port: u16,
    pub secure: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub tls_cert_password: Option<String>,
    pub backlog: u32,
    pub v6_only: bool,
    pub shared: bool,
    pub request_client_certificate: bool,
    pub http2: bool,
    pub http3: bool,
    pub transport_mode: TransportMode,
    pub limits: Limits,
    /// Idle timeout applied only to the initial frame read of a connection.
    pub idle_timeout: Option<std::time::Duration>,
    pub install_signal_handlers: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            secure: false,
            tls_cert_path: None,
            tls_key_path: None,
            tls_cert_password: None,
            backlog: 0,
            v6_only: false,
            shared: false,
            request_client_certificate: false,
            http2: true,
            http3: true,
            transport_mode: TransportMode::Stream,
            limits: Limits::default(),
            idle_timeout: None,
            install_signal_handlers: true,
        }
    }
}

impl BridgeConfig {
    /// `http3` is auto-disabled whenever TLS termination is off, matching
    /// the native proxy's own warning-and-disable behavior.
    pub fn effective_http3(&self) -> bool {
        if self.http3 && !self.secure {
            tracing::warn!("http3 requested without secure=true; disabling");
            return false;
        }
        self.http3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Stream,
    Callback,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub body_limit: usize,
    pub frame_limit: usize,
    pub coalesce_threshold: usize,
    pub body_chunk_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            body_limit: 32 * 1024 * 1024,
            frame_limit: 64 * 1024 * 1024,
            coalesce_threshold: 4 * 1024,
            body_chunk_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Tcp,
    #[cfg(unix)]
    Unix,
}
