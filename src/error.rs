use std::fmt;

/// Error taxonomy for the bridge transport. Kinds, not type names: every
/// variant corresponds to one of the propagation policies a caller must
/// apply (synthesize 400, synthesize 500, reset the connection, or stop
/// the supervisor).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid bridge request: {0}")]
    Malformed(String),

    #[error("bridge limit exceeded: {kind} size={size} limit={limit}")]
    LimitExceeded {
        kind: LimitKind,
        size: usize,
        limit: usize,
    },

    #[error("bridge protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("bridge handler failed: {0}")]
    HandlerFailure(String),

    #[error("bridge idle timeout")]
    IdleTimeout,

    #[error("native proxy failure: {0}")]
    NativeFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Frame,
    Body,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Frame => f.write_str("frame"),
            LimitKind::Body => f.write_str("body"),
        }
    }
}

impl BridgeError {
    /// Whether this error must be surfaced before any response start frame
    /// has been written (synthesize 400/500) or only after (reset/log+close).
    pub fn is_pre_response_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::Malformed(_) | BridgeError::LimitExceeded { .. } | BridgeError::HandlerFailure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
