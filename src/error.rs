// Proxy Error Types
//
// All errors surfaced by the proxy library. Control actions return these to
// the control plane, which maps them onto HTTP status codes.

use std::io;
use std::net::SocketAddr;

use axum::http::StatusCode;

/// Convenience alias used throughout the crate
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Error types for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// `/start` on a running frontend
    #[error("already started")]
    AlreadyStarted,

    /// `/stop` on a stopped frontend
    #[error("already stopped")]
    AlreadyStopped,

    /// Listener could not be bound
    #[error("failed to listen on {addr:?}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Backend could not be dialed
    #[error("failed to dial {addr:?}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// HTTP/2 handshake or request against the backend failed
    #[error("backend error: {0}")]
    Backend(String),

    /// TLS material could not be loaded or the handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed control-plane query parameter
    #[error("invalid query parameter: {0}")]
    InvalidQuery(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The proxy could not be brought back after a restart
    #[error("restart failed, proxy is shutting down: {0}")]
    RestartFailed(Box<ProxyError>),

    /// A lifecycle action's task ended without a result
    #[error("control action aborted: {0}")]
    Aborted(String),

    /// Any other I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Build a bind error for the given address
    pub fn bind(addr: impl ToString, source: io::Error) -> Self {
        ProxyError::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Build a dial error for the given address
    pub fn dial(addr: impl ToString, source: io::Error) -> Self {
        ProxyError::Dial {
            addr: addr.to_string(),
            source,
        }
    }

    /// Whether this error only reports that something was already closed
    pub fn is_closed(&self) -> bool {
        match self {
            ProxyError::Io(err) => is_closed_io(err),
            _ => false,
        }
    }

    /// HTTP status reported by the control plane for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Classify I/O errors that only mean "the other side (or we) already closed".
///
/// These happen all the time during stop, kill-all and restart and are
/// treated as clean termination rather than failures.
pub fn is_closed_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Short description of a connection, used as a log badge
pub fn badge(id: u64, peer: SocketAddr, local: SocketAddr) -> String {
    format!("#{}; {}->{}", id, peer, local)
}
