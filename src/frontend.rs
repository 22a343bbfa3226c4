use async_trait::async_trait;
use std::net::SocketAddr;

use crate::config::ProxyMode;
use crate::error::ProxyResult;

/// How a frontend is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop listening, then wait for live sessions/calls to finish on their own
    Graceful,

    /// Stop listening and sever everything immediately
    Forceful,
}

impl ShutdownMode {
    pub fn from_forceful(forceful: bool) -> Self {
        if forceful {
            ShutdownMode::Forceful
        } else {
            ShutdownMode::Graceful
        }
    }
}

/// Public-facing side of the proxy
///
/// This trait covers both the byte proxy and the call-aware proxy, so the
/// controller can drive either without knowing which one it holds.
#[async_trait]
pub trait Frontend: Send + Sync {
    /// Which kind of proxying this frontend does
    fn mode(&self) -> ProxyMode;

    /// Bind the listener (and dial the backend, where one is kept open)
    async fn start(&self) -> ProxyResult<SocketAddr>;

    /// Close the listener only; live sessions/calls keep running
    async fn stop_listening(&self) -> ProxyResult<()>;

    /// Tear everything down
    async fn shutdown(&self, mode: ShutdownMode) -> ProxyResult<()>;

    /// Sever every live session/connection and wait until they are gone
    async fn kill_all(&self) -> ProxyResult<usize>;

    /// Whether the listener is live
    async fn is_running(&self) -> bool;

    /// Stable public address, once bound
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Sessions (byte mode) or connections (call-aware mode) currently open
    fn active_sessions(&self) -> usize;
}
