// Byte Proxy
//
// TCP pass-through frontend: the listener hands every accepted connection to
// the session manager, which pairs it with a backend connection.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, ProxyMode};
use crate::error::{ProxyError, ProxyResult};
use crate::frontend::{Frontend, ShutdownMode};
use crate::gate::Gate;
use crate::listener::{AcceptFn, ListenerManager};
use crate::metrics::ProxyMetrics;
use crate::session::SessionManager;

pub struct ByteProxy {
    listener: ListenerManager,
    sessions: Arc<SessionManager>,
    /// How long a graceful shutdown waits for sessions before killing them
    grace: Duration,
}

impl ByteProxy {
    pub fn new(config: &ProxyConfig, gate: Arc<Gate>, metrics: ProxyMetrics) -> Self {
        let sessions = Arc::new(SessionManager::new(
            config.proxy.dial.clone(),
            config.dial_timeout(),
            config.proxy.buffer_size,
            gate.clone(),
            metrics,
        ));
        Self {
            listener: ListenerManager::new(config.proxy.listen.clone(), gate, "byte proxy"),
            sessions,
            grace: config.shutdown_grace(),
        }
    }

    fn on_accept(&self) -> AcceptFn {
        let sessions = self.sessions.clone();
        Arc::new(move |stream, peer| {
            tokio::spawn(sessions.clone().handle(stream, peer));
        })
    }
}

#[async_trait]
impl Frontend for ByteProxy {
    fn mode(&self) -> ProxyMode {
        ProxyMode::Byte
    }

    async fn start(&self) -> ProxyResult<SocketAddr> {
        self.listener.start(self.on_accept()).await
    }

    async fn stop_listening(&self) -> ProxyResult<()> {
        self.listener.stop().await
    }

    async fn shutdown(&self, mode: ShutdownMode) -> ProxyResult<()> {
        match self.listener.stop().await {
            Ok(()) | Err(ProxyError::AlreadyStopped) => {}
            Err(e) => return Err(e),
        }

        match mode {
            ShutdownMode::Graceful => {
                debug!("waiting for {} sessions to drain", self.sessions.active());
                if tokio::time::timeout(self.grace, self.sessions.wait_idle())
                    .await
                    .is_err()
                {
                    let killed = self.sessions.kill_all().await;
                    warn!("{} sessions still open after {:?}, closed them", killed, self.grace);
                }
            }
            ShutdownMode::Forceful => {
                let killed = self.sessions.kill_all().await;
                if killed > 0 {
                    info!("closed {} sessions", killed);
                }
            }
        }
        Ok(())
    }

    async fn kill_all(&self) -> ProxyResult<usize> {
        Ok(self.sessions.kill_all().await)
    }

    async fn is_running(&self) -> bool {
        self.listener.is_running().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    fn active_sessions(&self) -> usize {
        self.sessions.active()
    }
}
