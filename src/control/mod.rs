//! Control-plane server
//!
//! A small HTTP server on its own address. It is started once, before the
//! first client is pointed at the proxy, and survives every restart of the
//! proxy frontend. Each run gets a fresh handle; `shutdown` drains in-flight
//! requests while `close` drops them.

pub mod client;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::normalize_listen_addr;
use crate::controller::Controller;
use crate::error::{ProxyError, ProxyResult};

struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ControlServer {
    requested: String,
    controller: Arc<Controller>,
    handle: Mutex<Option<ServerHandle>>,
}

impl ControlServer {
    pub fn new(requested: impl Into<String>, controller: Arc<Controller>) -> Self {
        Self {
            requested: requested.into(),
            controller,
            handle: Mutex::new(None),
        }
    }

    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AlreadyStarted`] if already serving, or a bind
    /// error.
    pub async fn start(&self) -> ProxyResult<SocketAddr> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Err(ProxyError::AlreadyStarted);
        }

        let target = normalize_listen_addr(&self.requested);
        let listener = TcpListener::bind(&target)
            .await
            .map_err(|e| ProxyError::bind(&target, e))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = handlers::router(self.controller.clone());
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!("control server failed: {}", e);
            }
        });

        info!("control server is listening on {}", addr);
        *handle = Some(ServerHandle {
            addr,
            shutdown_tx,
            task,
        });
        Ok(addr)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.lock().await.as_ref().map(|h| h.addr)
    }

    /// Stop accepting and wait for in-flight requests to finish
    pub async fn shutdown(&self) -> ProxyResult<()> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Err(ProxyError::AlreadyStopped);
        };
        let _ = handle.shutdown_tx.send(());
        if let Err(e) = handle.task.await {
            if e.is_panic() {
                error!("control server panicked: {}", e);
            }
        }
        info!("control server on {} shut down", handle.addr);
        Ok(())
    }

    /// Drop the server and every open control connection immediately
    pub async fn close(&self) -> ProxyResult<()> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Err(ProxyError::AlreadyStopped);
        };
        handle.task.abort();
        let _ = handle.task.await;
        info!("control server on {} closed", handle.addr);
        Ok(())
    }
}
