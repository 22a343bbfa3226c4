//! Call-aware proxy
//!
//! The public listener speaks HTTP/2 (gRPC over h2c). Every connection is
//! served by a tower stack: the local health check, then the gate, then the
//! passthrough to the shared backend connection. Faults are therefore applied
//! per call rather than per byte.

pub mod backend;
pub mod grpc;
pub mod interceptor;
pub mod passthrough;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hyper::server::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tower::ServiceBuilder;
use tracing::{debug, info, trace, warn};

use crate::config::{ProxyConfig, ProxyMode};
use crate::error::{ProxyError, ProxyResult};
use crate::frontend::{Frontend, ShutdownMode};
use crate::gate::Gate;
use crate::listener::{AcceptFn, ListenerManager};
use crate::metrics::ProxyMetrics;

use backend::BackendHandle;
use interceptor::{GateLayer, HealthLayer};
use passthrough::Passthrough;

/// Inbound HTTP/2 connections of the current run
#[derive(Default)]
struct Connections {
    tasks: JoinSet<()>,
    /// Present while the frontend is serving; taken on shutdown
    graceful: Option<GracefulShutdown>,
}

impl Connections {
    fn reap(&mut self) {
        while self.tasks.try_join_next().is_some() {}
    }
}

pub struct CallProxy {
    listener: ListenerManager,
    backend: Arc<BackendHandle>,
    gate: Arc<Gate>,
    metrics: ProxyMetrics,
    connections: Arc<Mutex<Connections>>,
    /// How long a graceful shutdown waits for in-flight calls
    grace: Duration,
}

impl CallProxy {
    /// # Errors
    ///
    /// Fails if the configured client certificate cannot be loaded.
    pub fn new(config: &ProxyConfig, gate: Arc<Gate>, metrics: ProxyMetrics) -> ProxyResult<Self> {
        let tls = crate::tls::client_connector(&config.tls)?;
        let backend = Arc::new(BackendHandle::new(
            config.proxy.dial.clone(),
            config.dial_timeout(),
            tls,
            metrics.clone(),
        ));

        Ok(Self {
            listener: ListenerManager::new(config.proxy.listen.clone(), gate.clone(), "call proxy"),
            backend,
            gate,
            metrics,
            connections: Arc::new(Mutex::new(Connections::default())),
            grace: config.shutdown_grace(),
        })
    }

    fn on_accept(&self) -> AcceptFn {
        let connections = self.connections.clone();
        let backend = self.backend.clone();
        let gate = self.gate.clone();
        let metrics = self.metrics.clone();

        Arc::new(move |stream: TcpStream, peer: SocketAddr| {
            let _ = stream.set_nodelay(true);
            let service = ServiceBuilder::new()
                .layer(HealthLayer)
                .layer(GateLayer::new(gate.clone(), metrics.clone()))
                .service(Passthrough::new(backend.clone(), metrics.clone()));

            let conn = http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));

            let mut connections = lock(&connections);
            connections.reap();
            let Some(graceful) = connections.graceful.as_ref() else {
                trace!("dropping connection from {} during shutdown", peer);
                return;
            };
            let conn = graceful.watch(conn);
            connections.tasks.spawn(async move {
                if let Err(e) = conn.await {
                    debug!("connection from {} ended: {}", peer, e);
                } else {
                    trace!("connection from {} closed", peer);
                }
            });
        })
    }

    /// Take the current connection set, leaving an empty one in its place
    fn take_connections(&self) -> Connections {
        std::mem::take(&mut *lock(&self.connections))
    }

    /// Abort every connection task and wait until all of them are gone
    async fn abort_connections(&self) -> usize {
        let mut taken = {
            let mut connections = lock(&self.connections);
            connections.reap();
            std::mem::take(&mut connections.tasks)
        };
        let count = taken.len();
        taken.shutdown().await;
        count
    }
}

fn lock(connections: &Mutex<Connections>) -> MutexGuard<'_, Connections> {
    connections.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Frontend for CallProxy {
    fn mode(&self) -> ProxyMode {
        ProxyMode::Call
    }

    async fn start(&self) -> ProxyResult<SocketAddr> {
        if self.listener.is_running().await {
            return Err(ProxyError::AlreadyStarted);
        }

        self.backend.connect().await?;

        // After a plain stop the old connections are still being served and
        // keep their drain signal; only a shutdown clears it.
        lock(&self.connections)
            .graceful
            .get_or_insert_with(GracefulShutdown::new);

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

        let Connections {
            mut tasks,
            graceful,
        } = self.take_connections();
        let count = tasks.len();

        match mode {
            ShutdownMode::Graceful => {
                // GOAWAY to every client, then wait for in-flight calls.
                debug!("draining {} connections", count);
                let pending = &mut tasks;
                let drain = async move {
                    if let Some(graceful) = graceful {
                        graceful.shutdown().await;
                    }
                    while pending.join_next().await.is_some() {}
                };
                if tokio::time::timeout(self.grace, drain).await.is_err() {
                    warn!("{} connections still open after {:?}, closed them", tasks.len(), self.grace);
                    tasks.shutdown().await;
                }
            }
            ShutdownMode::Forceful => {
                drop(graceful);
                tasks.shutdown().await;
                if count > 0 {
                    info!("closed {} connections", count);
                }
            }
        }

        self.backend.close().await;
        Ok(())
    }

    async fn kill_all(&self) -> ProxyResult<usize> {
        let killed = self.abort_connections().await;
        self.metrics.sessions_killed.inc_by(killed as u64);
        Ok(killed)
    }

    async fn is_running(&self) -> bool {
        self.listener.is_running().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    fn active_sessions(&self) -> usize {
        let mut connections = lock(&self.connections);
        connections.reap();
        connections.tasks.len()
    }
}
