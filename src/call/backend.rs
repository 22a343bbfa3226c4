// Backend connection (call-aware mode)
//
// One HTTP/2 connection to the real backend, shared by every inbound call.
// Dialed eagerly on start so that a dead backend fails the start, and
// re-dialed lazily when the connection has gone away in between.

use std::time::Duration;

use hyper::body::Incoming;
use hyper::client::conn::http2::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::metrics::ProxyMetrics;

struct Connection {
    sender: SendRequest<Incoming>,
    task: JoinHandle<()>,
}

pub struct BackendHandle {
    dial: String,
    dial_timeout: Duration,
    tls: Option<TlsConnector>,
    metrics: ProxyMetrics,
    conn: Mutex<Option<Connection>>,
}

impl BackendHandle {
    pub fn new(
        dial: impl Into<String>,
        dial_timeout: Duration,
        tls: Option<TlsConnector>,
        metrics: ProxyMetrics,
    ) -> Self {
        Self {
            dial: dial.into(),
            dial_timeout,
            tls,
            metrics,
            conn: Mutex::new(None),
        }
    }

    pub fn dial_addr(&self) -> &str {
        &self.dial
    }

    /// URI scheme the backend is spoken to with
    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }

    /// Dial the backend if there is no live connection
    pub async fn connect(&self) -> ProxyResult<()> {
        self.sender().await.map(|_| ())
    }

    /// Sender for the live connection, re-dialing if it has closed
    async fn sender(&self) -> ProxyResult<SendRequest<Incoming>> {
        let mut conn = self.conn.lock().await;
        if let Some(live) = conn.as_ref() {
            if !live.sender.is_closed() {
                return Ok(live.sender.clone());
            }
            debug!("backend connection to {} closed, re-dialing", self.dial);
        }

        let fresh = match self.dial().await {
            Ok(fresh) => fresh,
            Err(e) => {
                self.metrics.dial_failures.inc();
                return Err(e);
            }
        };
        let sender = fresh.sender.clone();
        if let Some(old) = conn.replace(fresh) {
            old.task.abort();
        }
        Ok(sender)
    }

    async fn dial(&self) -> ProxyResult<Connection> {
        trace!("dialing backend {}", self.dial);
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.dial))
            .await
            .map_err(|_| {
                ProxyError::dial(
                    &self.dial,
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
                )
            })?
            .map_err(|e| ProxyError::dial(&self.dial, e))?;
        let _ = stream.set_nodelay(true);

        match &self.tls {
            Some(connector) => {
                let tls = crate::tls::connect(connector, &self.dial, stream).await?;
                self.handshake(tls).await
            }
            None => self.handshake(stream).await,
        }
    }

    async fn handshake<T>(&self, io: T) -> ProxyResult<Connection>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(io))
            .await
            .map_err(|e| ProxyError::Backend(format!("HTTP/2 handshake with {} failed: {}", self.dial, e)))?;

        let dial = self.dial.clone();
        let task = tokio::spawn(async move {
            match conn.await {
                Ok(()) => debug!("backend connection to {} finished", dial),
                Err(e) if e.is_closed() || e.is_incomplete_message() => {
                    debug!("backend connection to {} closed: {}", dial, e)
                }
                Err(e) => warn!("backend connection to {} failed: {}", dial, e),
            }
        });

        debug!("connected to backend {}", self.dial);
        Ok(Connection { sender, task })
    }

    /// Forward one request on the shared connection
    pub async fn send(&self, request: Request<Incoming>) -> ProxyResult<Response<Incoming>> {
        let mut sender = self.sender().await?;
        sender
            .ready()
            .await
            .map_err(|e| ProxyError::Backend(e.to_string()))?;
        sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::Backend(e.to_string()))
    }

    /// Drop the connection; in-flight calls on it are aborted
    pub async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.task.abort();
            debug!("closed backend connection to {}", self.dial);
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.sender.is_closed())
    }
}
