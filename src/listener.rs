// Listener Manager
//
// Owns the public listening socket and its background accept loop. Each
// start builds a fresh ListenerHandle; stop tears it down and waits for the
// accept loop to exit before returning.
//
// The first bind may ask for an ephemeral port. The concrete address the OS
// hands out is remembered and reused on every later start, so clients that
// were pointed at the proxy once keep working across stop/start and restart.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::config::normalize_listen_addr;
use crate::error::{is_closed_io, ProxyError, ProxyResult};
use crate::gate::Gate;

/// Pause after an accept error that is not a shutdown, so a persistent
/// failure (e.g. out of file descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Called for every accepted connection. Must not block: long-lived work is
/// expected to be spawned.
pub type AcceptFn = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

/// One run of the accept loop
struct ListenerHandle {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Starts and stops the public listener
pub struct ListenerManager {
    /// Address as configured, possibly with an ephemeral port
    requested: String,

    /// Concrete address from the first successful bind
    bound: Mutex<Option<SocketAddr>>,

    /// Live accept loop, if any
    handle: tokio::sync::Mutex<Option<ListenerHandle>>,

    gate: Arc<Gate>,
    name: &'static str,
}

impl ListenerManager {
    pub fn new(requested: impl Into<String>, gate: Arc<Gate>, name: &'static str) -> Self {
        Self {
            requested: requested.into(),
            bound: Mutex::new(None),
            handle: tokio::sync::Mutex::new(None),
            gate,
            name,
        }
    }

    /// Address clients should use; `None` until the first successful bind
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Bind and spawn the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AlreadyStarted`] if a listener is live, or a
    /// bind error.
    pub async fn start(&self, on_accept: AcceptFn) -> ProxyResult<SocketAddr> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Err(ProxyError::AlreadyStarted);
        }

        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let gate = self.gate.clone();
        let name = self.name;
        let task = tokio::spawn(async move {
            accept_loop(listener, shutdown_rx, gate, on_accept, name).await;
            debug!("{} accept loop ended", name);
        });

        info!("{} is listening on {}", self.name, addr);
        *handle = Some(ListenerHandle {
            addr,
            shutdown_tx,
            task,
        });
        Ok(addr)
    }

    /// Close the listener and wait for the accept loop to exit.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AlreadyStopped`] if nothing is listening.
    pub async fn stop(&self) -> ProxyResult<()> {
        let handle = self.handle.lock().await.take();
        let Some(handle) = handle else {
            return Err(ProxyError::AlreadyStopped);
        };

        // The loop may already have exited; a dropped receiver is fine.
        let _ = handle.shutdown_tx.send(());
        if let Err(e) = handle.task.await {
            if e.is_panic() {
                error!("{} accept loop panicked: {}", self.name, e);
            }
        }
        info!("{} stopped listening on {}", self.name, handle.addr);
        Ok(())
    }

    async fn bind(&self) -> ProxyResult<TcpListener> {
        let target = match self.local_addr() {
            Some(addr) => addr.to_string(),
            None => normalize_listen_addr(&self.requested),
        };

        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| ProxyError::bind(&target, e))?
            .next()
            .ok_or_else(|| {
                ProxyError::bind(
                    &target,
                    std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address resolved"),
                )
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| ProxyError::bind(addr, e))?;

        // Rebinding the remembered address right after a stop must not trip
        // over connections lingering in TIME_WAIT.
        socket
            .set_reuseaddr(true)
            .map_err(|e| ProxyError::bind(addr, e))?;
        socket.bind(addr).map_err(|e| ProxyError::bind(addr, e))?;
        socket.listen(1024).map_err(|e| ProxyError::bind(addr, e))
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown_rx: oneshot::Receiver<()>,
    gate: Arc<Gate>,
    on_accept: AcceptFn,
    name: &'static str,
) {
    loop {
        // Frozen: stop taking new connections off the backlog.
        tokio::select! {
            _ = &mut shutdown_rx => return,
            _ = gate.await_thaw() => {}
        }

        trace!("{} accepting", name);
        tokio::select! {
            _ = &mut shutdown_rx => return,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    trace!("{} accepted {}", name, peer);
                    on_accept(stream, peer);
                }
                Err(e) if is_closed_io(&e) => {
                    debug!("{} accept interrupted: {}", name, e);
                }
                Err(e) => {
                    error!("{} accept failed: {}", name, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (AcceptFn, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let f: AcceptFn = Arc::new(move |_stream, _peer| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (f, count)
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let manager = ListenerManager::new("127.0.0.1:", Arc::new(Gate::new()), "test");
        let (on_accept, _) = counting();

        assert!(manager.local_addr().is_none());
        let addr = manager.start(on_accept.clone()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(manager.is_running().await);

        assert!(matches!(
            manager.start(on_accept).await,
            Err(ProxyError::AlreadyStarted)
        ));

        manager.stop().await.unwrap();
        assert!(!manager.is_running().await);
        assert!(matches!(manager.stop().await, Err(ProxyError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn test_restart_keeps_address() {
        let manager = ListenerManager::new("127.0.0.1:0", Arc::new(Gate::new()), "test");
        let (on_accept, count) = counting();

        let first = manager.start(on_accept.clone()).await.unwrap();
        manager.stop().await.unwrap();
        assert!(TcpStream::connect(first).await.is_err());

        let second = manager.start(on_accept).await.unwrap();
        assert_eq!(first, second);

        TcpStream::connect(second).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_frozen() {
        let gate = Arc::new(Gate::new());
        gate.set_frozen(true);
        let manager = ListenerManager::new("127.0.0.1:0", gate, "test");
        let (on_accept, count) = counting();

        let addr = manager.start(on_accept).await.unwrap();
        // Lands in the backlog; the frozen loop never accepts it.
        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::timeout(Duration::from_secs(1), manager.stop())
            .await
            .expect("stop must not wait for a thaw")
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_error() {
        let manager = ListenerManager::new("256.0.0.1:1", Arc::new(Gate::new()), "test");
        let (on_accept, _) = counting();
        assert!(matches!(
            manager.start(on_accept).await,
            Err(ProxyError::Bind { .. })
        ));
        assert!(!manager.is_running().await);
    }
}
