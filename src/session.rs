// Session Manager (byte-proxy mode)
//
// Pairs every accepted connection with a freshly dialed backend connection
// and copies bytes in both directions. Sessions are tracked in a table keyed
// by a monotonically increasing id so that kill-all can sever all of them.
//
// Key invariants:
// - a session enters the table only after the backend dial succeeded
// - a table entry always refers to a live pair of sockets; teardown removes it
// - closing is idempotent; the first close wins, later closes are no-ops
// - kill_all returns only after every killed session's copy tasks exited,
//   which means every one of their sockets has been dropped
// - a session accepted before a kill_all but still dialing when it ran is
//   refused at registration, so the table stays empty after the kill

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

use crate::error::{badge, is_closed_io};
use crate::gate::Gate;
use crate::metrics::ProxyMetrics;

/// One inbound connection paired with its outbound connection
#[derive(Debug)]
pub struct Session {
    id: u64,
    badge: String,
    /// Flipped once to ask both copy tasks to drop their sockets
    closed: watch::Sender<bool>,
    /// Flipped once both copy tasks have exited
    finished: watch::Sender<bool>,
}

impl Session {
    fn new(id: u64, badge: String) -> Self {
        Self {
            id,
            badge,
            closed: watch::Sender::new(false),
            finished: watch::Sender::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the session to close. Returns `true` for the first call only.
    pub fn close(&self) -> bool {
        let mut first = false;
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                first = true;
                true
            }
        });
        if first {
            trace!("closing connection [{}]", self.badge);
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until both copy tasks have exited
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|finished| *finished).await;
    }
}

/// Tracks sessions and runs their copy loops
pub struct SessionManager {
    dial: String,
    dial_timeout: Duration,
    buffer_size: usize,
    gate: Arc<Gate>,
    metrics: ProxyMetrics,
    last_id: AtomicU64,
    /// Highest id handed out when the last kill_all swapped the table.
    /// Read and written under the table lock.
    killed_through: AtomicU64,
    table: Mutex<HashMap<u64, Arc<Session>>>,
    /// Notified whenever the table becomes empty
    emptied: Notify,
}

impl SessionManager {
    pub fn new(
        dial: impl Into<String>,
        dial_timeout: Duration,
        buffer_size: usize,
        gate: Arc<Gate>,
        metrics: ProxyMetrics,
    ) -> Self {
        Self {
            dial: dial.into(),
            dial_timeout,
            buffer_size,
            gate,
            metrics,
            last_id: AtomicU64::new(0),
            killed_through: AtomicU64::new(0),
            table: Mutex::new(HashMap::new()),
            emptied: Notify::new(),
        }
    }

    /// Number of sessions in the table
    pub fn active(&self) -> usize {
        self.lock().len()
    }

    /// Serve one accepted connection until either side closes or the
    /// session is killed.
    pub async fn handle(self: Arc<Self>, inbound: TcpStream, peer: SocketAddr) {
        let id = self.next_id();
        let local = inbound.local_addr().unwrap_or(peer);
        let mut badge = badge(id, peer, local);

        if self.gate.check_rejecting().is_err() {
            self.metrics.rejected.inc();
            debug!("rejecting connection [{}]", badge);
            return;
        }

        trace!("dialing {} [{}]", self.dial, badge);
        let outbound = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.dial)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.metrics.dial_failures.inc();
                error!("failed to dial {:?}: {} [{}]", self.dial, e, badge);
                return;
            }
            Err(_) => {
                self.metrics.dial_failures.inc();
                error!("timed out dialing {:?} [{}]", self.dial, badge);
                return;
            }
        };

        if let (Ok(out_local), Ok(out_remote)) = (outbound.local_addr(), outbound.peer_addr()) {
            badge = format!("{}; {}->{}", badge, out_local, out_remote);
        }
        let _ = inbound.set_nodelay(true);
        let _ = outbound.set_nodelay(true);
        trace!("dial complete [{}]", badge);

        let session = Arc::new(Session::new(id, badge.clone()));
        if !self.register(session.clone()) {
            self.metrics.sessions_killed.inc();
            debug!("connection killed while dialing [{}]", badge);
            return;
        }

        let (in_read, in_write) = inbound.into_split();
        let (out_read, out_write) = outbound.into_split();

        let mut tasks = JoinSet::new();
        tasks.spawn(copy_loop(
            self.gate.clone(),
            session.closed.subscribe(),
            in_read,
            out_write,
            self.buffer_size,
            format!("{}; client->server", badge),
        ));
        tasks.spawn(copy_loop(
            self.gate.clone(),
            session.closed.subscribe(),
            out_read,
            in_write,
            self.buffer_size,
            format!("{}; server->client", badge),
        ));

        // Either direction ending tears the whole session down.
        tasks.join_next().await;
        session.close();
        while tasks.join_next().await.is_some() {}

        self.unregister(id);
        session.finished.send_replace(true);
        trace!("connection closed [{}]", badge);
    }

    /// Close every tracked session and wait until all of them are gone.
    ///
    /// Returns the number of sessions killed.
    pub async fn kill_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let mut table = self.lock();
            self.killed_through
                .store(self.last_id.load(Ordering::SeqCst), Ordering::SeqCst);
            std::mem::take(&mut *table).into_values().collect()
        };
        self.metrics.sessions_active.set(0);
        self.emptied.notify_waiters();

        for session in &sessions {
            if session.close() {
                self.metrics.sessions_killed.inc();
            }
        }
        for session in &sessions {
            session.wait_finished().await;
        }

        if !sessions.is_empty() {
            debug!("killed {} sessions", sessions.len());
        }
        sessions.len()
    }

    /// Wait until the table is empty (graceful drain)
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = self.lock().is_empty();
            if idle {
                return;
            }
            notified.await;
        }
    }

    fn next_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Add a session to the table. Returns `false`, with the session closed,
    /// when a kill_all has already swept past its id.
    fn register(&self, session: Arc<Session>) -> bool {
        let mut table = self.lock();
        if session.id <= self.killed_through.load(Ordering::SeqCst) {
            session.close();
            return false;
        }
        table.insert(session.id, session);
        self.metrics.sessions_accepted.inc();
        self.metrics.sessions_active.set(table.len() as i64);
        true
    }

    fn unregister(&self, id: u64) {
        let now_empty = {
            let mut table = self.lock();
            if table.remove(&id).is_none() {
                return;
            }
            self.metrics.sessions_active.set(table.len() as i64);
            table.is_empty()
        };
        if now_empty {
            self.emptied.notify_waiters();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<Session>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Copy one direction until EOF, an error, or a close request.
///
/// The gate is consulted before every read and before every write, so a
/// freeze can stall a transfer that is already under way.
async fn copy_loop(
    gate: Arc<Gate>,
    mut closed: watch::Receiver<bool>,
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    buffer_size: usize,
    badge: String,
) {
    let copy = async {
        let mut buffer = vec![0u8; buffer_size];
        loop {
            gate.await_thaw().await;

            let n = match src.read(&mut buffer).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) if is_closed_io(&e) => return,
                Err(e) => {
                    error!("read I/O error: {} [{}]", e, badge);
                    return;
                }
            };

            gate.await_thaw().await;

            match dst.write_all(&buffer[..n]).await {
                Ok(()) => {}
                Err(e) if is_closed_io(&e) => return,
                Err(e) => {
                    error!("write I/O error: {} [{}]", e, badge);
                    return;
                }
            }
        }
    };

    tokio::select! {
        _ = closed.wait_for(|closed| *closed) => {}
        _ = copy => {}
    }

    // Half-close towards the destination; errors here only mean it is gone.
    if let Err(e) = dst.shutdown().await {
        if !is_closed_io(&e) {
            warn!("error while closing connection: {} [{}]", e, badge);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    /// Accepts one proxied connection and hands it to the manager
    async fn proxied_pair(manager: Arc<SessionManager>) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (inbound, peer) = listener.accept().await.unwrap();
        tokio::spawn(manager.handle(inbound, peer));
        client
    }

    fn manager(dial: SocketAddr, gate: Arc<Gate>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            dial.to_string(),
            Duration::from_secs(1),
            4096,
            gate,
            ProxyMetrics::new().unwrap(),
        ))
    }

    async fn wait_for_sessions(manager: &SessionManager, n: usize) {
        timeout(Duration::from_secs(2), async {
            while manager.active() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session count never reached");
    }

    #[test]
    fn test_session_close_is_idempotent() {
        let session = Session::new(1, "#1".to_string());
        assert!(!session.is_closed());
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_echo_through_session() {
        let backend = echo_backend().await;
        let manager = manager(backend, Arc::new(Gate::new()));
        let mut client = proxied_pair(manager.clone()).await;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(1), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(manager.active(), 1);
    }

    #[tokio::test]
    async fn test_client_close_unregisters_session() {
        let backend = echo_backend().await;
        let manager = manager(backend, Arc::new(Gate::new()));
        let client = proxied_pair(manager.clone()).await;
        wait_for_sessions(&manager, 1).await;

        drop(client);
        wait_for_sessions(&manager, 0).await;
        timeout(Duration::from_secs(1), manager.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_closes_inbound() {
        // Grab a free port, then release it so nothing is listening.
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let manager = manager(dead, Arc::new(Gate::new()));
        let mut client = proxied_pair(manager.clone()).await;

        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(manager.active(), 0);
        assert_eq!(manager.metrics.dial_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_rejecting_gate_closes_without_dialing() {
        let backend = echo_backend().await;
        let gate = Arc::new(Gate::new());
        gate.set_rejecting(true);
        let manager = manager(backend, gate);
        let mut client = proxied_pair(manager.clone()).await;

        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_millis(500), client.read(&mut buf))
            .await
            .expect("rejected connection must close promptly");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(manager.metrics.rejected.get(), 1);
        assert_eq!(manager.metrics.sessions_accepted.get(), 0);
    }

    #[tokio::test]
    async fn test_kill_all_is_synchronous() {
        let backend = echo_backend().await;
        let manager = manager(backend, Arc::new(Gate::new()));
        let mut a = proxied_pair(manager.clone()).await;
        let mut b = proxied_pair(manager.clone()).await;
        wait_for_sessions(&manager, 2).await;

        assert_eq!(manager.kill_all().await, 2);
        assert_eq!(manager.active(), 0);
        assert_eq!(manager.metrics.sessions_killed.get(), 2);

        for client in [&mut a, &mut b] {
            let mut buf = [0u8; 1];
            let read = timeout(Duration::from_millis(500), client.read(&mut buf))
                .await
                .expect("killed session must be closed");
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        // Nothing left to kill.
        assert_eq!(manager.kill_all().await, 0);
    }

    #[tokio::test]
    async fn test_kill_all_while_frozen() {
        let backend = echo_backend().await;
        let gate = Arc::new(Gate::new());
        let manager = manager(backend, gate.clone());
        let mut client = proxied_pair(manager.clone()).await;
        wait_for_sessions(&manager, 1).await;

        gate.set_frozen(true);
        client.write_all(b"stuck").await.unwrap();

        timeout(Duration::from_secs(1), manager.kill_all())
            .await
            .expect("kill-all must not wait for a thaw");
        assert_eq!(manager.active(), 0);
    }

    #[tokio::test]
    async fn test_session_dialing_during_kill_all_is_refused() {
        let backend = echo_backend().await;
        let manager = manager(backend, Arc::new(Gate::new()));

        // Accepted before the kill, registered after it.
        let dialing = manager.next_id();
        manager.kill_all().await;
        let late = Arc::new(Session::new(dialing, "#late".to_string()));
        assert!(!manager.register(late.clone()));
        assert!(late.is_closed());
        assert_eq!(manager.active(), 0);

        // Connections accepted after the kill are served as usual.
        let fresh = Arc::new(Session::new(manager.next_id(), "#fresh".to_string()));
        assert!(manager.register(fresh));
        assert_eq!(manager.active(), 1);
    }

    #[tokio::test]
    async fn test_kill_all_then_new_connection_round_trips() {
        let backend = echo_backend().await;
        let manager = manager(backend, Arc::new(Gate::new()));
        manager.kill_all().await;

        let mut client = proxied_pair(manager.clone()).await;
        client.write_all(b"after").await.unwrap();
        let mut buf = [0u8; 5];
        timeout(Duration::from_secs(1), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"after");
    }
}
