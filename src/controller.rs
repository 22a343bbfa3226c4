// Controller: control actions and the shutdown/restart orchestration
//
// Lifecycle actions (start, stop, restart) are serialised by one lock. Gate
// actions and kill-all never take it, so a thaw or a kill-all can still get
// through while a graceful restart is waiting on sessions to drain.
//
// Control requests run lifecycle actions on their own task: a client that
// hangs up mid-restart must not leave the proxy stopped.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::config::ProxyMode;
use crate::error::{ProxyError, ProxyResult};
use crate::frontend::{Frontend, ShutdownMode};
use crate::gate::Gate;
use crate::metrics::ProxyMetrics;

/// Control-plane actions, one per POST endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    KillAll,
    Reject,
    Accept,
    Freeze,
    Thaw,
    Restart,
    Quit,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Start,
        Action::Stop,
        Action::KillAll,
        Action::Reject,
        Action::Accept,
        Action::Freeze,
        Action::Thaw,
        Action::Restart,
        Action::Quit,
    ];

    /// Endpoint name, without the leading slash
    pub fn name(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::KillAll => "kill-all",
            Action::Reject => "reject",
            Action::Accept => "accept",
            Action::Freeze => "freeze",
            Action::Thaw => "thaw",
            Action::Restart => "restart",
            Action::Quit => "quit",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.name() == name)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.name())
    }
}

/// Why the process should exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `/quit` (or a signal) asked for an orderly exit
    Quit,

    /// A restart could not bring the proxy back
    RestartFailed,
}

/// Parse a boolean the way Go's `strconv.ParseBool` does
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Parse a duration such as `500ms`, `2s` or `1m30s`. Negative durations
/// are accepted and clamp to zero.
pub fn parse_sleep(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (negative, magnitude) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };

    let parsed = if magnitude == "0" {
        Duration::ZERO
    } else {
        humantime::parse_duration(magnitude).ok()?
    };
    Some(if negative { Duration::ZERO } else { parsed })
}

/// Query parameters of `/restart`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartOptions {
    pub sleep: Duration,
    pub forceful: bool,
}

impl RestartOptions {
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidQuery`] for an unparsable `sleep` or
    /// `forceful`.
    pub fn from_query(query: &HashMap<String, String>) -> ProxyResult<Self> {
        let mut options = RestartOptions::default();
        if let Some(sleep) = query.get("sleep") {
            options.sleep = parse_sleep(sleep)
                .ok_or_else(|| ProxyError::InvalidQuery(format!("sleep={:?}", sleep)))?;
        }
        if let Some(forceful) = query.get("forceful") {
            options.forceful = parse_bool(forceful)
                .ok_or_else(|| ProxyError::InvalidQuery(format!("forceful={:?}", forceful)))?;
        }
        Ok(options)
    }
}

/// Snapshot served at `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyStatus {
    pub mode: ProxyMode,
    pub running: bool,
    pub rejecting: bool,
    pub frozen: bool,
    pub proxy_address: Option<String>,
    pub active_sessions: usize,
}

pub struct Controller {
    frontend: Arc<dyn Frontend>,
    gate: Arc<Gate>,
    metrics: ProxyMetrics,
    lifecycle: Mutex<()>,
    exit: watch::Sender<Option<ExitReason>>,
}

impl Controller {
    pub fn new(frontend: Arc<dyn Frontend>, gate: Arc<Gate>, metrics: ProxyMetrics) -> Self {
        Self {
            frontend,
            gate,
            metrics,
            lifecycle: Mutex::new(()),
            exit: watch::Sender::new(None),
        }
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    pub fn frontend(&self) -> &Arc<dyn Frontend> {
        &self.frontend
    }

    /// Run one control action with its query parameters
    pub async fn run(self: &Arc<Self>, action: Action, query: &HashMap<String, String>) -> ProxyResult<()> {
        match action {
            Action::Start => self.detach(|c| async move { c.start().await.map(|_| ()) }).await,
            Action::Stop => self.detach(|c| async move { c.stop().await }).await,
            Action::KillAll => self.detach(|c| async move { c.kill_all().await.map(|_| ()) }).await,
            Action::Reject => {
                self.reject();
                Ok(())
            }
            Action::Accept => {
                self.accept();
                Ok(())
            }
            Action::Freeze => {
                self.freeze();
                Ok(())
            }
            Action::Thaw => {
                self.thaw();
                Ok(())
            }
            Action::Restart => {
                let options = RestartOptions::from_query(query)?;
                self.detach(move |c| async move { c.restart(options).await }).await
            }
            Action::Quit => {
                self.quit();
                Ok(())
            }
        }
    }

    /// Spawn a lifecycle action and wait for it. Dropping the returned future
    /// does not cancel the action.
    async fn detach<F, Fut>(self: &Arc<Self>, action: F) -> ProxyResult<()>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = ProxyResult<()>> + Send + 'static,
    {
        tokio::spawn(action(self.clone()))
            .await
            .map_err(|e| ProxyError::Aborted(e.to_string()))?
    }

    pub async fn start(&self) -> ProxyResult<std::net::SocketAddr> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.frontend.is_running().await {
            return Err(ProxyError::AlreadyStarted);
        }
        let addr = self.frontend.start().await?;
        info!("/start: proxy is listening on {}", addr);
        Ok(addr)
    }

    pub async fn stop(&self) -> ProxyResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.frontend.stop_listening().await?;
        info!("/stop: proxy is no longer listening");
        Ok(())
    }

    /// Sever every live session. The session table has its own lock, so this
    /// does not wait behind a restart that is draining.
    pub async fn kill_all(&self) -> ProxyResult<usize> {
        let killed = self.frontend.kill_all().await?;
        info!("/kill-all: killed {} sessions", killed);
        Ok(killed)
    }

    pub fn reject(&self) {
        if self.gate.set_rejecting(true) {
            info!("/reject: proxy is rejecting requests");
        }
    }

    pub fn accept(&self) {
        if self.gate.set_rejecting(false) {
            info!("/accept: proxy is NOT rejecting requests");
        }
    }

    pub fn freeze(&self) {
        if self.gate.set_frozen(true) {
            info!("/freeze: proxy is stalling requests");
        }
    }

    pub fn thaw(&self) {
        if self.gate.set_frozen(false) {
            info!("/thaw: proxy is NOT stalling requests");
        }
    }

    /// Tear the frontend down, optionally sleep, then start it again.
    ///
    /// # Errors
    ///
    /// If the frontend cannot be started again the process is asked to exit
    /// with [`ExitReason::RestartFailed`] and [`ProxyError::RestartFailed`]
    /// is returned.
    pub async fn restart(&self, options: RestartOptions) -> ProxyResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let mode = ShutdownMode::from_forceful(options.forceful);
        info!("/restart: restarting proxy (forceful: {})", options.forceful);

        if let Err(e) = self.frontend.shutdown(mode).await {
            if !e.is_closed() {
                warn!("failed to shut down proxy {:?}: {}", mode, e);
            }
        }

        if !options.sleep.is_zero() {
            info!("/restart: sleeping for {:?}", options.sleep);
            tokio::time::sleep(options.sleep).await;
        }

        match self.frontend.start().await {
            Ok(addr) => {
                self.metrics.restarts.inc();
                info!("/restart: proxy has been restarted on {}", addr);
                Ok(())
            }
            Err(e) => {
                self.signal_exit(ExitReason::RestartFailed);
                Err(ProxyError::RestartFailed(Box::new(e)))
            }
        }
    }

    pub fn quit(&self) {
        info!("/quit: proxy is shutting down");
        self.signal_exit(ExitReason::Quit);
    }

    /// Shut the frontend down outside of a control request
    pub async fn shutdown(&self, mode: ShutdownMode) -> ProxyResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.frontend.shutdown(mode).await
    }

    /// Force the frontend down without waiting for a running lifecycle
    /// action, which may be stuck draining.
    pub async fn force_close(&self) {
        if let Err(e) = self.frontend.shutdown(ShutdownMode::Forceful).await {
            warn!("failed to close proxy: {}", e);
        }
    }

    /// First exit reason wins
    pub fn signal_exit(&self, reason: ExitReason) {
        self.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self.exit.borrow()
    }

    /// Wait until an exit has been requested
    pub async fn wait_exit(&self) -> ExitReason {
        let mut rx = self.exit.subscribe();
        // Bound to a local so the borrow of `rx` ends before `rx` is dropped.
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ExitReason::Quit),
            // The sender lives in self, so it cannot be gone.
            Err(_) => ExitReason::Quit,
        };
        reason
    }

    pub async fn status(&self) -> ProxyStatus {
        let gate = self.gate.state();
        ProxyStatus {
            mode: self.frontend.mode(),
            running: self.frontend.is_running().await,
            rejecting: gate.rejecting,
            frozen: gate.frozen,
            proxy_address: self.frontend.local_addr().map(|a| a.to_string()),
            active_sessions: self.frontend.active_sessions(),
        }
    }
}
