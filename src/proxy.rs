// Fault proxy runner
//
// Wires the gate, the frontend for the configured mode, the controller and
// the control server together. Used both by the standalone binary and
// in-process by tests that embed the proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::byte_proxy::ByteProxy;
use crate::call::CallProxy;
use crate::config::{ProxyConfig, ProxyMode};
use crate::control::client::ControlClient;
use crate::control::ControlServer;
use crate::controller::{Controller, ExitReason};
use crate::error::{ProxyError, ProxyResult};
use crate::frontend::{Frontend, ShutdownMode};
use crate::gate::Gate;
use crate::metrics::ProxyMetrics;

/// A running proxy together with its control server
pub struct FaultProxy {
    controller: Arc<Controller>,
    control: ControlServer,
    proxy_addr: SocketAddr,
    control_addr: SocketAddr,
}

impl FaultProxy {
    /// Start the proxy frontend, then the control server.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] for an invalid configuration, or the
    /// bind/dial error that kept either server from starting. Nothing is
    /// left running on error.
    pub async fn start(config: ProxyConfig) -> ProxyResult<Self> {
        config
            .validate()
            .map_err(|e| ProxyError::Config(e.to_string()))?;

        let gate = Arc::new(Gate::new());
        let metrics = ProxyMetrics::new()
            .map_err(|e| ProxyError::Config(format!("failed to register metrics: {}", e)))?;

        let frontend: Arc<dyn Frontend> = match config.proxy.mode {
            ProxyMode::Byte => Arc::new(ByteProxy::new(&config, gate.clone(), metrics.clone())),
            ProxyMode::Call => Arc::new(CallProxy::new(&config, gate.clone(), metrics.clone())?),
        };
        let controller = Arc::new(Controller::new(frontend, gate, metrics));

        let proxy_addr = controller.start().await?;

        let control = ControlServer::new(config.control.listen.clone(), controller.clone());
        let control_addr = match control.start().await {
            Ok(addr) => addr,
            Err(e) => {
                controller.force_close().await;
                return Err(e);
            }
        };

        info!(
            "{} proxy on {} forwarding to {}; control on {}",
            config.proxy.mode, proxy_addr, config.proxy.dial, control_addr
        );

        Ok(Self {
            controller,
            control,
            proxy_addr,
            control_addr,
        })
    }

    /// Address clients under test connect to; stable across restarts
    pub fn proxy_address(&self) -> SocketAddr {
        self.proxy_addr
    }

    pub fn control_address(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn gate(&self) -> &Arc<Gate> {
        self.controller.gate()
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        self.controller.metrics()
    }

    /// Client bound to this proxy's control server
    pub fn client(&self) -> ControlClient {
        ControlClient::new(self.control_addr)
    }

    /// Wait until `/quit` or a failed restart asks the process to exit
    pub async fn wait_exit(&self) -> ExitReason {
        self.controller.wait_exit().await
    }

    /// Shut down the control server, then the proxy, each drained
    /// gracefully for at most `grace` before being closed.
    pub async fn shutdown(&self, grace: Duration) {
        match tokio::time::timeout(grace, self.control.shutdown()).await {
            Ok(Ok(())) | Ok(Err(ProxyError::AlreadyStopped)) => {}
            Ok(Err(e)) => warn!("failed to shut down control server: {}", e),
            Err(_) => {
                warn!("control server did not drain within {:?}, closing", grace);
                let _ = self.control.close().await;
            }
        }

        match tokio::time::timeout(grace, self.controller.shutdown(ShutdownMode::Graceful)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to shut down proxy: {}", e),
            Err(_) => {
                warn!("proxy did not drain within {:?}, closing", grace);
                self.controller.force_close().await;
            }
        }
    }

    /// Close the control server, then the proxy, without draining
    pub async fn close(&self) {
        match self.control.close().await {
            Ok(()) | Err(ProxyError::AlreadyStopped) => {}
            Err(e) => warn!("failed to close control server: {}", e),
        }
        self.controller.force_close().await;
    }
}
