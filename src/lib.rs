//! Fault Proxy Library
//!
//! A controllable fault-injection proxy. It sits between a client under test
//! and a real backend and lets a test driver, over a separate HTTP control
//! plane, reject or freeze traffic, sever live sessions, and restart the
//! listening endpoint in place.
//!
//! Two modes share one control plane:
//! - byte mode copies raw TCP bytes and applies faults per connection and
//!   per read/write
//! - call-aware mode terminates HTTP/2 (gRPC over h2c) and applies faults
//!   per call

pub mod byte_proxy;
pub mod call;
pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod frontend;
pub mod gate;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod session;
pub mod tls;

pub use config::{ProxyConfig, ProxyMode};
pub use control::client::ControlClient;
pub use controller::{Action, ExitReason, RestartOptions};
pub use error::{ProxyError, ProxyResult};
pub use frontend::{Frontend, ShutdownMode};
pub use gate::{Gate, GateState};
pub use proxy::FaultProxy;
