// Call interceptors
//
// Tower layers wrapped around the passthrough service. The health layer sits
// outermost so the local health check is never gated; the gate layer holds
// every other call at the gate before it is forwarded.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::body::Incoming;
use hyper::{Request, Response};
use tower::{Layer, Service};
use tracing::debug;

use crate::call::grpc::{self, code, ProxyBody, HEALTH_SERVING_FRAME};
use crate::gate::Gate;
use crate::metrics::ProxyMetrics;

pub const HEALTH_CHECK_PATH: &str = "/grpc.health.v1.Health/Check";
pub const HEALTH_WATCH_PATH: &str = "/grpc.health.v1.Health/Watch";

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Answers the standard gRPC health service locally
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthLayer;

impl<S> Layer<S> for HealthLayer {
    type Service = HealthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HealthService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct HealthService<S> {
    inner: S,
}

impl<S> Service<Request<Incoming>> for HealthService<S>
where
    S: Service<Request<Incoming>, Response = Response<ProxyBody>, Error = Infallible>,
    S::Future: Send + 'static,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = BoxFuture<Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let local = match req.uri().path() {
            HEALTH_CHECK_PATH => Some(true),
            HEALTH_WATCH_PATH => Some(false),
            _ => None,
        };

        match local {
            Some(true) => {
                debug!("answering health check locally");
                Box::pin(async { Ok(grpc::unary(&HEALTH_SERVING_FRAME)) })
            }
            Some(false) => Box::pin(async {
                Ok(grpc::trailers_only(
                    code::UNIMPLEMENTED,
                    "health watch is not supported by the proxy",
                ))
            }),
            None => Box::pin(self.inner.call(req)),
        }
    }
}

/// Holds each call at the gate
#[derive(Clone)]
pub struct GateLayer {
    gate: Arc<Gate>,
    metrics: ProxyMetrics,
}

impl GateLayer {
    pub fn new(gate: Arc<Gate>, metrics: ProxyMetrics) -> Self {
        Self { gate, metrics }
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GateService {
            inner,
            gate: self.gate.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GateService<S> {
    inner: S,
    gate: Arc<Gate>,
    metrics: ProxyMetrics,
}

impl<S> Service<Request<Incoming>> for GateService<S>
where
    S: Service<Request<Incoming>, Response = Response<ProxyBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = BoxFuture<Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        // Take the service that was driven to readiness, leave a fresh clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let gate = self.gate.clone();
        let metrics = self.metrics.clone();

        Box::pin(async move {
            if let Err(rejected) = gate.await_permitted().await {
                metrics.rejected.inc();
                debug!("rejecting call {}", req.uri().path());
                return Ok(grpc::trailers_only(code::UNAVAILABLE, &rejected.to_string()));
            }
            inner.call(req).await
        })
    }
}
