// Passthrough handler
//
// Re-issues each inbound call verbatim on the backend connection: method,
// path, headers, streaming request body and trailers go out unchanged, and
// the backend's response is streamed back the same way.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::http::uri::{PathAndQuery, Uri};
use hyper::{Request, Response};
use tower::Service;
use tracing::{debug, warn};

use crate::call::backend::BackendHandle;
use crate::call::grpc::{self, code, ProxyBody};
use crate::metrics::ProxyMetrics;

#[derive(Clone)]
pub struct Passthrough {
    backend: Arc<BackendHandle>,
    metrics: ProxyMetrics,
}

impl Passthrough {
    pub fn new(backend: Arc<BackendHandle>, metrics: ProxyMetrics) -> Self {
        Self { backend, metrics }
    }
}

/// Point a request at the backend, keeping its path and query
fn backend_uri(scheme: &str, authority: &str, uri: &Uri) -> Result<Uri, hyper::http::Error> {
    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()
}

impl Service<Request<Incoming>> for Passthrough {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Incoming>) -> Self::Future {
        let backend = self.backend.clone();
        let metrics = self.metrics.clone();

        Box::pin(async move {
            let method = req.uri().path().to_string();
            match backend_uri(backend.scheme(), backend.dial_addr(), req.uri()) {
                Ok(uri) => *req.uri_mut() = uri,
                Err(e) => {
                    warn!("cannot forward {}: {}", method, e);
                    return Ok(grpc::trailers_only(code::UNAVAILABLE, "invalid backend address"));
                }
            }

            debug!("forwarding call {}", method);
            match backend.send(req).await {
                Ok(response) => {
                    metrics.calls_forwarded.inc();
                    Ok(response.map(|body| body.boxed_unsync()))
                }
                Err(e) => {
                    warn!("call {} failed at the backend: {}", method, e);
                    Ok(grpc::trailers_only(code::UNAVAILABLE, "backend unavailable"))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_uri_keeps_path() {
        let uri: Uri = "/pkg.Service/Method".parse().unwrap();
        let rewritten = backend_uri("http", "127.0.0.1:7233", &uri).unwrap();
        assert_eq!(rewritten.to_string(), "http://127.0.0.1:7233/pkg.Service/Method");
    }

    #[test]
    fn test_backend_uri_replaces_authority() {
        let uri: Uri = "http://proxy:1/a?b=c".parse().unwrap();
        let rewritten = backend_uri("https", "backend:443", &uri).unwrap();
        assert_eq!(rewritten.to_string(), "https://backend:443/a?b=c");
    }
}
