// gRPC response helpers
//
// Only what the proxy has to produce on its own: trailers-only error
// responses and the local health-check reply. Everything else is streamed
// through from the backend untouched.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Body type of every response the call-aware frontend returns
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub const CONTENT_TYPE_GRPC: &str = "application/grpc";

/// gRPC status codes used by the proxy
pub mod code {
    pub const OK: u32 = 0;
    pub const UNIMPLEMENTED: u32 = 12;
    pub const UNAVAILABLE: u32 = 14;
}

/// `grpc.health.v1.HealthCheckResponse { status: SERVING }`, length-prefixed
pub const HEALTH_SERVING_FRAME: [u8; 7] = [0, 0, 0, 0, 2, 0x08, 0x01];

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn status_headers(code: u32, message: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("grpc-status", HeaderValue::from(code));
    if !message.is_empty() {
        if let Ok(value) = HeaderValue::from_str(message) {
            headers.insert("grpc-message", value);
        }
    }
    headers
}

/// Trailers-only response: HTTP 200 with the status carried in the headers
pub fn trailers_only(code: u32, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_GRPC));
    headers.extend(status_headers(code, message));
    response
}

/// Unary response carrying one message followed by an OK status trailer
pub fn unary(message: &'static [u8]) -> Response<ProxyBody> {
    let frames: Vec<Result<Frame<Bytes>, hyper::Error>> = vec![
        Ok(Frame::data(Bytes::from_static(message))),
        Ok(Frame::trailers(status_headers(code::OK, ""))),
    ];
    let body = StreamBody::new(futures_util::stream::iter(frames)).boxed_unsync();

    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_GRPC));
    response
}

/// Read the `grpc-status` header of a response, if present
pub fn status_of(headers: &HeaderMap) -> Option<u32> {
    headers.get("grpc-status")?.to_str().ok()?.parse().ok()
}
