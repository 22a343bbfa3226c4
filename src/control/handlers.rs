// Control-plane HTTP handlers
//
// POST /<action> runs a control action: 204 on success, 500 with the error
// text on failure, 400 for a malformed query, 405 for any other method.
// GET|HEAD / serves the help text. GET /status and GET /metrics report state.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::{ALLOW, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::controller::{Action, Controller};

pub const HELP_TEXT: &str = "The test proxy exposes the following control endpoints:

- POST /start
  Start listening for connections; fails if the proxy is already running.

- POST /stop
  Stop listening for connections; live sessions are left alone.

- POST /kill-all
  Close every live session and wait until all of them are gone.

- POST /quit
  Shut down the proxy and exit.

- POST /restart
  Gracefully shut down the proxy, then start it again on the same address.

  - Query param: sleep=<duration>
    Forces the restart to block for the given duration; default: 0s.

  - Query param: forceful=<bool>
    If true, forces a non-graceful shutdown; default: false.

- POST /reject
  Immediately reject incoming connections or calls (UNAVAILABLE).

- POST /accept
  Accept incoming connections or calls; this is the default.

- POST /freeze
  Block on incoming accepted connections or calls.

- POST /thaw
  Process incoming accepted connections or calls immediately; this is the default.

- GET /status
  Report the proxy state as JSON.

- GET /metrics
  Report proxy metrics in Prometheus text format.
";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/", any(help))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/{action}", any(action))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    let mut body = body.into();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    (status, [(CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

fn method_not_allowed(allowed: &'static str) -> Response {
    let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    if let Ok(value) = allowed.parse() {
        response.headers_mut().insert(ALLOW, value);
    }
    response
}

async fn not_found() -> Response {
    text(StatusCode::NOT_FOUND, "404 page not found")
}

async fn help(method: Method) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return method_not_allowed("GET, HEAD");
    }
    let body = HELP_TEXT.replace('\n', "\r\n");
    (StatusCode::OK, [(CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

async fn action(
    State(controller): State<Arc<Controller>>,
    method: Method,
    Path(name): Path<String>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> Response {
    let Some(action) = Action::from_name(&name) else {
        return not_found().await;
    };
    if method != Method::POST {
        return method_not_allowed("POST");
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return text(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match controller.run(action, &query).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("{} failed: {}", action, e);
            text(e.status_code(), e.to_string())
        }
    }
}

async fn status(State(controller): State<Arc<Controller>>) -> Response {
    Json(controller.status().await).into_response()
}

async fn metrics(State(controller): State<Arc<Controller>>) -> Response {
    match controller.metrics().gather() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}
