//! Public HTTP adapter.
//!
//! Turns one inbound public request into a tunneled request/response pair:
//! route by the Host label, queue an `http_request` frame, wait on a
//! single-slot sink for the matching `http_response`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use porthole_shared::ident;
use porthole_shared::protocol::{Frame, MAX_BODY_BYTES, RESPONSE_TIMEOUT};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::pending::{PendingGuard, PendingRequests};
use crate::AppState;

pub async fn handle(State(state): State<AppState>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let Some(label) = host_label(host) else {
        return (StatusCode::BAD_REQUEST, "Invalid subdomain").into_response();
    };
    let label = label.to_string();

    let Some(session) = state.registry.lookup(&label).await else {
        debug!("No tunnel for {label}");
        return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
    };

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = flatten_headers(req.headers());

    let body = match to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!("Failed to read request body for {label}: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read request body")
                .into_response();
        }
    };

    let (id, sink_rx) = allocate_sink(&state.pending);
    let _entry = PendingGuard::new(state.pending.clone(), id.clone());

    let frame = Frame::HttpRequest {
        id: id.clone(),
        method,
        path,
        headers,
        body,
    };
    match session.try_enqueue(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            debug!("Tunnel {label} is saturated, refusing request {id}");
            return (StatusCode::SERVICE_UNAVAILABLE, "Tunnel is busy").into_response();
        }
        Err(TrySendError::Closed(_)) => {
            return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
        }
    }
    // Holding the session handle would keep its queue open past teardown;
    // from here correlation is by id alone.
    drop(session);

    // Besides delivery and timeout, the only way out of the wait is the
    // caller hanging up, which the server surfaces by dropping this future.
    // The guard books that exit as the 408 it can no longer transmit.
    let cancelled = CancelGuard::new(state.metrics.clone(), id.clone(), label.clone());

    let response = tokio::select! {
        delivered = sink_rx => match delivered {
            Ok(Frame::HttpResponse { status, headers, body, .. }) => {
                client_response(status, headers, body)
            }
            Ok(_) => (StatusCode::BAD_GATEWAY, "Unexpected frame").into_response(),
            Err(_) => (StatusCode::BAD_GATEWAY, "Tunnel closed").into_response(),
        },
        _ = tokio::time::sleep(RESPONSE_TIMEOUT) => {
            debug!("Request {id} for {label} timed out");
            (StatusCode::GATEWAY_TIMEOUT, "Client response timeout").into_response()
        }
    };

    cancelled.complete();
    state.metrics.record_request(response.status().as_u16());
    response
}

/// Books the caller-disconnect exit of the response wait. A drop before
/// `complete` means the adapter future was discarded because the public
/// caller went away: the pending entry is torn down by its own guard, the
/// 408 outcome is logged and counted here, and any late response finds no
/// sink. The status itself has no connection left to travel on.
struct CancelGuard {
    metrics: Metrics,
    id: String,
    label: String,
    completed: bool,
}

impl CancelGuard {
    fn new(metrics: Metrics, id: String, label: String) -> Self {
        Self {
            metrics,
            id,
            label,
            completed: false,
        }
    }

    /// The wait finished with a delivery or a timeout.
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.completed {
            debug!("Request {} for {} cancelled by caller", self.id, self.label);
            self.metrics
                .record_request(StatusCode::REQUEST_TIMEOUT.as_u16());
        }
    }
}

/// Reserve a fresh request id and its response sink, regenerating on the
/// (64-bit unlikely) collision.
fn allocate_sink(pending: &Arc<PendingRequests>) -> (String, oneshot::Receiver<Frame>) {
    loop {
        let id = ident::request_id();
        let (tx, rx) = oneshot::channel();
        if pending.insert(&id, tx).is_ok() {
            return (id, rx);
        }
    }
}

/// The bare label is everything before the first dot; a Host without a dot
/// cannot address a tunnel.
fn host_label(host: &str) -> Option<&str> {
    host.split_once('.').map(|(label, _)| label)
}

/// First value per header name; the wire protocol relays single-valued maps.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    out
}

/// Copy the client's response onto the public wire: status verbatim,
/// headers as sent, body bytes as-is.
fn client_response(status: u16, headers: HashMap<String, String>, body: String) -> Response {
    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
    if let Some(map) = builder.headers_mut() {
        for (name, value) in &headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.insert(name, value);
            }
        }
    }
    builder
        .body(Body::from(body.into_bytes()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_label() {
        assert_eq!(host_label("ab12cd34.example.com"), Some("ab12cd34"));
        assert_eq!(host_label("myapp.example.com:9090"), Some("myapp"));
        assert_eq!(host_label("localhost:9090"), None);
        assert_eq!(host_label(""), None);
    }

    #[test]
    fn test_flatten_headers_keeps_first_value() {
        let mut headers = HeaderMap::new();
        headers.append("x-test", "one".parse().unwrap());
        headers.append("x-test", "two".parse().unwrap());
        headers.insert("accept", "*/*".parse().unwrap());

        let flat = flatten_headers(&headers);
        assert_eq!(flat.get("x-test").unwrap(), "one");
        assert_eq!(flat.get("accept").unwrap(), "*/*");
    }

    #[tokio::test]
    async fn test_client_response_roundtrip() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());

        let response = client_response(201, headers, "hi".into());
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain"
        );
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"hi");
    }

    #[test]
    fn test_client_response_bad_status_falls_back() {
        let response = client_response(1000, HashMap::new(), String::new());
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_allocate_sink_retries_on_collision() {
        let pending = Arc::new(PendingRequests::new());
        let (id, _rx) = allocate_sink(&pending);
        assert_eq!(id.len(), 16);

        let (other, _rx) = allocate_sink(&pending);
        assert_ne!(id, other);
    }

    #[test]
    fn test_cancel_guard_counts_dropped_wait() {
        let metrics = Metrics::new();
        let guard = CancelGuard::new(metrics.clone(), "r1".into(), "myapp".into());
        drop(guard);

        let text = metrics.to_prometheus();
        assert!(text.contains("porthole_requests_total 1"));
        assert!(text.contains(r#"porthole_requests_by_status{status="4xx"} 1"#));
    }

    #[test]
    fn test_cancel_guard_complete_is_silent() {
        let metrics = Metrics::new();
        let guard = CancelGuard::new(metrics.clone(), "r1".into(), "myapp".into());
        guard.complete();

        assert!(metrics.to_prometheus().contains("porthole_requests_total 0"));
    }

    #[tokio::test]
    async fn test_caller_disconnect_tears_down_pending() {
        use crate::registry::Registry;
        use crate::tunnel::TunnelHandle;
        use tokio::sync::mpsc;

        let (tx, mut rx) = mpsc::channel(8);
        let state = AppState {
            registry: Arc::new(Registry::new()),
            pending: Arc::new(PendingRequests::new()),
            metrics: Metrics::new(),
            domain: "example.com".into(),
            token: "secret".into(),
        };
        state
            .registry
            .register("myapp", Arc::new(TunnelHandle::new(tx)))
            .await
            .unwrap();

        let req = axum::http::Request::builder()
            .uri("/")
            .header("host", "myapp.example.com")
            .body(Body::empty())
            .unwrap();

        let mut fut = Box::pin(handle(State(state.clone()), req));
        for _ in 0..8 {
            assert!(
                futures_util::future::poll_immediate(&mut fut).await.is_none(),
                "adapter completed without a client response"
            );
        }
        // The caller hangs up: the server drops the adapter future mid-wait.
        drop(fut);

        let Ok(Frame::HttpRequest { id, .. }) = rx.try_recv() else {
            panic!("request frame was not enqueued");
        };
        assert!(!state.pending.contains(&id));
        assert!(state
            .metrics
            .to_prometheus()
            .contains(r#"porthole_requests_by_status{status="4xx"} 1"#));

        // The late response finds no sink and is dropped.
        state.pending.deliver(
            &id,
            Frame::HttpResponse {
                id: id.clone(),
                status: 200,
                headers: Default::default(),
                body: "late".into(),
            },
        );
    }
}
