//! Tunnel sessions for the porthole relay.
//!
//! Each connected client gets one session: an authenticated websocket split
//! into a reader loop (dispatching inbound frames) and a writer loop (the
//! only task that touches the socket's send half). Every outbound frame,
//! including rename acknowledgements, rides the session's bounded queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use porthole_shared::protocol::Frame;
use porthole_shared::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::AppState;

/// Outbound frames queued per session before the adapter starts refusing
/// with 503.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// A live tunnel session as seen by the registry and the public adapter.
pub struct TunnelHandle {
    pub(crate) label: RwLock<String>,
    tx: mpsc::Sender<Frame>,
    created_at: Instant,
}

impl TunnelHandle {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self {
            label: RwLock::new(String::new()),
            tx,
            created_at: Instant::now(),
        }
    }

    pub async fn current_label(&self) -> String {
        self.label.read().await.clone()
    }

    /// Queue a frame without waiting. Full means the tunnel is saturated.
    pub fn try_enqueue(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        self.tx.try_send(frame)
    }

    /// Queue a frame, waiting for a slot if the queue is full.
    pub async fn enqueue(&self, frame: Frame) -> Result<(), mpsc::error::SendError<Frame>> {
        self.tx.send(frame).await
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&headers, &state.token) {
        warn!("Rejected tunnel upgrade: missing or invalid credentials");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    let requested = params.get("subdomain").cloned();
    ws.on_upgrade(move |socket| run_session(socket, state, requested))
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {token}"))
        .unwrap_or(false)
}

async fn run_session(socket: WebSocket, state: AppState, requested: Option<String>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let session = Arc::new(TunnelHandle::new(tx));

    // Honor a requested label when it is free; otherwise fall back to a
    // random one and tell the client what happened.
    let mut rejected = None;
    let label = match requested {
        Some(want) => {
            if state.registry.register(&want, session.clone()).await.is_ok() {
                want
            } else {
                rejected = Some(want);
                state.registry.register_fresh(session.clone()).await
            }
        }
        None => state.registry.register_fresh(session.clone()).await,
    };

    let assigned = Frame::SubdomainAssigned {
        subdomain: format!("{label}.{}", state.domain),
    };
    if session.enqueue(assigned).await.is_err() {
        state.registry.unregister(&label).await;
        return;
    }
    if let Some(want) = rejected {
        let _ = session
            .enqueue(Frame::Error {
                error: Error::SubdomainTaken(want).to_string(),
            })
            .await;
    }

    info!("Tunnel connected: {label}.{}", state.domain);
    state.metrics.tunnel_opened();

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(ws_tx, rx));
    read_loop(ws_rx, &session, &state).await;

    let label = session.current_label().await;
    state.registry.unregister(&label).await;
    state.metrics.tunnel_closed();
    info!("Tunnel {label} closed after {:?}", session.uptime());

    // Releasing the reader's handle closes the queue; the writer drains,
    // sends the close frame, and exits.
    drop(session);
    let _ = writer.await;
}

async fn read_loop(mut ws_rx: SplitStream<WebSocket>, session: &Arc<TunnelHandle>, state: &AppState) {
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            // Pings are answered by the websocket layer.
            Ok(_) => continue,
            Err(e) => {
                debug!("Tunnel socket error: {e}");
                break;
            }
        };

        match Frame::decode(&text) {
            Ok(Frame::HttpResponse {
                id,
                status,
                headers,
                body,
            }) => {
                let key = id.clone();
                let frame = Frame::HttpResponse {
                    id,
                    status,
                    headers,
                    body,
                };
                state.pending.deliver(&key, frame);
            }
            Ok(Frame::SubdomainRequest {
                requested_subdomain,
            }) => {
                handle_rename(session, state, requested_subdomain).await;
            }
            Ok(other) => debug!("Ignoring unexpected frame: {other:?}"),
            Err(e) => warn!("Dropping malformed frame: {e}"),
        }
    }
}

/// Attempt the atomic registry swap and acknowledge through the session's
/// own queue. The queue is never replaced: in-flight frames keep their
/// ordering across a rename.
async fn handle_rename(session: &Arc<TunnelHandle>, state: &AppState, requested: String) {
    let old = session.current_label().await;
    let reply = match state.registry.rename(&old, &requested).await {
        Ok(()) => {
            info!("Tunnel {old} renamed to {requested}.{}", state.domain);
            Frame::SubdomainAssigned {
                subdomain: format!("{requested}.{}", state.domain),
            }
        }
        Err(e) => Frame::Error {
            error: e.to_string(),
        },
    };
    if session.enqueue(reply).await.is_err() {
        debug!("Tunnel {old} queue closed before rename reply");
    }
}

/// The session's single writer. Exits when the socket fails or when every
/// queue sender is gone, saying goodbye with a close frame in the latter
/// case.
async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode frame: {e}");
                continue;
            }
        };
        if ws_tx.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bearer(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_authorized_exact_match() {
        assert!(authorized(&bearer("Bearer secret"), "secret"));
    }

    #[test]
    fn test_authorized_rejects_bad_token() {
        assert!(!authorized(&bearer("Bearer wrong"), "secret"));
        assert!(!authorized(&bearer("secret"), "secret"));
        assert!(!authorized(&HeaderMap::new(), "secret"));
    }

    #[tokio::test]
    async fn test_try_enqueue_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let session = TunnelHandle::new(tx);

        session
            .try_enqueue(Frame::Error { error: "a".into() })
            .unwrap();
        let err = session
            .try_enqueue(Frame::Error { error: "b".into() })
            .unwrap_err();
        assert!(matches!(err, TrySendError::Full(_)));
    }

    #[tokio::test]
    async fn test_try_enqueue_closed_queue() {
        let (tx, rx) = mpsc::channel(1);
        let session = TunnelHandle::new(tx);
        drop(rx);

        let err = session
            .try_enqueue(Frame::Error { error: "a".into() })
            .unwrap_err();
        assert!(matches!(err, TrySendError::Closed(_)));
    }
}
