//! Client tunnel session.
//!
//! Dials the relay's control endpoint, reads frames in a single loop, and
//! spawns one worker per inbound request so a slow local service never
//! stalls the reader. Every socket write goes through one mutex guard.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use porthole_shared::protocol::Frame;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::forwarder::Forwarder;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

pub struct TunnelClient {
    server_url: String,
    token: String,
    local_port: u16,
    requested_subdomain: Option<String>,
}

impl TunnelClient {
    pub fn new(
        server_url: String,
        token: String,
        local_port: u16,
        requested_subdomain: Option<String>,
    ) -> Self {
        Self {
            server_url,
            token,
            local_port,
            requested_subdomain,
        }
    }

    /// Connect and serve until the relay closes the session or the user
    /// interrupts.
    pub async fn run(self) -> Result<()> {
        let ws_url = build_ws_url(&self.server_url, self.requested_subdomain.as_deref())?;

        let request = http::Request::builder()
            .uri(ws_url.as_str())
            .header("Host", host_header(&ws_url)?)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())
            .context("Failed to build upgrade request")?;

        println!("🔌 Connecting to tunnel relay...");
        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to relay")?;

        let (sink, stream) = ws_stream.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));
        let forwarder = Arc::new(Forwarder::new(self.local_port)?);

        run_session(
            stream,
            sink,
            forwarder,
            self.local_port,
            self.requested_subdomain,
        )
        .await
    }
}

async fn run_session(
    mut stream: SplitStream<WsStream>,
    sink: WsSink,
    forwarder: Arc<Forwarder>,
    local_port: u16,
    requested: Option<String>,
) -> Result<()> {
    // One follow-up rename request in case the relay ignored the query
    // parameter; the user's label must not be dropped silently.
    let mut want_rename = requested;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&text, &sink, &forwarder, local_port, &mut want_rename).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Connection closed by relay");
                        break;
                    }
                    // Pings are answered by the websocket layer.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Websocket error: {e}");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, closing tunnel...");
                {
                    let mut sink = sink.lock().await;
                    let _ = sink.send(Message::Close(None)).await;
                }
                // Give the relay a moment to acknowledge the close.
                let _ = tokio::time::timeout(Duration::from_secs(1), drain(&mut stream)).await;
                break;
            }
        }
    }

    Ok(())
}

async fn dispatch(
    text: &str,
    sink: &WsSink,
    forwarder: &Arc<Forwarder>,
    local_port: u16,
    want_rename: &mut Option<String>,
) -> Result<()> {
    match Frame::decode(text) {
        Ok(Frame::SubdomainAssigned { subdomain }) => {
            println!("🚀 Tunnel active! Your URL is: {subdomain}");
            println!("💡 Forwarding requests to localhost:{local_port}");
            println!("📝 Press Ctrl+C to stop the tunnel");

            if let Some(want) = want_rename.take() {
                if bare_label(&subdomain) != want {
                    debug!("Assigned label differs from requested '{want}', renaming");
                    send_frame(
                        sink,
                        &Frame::SubdomainRequest {
                            requested_subdomain: want,
                        },
                    )
                    .await?;
                }
            }
        }
        Ok(Frame::HttpRequest {
            id,
            method,
            path,
            headers,
            body,
        }) => {
            let sink = sink.clone();
            let forwarder = forwarder.clone();
            tokio::spawn(async move {
                let response = forwarder.handle(id, method, path, headers, body).await;
                if let Err(e) = send_frame(&sink, &response).await {
                    warn!("Failed to send response: {e}");
                }
            });
        }
        Ok(Frame::Error { error }) => {
            error!("❌ Relay error: {error}");
        }
        Ok(other) => debug!("Ignoring unexpected frame: {other:?}"),
        Err(e) => warn!("Dropping malformed frame: {e}"),
    }

    Ok(())
}

/// Serialize a frame onto the shared socket. Workers run to completion and
/// each performs one short write under the guard.
async fn send_frame(sink: &WsSink, frame: &Frame) -> Result<()> {
    let text = frame.encode()?;
    let mut sink = sink.lock().await;
    sink.send(Message::Text(text.into()))
        .await
        .context("Websocket write failed")?;
    Ok(())
}

async fn drain(stream: &mut SplitStream<WsStream>) {
    while let Some(msg) = stream.next().await {
        if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
            break;
        }
    }
}

/// Derive the control-channel URL from the relay base URL: `ws` for plain
/// HTTP, `wss` for TLS, path `/ws`, requested label as a query parameter.
fn build_ws_url(server_url: &str, subdomain: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(server_url).context("Invalid relay URL")?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => anyhow::bail!("Unsupported relay URL scheme '{other}'"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Invalid relay URL"))?;
    url.set_path("/ws");
    url.set_query(None);
    if let Some(label) = subdomain {
        url.query_pairs_mut().append_pair("subdomain", label);
    }
    Ok(url)
}

fn host_header(url: &Url) -> Result<String> {
    let host = url.host_str().context("Relay URL has no host")?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn bare_label(fqdn: &str) -> &str {
    fqdn.split('.').next().unwrap_or(fqdn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ws_url_plaintext() {
        let url = build_ws_url("http://localhost:9090", None).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9090/ws");
    }

    #[test]
    fn test_build_ws_url_tls_with_subdomain() {
        let url = build_ws_url("https://tunnel.example.com", Some("myapp")).unwrap();
        assert_eq!(url.as_str(), "wss://tunnel.example.com/ws?subdomain=myapp");
    }

    #[test]
    fn test_build_ws_url_rejects_odd_scheme() {
        assert!(build_ws_url("ftp://example.com", None).is_err());
        assert!(build_ws_url("not a url", None).is_err());
    }

    #[test]
    fn test_host_header_keeps_explicit_port() {
        let url = build_ws_url("http://localhost:9090", None).unwrap();
        assert_eq!(host_header(&url).unwrap(), "localhost:9090");

        let url = build_ws_url("https://tunnel.example.com", None).unwrap();
        assert_eq!(host_header(&url).unwrap(), "tunnel.example.com");
    }

    #[test]
    fn test_bare_label() {
        assert_eq!(bare_label("myapp.example.com"), "myapp");
        assert_eq!(bare_label("myapp"), "myapp");
    }
}
