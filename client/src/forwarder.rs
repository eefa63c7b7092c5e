//! Local forwarder: replays tunneled requests against the local service.
//!
//! One forwarder is shared by all request workers; each call turns a single
//! `http_request` frame into the `http_response` frame to send back.

use std::collections::HashMap;

use anyhow::{Context, Result};
use porthole_shared::protocol::{Frame, RESPONSE_TIMEOUT};
use reqwest::header::HeaderMap;
use tracing::{info, warn};

pub struct Forwarder {
    client: reqwest::Client,
    local_port: u16,
}

impl Forwarder {
    pub fn new(local_port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RESPONSE_TIMEOUT)
            .build()
            .context("Failed to build local HTTP client")?;
        Ok(Self { client, local_port })
    }

    /// Execute one tunneled request. Any local failure becomes a synthesized
    /// 500 frame with a JSON error body; the request id is always preserved.
    pub async fn handle(
        &self,
        id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: String,
    ) -> Frame {
        match self.forward(&method, &path, headers, body).await {
            Ok((status, headers, body)) => {
                info!("✅ {method} {path} -> {status}");
                Frame::HttpResponse {
                    id,
                    status,
                    headers,
                    body,
                }
            }
            Err(e) => {
                warn!("❌ {method} {path} failed: {e:#}");
                error_response(id, &format!("{e:#}"))
            }
        }
    }

    async fn forward(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: String,
    ) -> Result<(u16, HashMap<String, String>, String)> {
        let url = format!("http://localhost:{}{}", self.local_port, path);
        let method: reqwest::Method = method.parse().context("Failed to create request")?;

        let mut request = self.client.request(method, &url);
        for (name, value) in &headers {
            // Host must resolve locally; everything else copies over.
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.context("Request failed")?;
        let status = response.status().as_u16();
        let headers = flatten_headers(response.headers());
        let bytes = response.bytes().await.context("Failed to read response")?;

        Ok((status, headers, String::from_utf8_lossy(&bytes).into_owned()))
    }
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

fn error_response(id: String, message: &str) -> Frame {
    Frame::HttpResponse {
        id,
        status: 500,
        headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
        body: serde_json::json!({ "error": message }).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_shape() {
        let frame = error_response("r1".into(), "Request failed: connection refused");
        match frame {
            Frame::HttpResponse {
                id,
                status,
                headers,
                body,
            } => {
                assert_eq!(id, "r1");
                assert_eq!(status, 500);
                assert_eq!(headers.get("Content-Type").unwrap(), "application/json");
                let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
                assert_eq!(parsed["error"], "Request failed: connection refused");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_error_message_is_escaped() {
        let frame = error_response("r1".into(), r#"bad "quoted" input"#);
        let Frame::HttpResponse { body, .. } = frame else {
            panic!("unexpected frame");
        };
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["error"], r#"bad "quoted" input"#);
    }

    #[test]
    fn test_flatten_headers_keeps_first_value() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());
        headers.insert("content-type", "text/html".parse().unwrap());

        let flat = flatten_headers(&headers);
        assert_eq!(flat.get("set-cookie").unwrap(), "a=1");
        assert_eq!(flat.get("content-type").unwrap(), "text/html");
    }
}
