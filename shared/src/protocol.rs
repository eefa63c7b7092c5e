//! Wire protocol frames for porthole tunnel sessions.
//!
//! Frames travel as JSON text messages over the websocket control channel,
//! tagged by a `type` field. Optional fields are omitted when empty on the
//! wire and default when absent, so both sides tolerate sparse frames.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Maximum request/response body relayed through a tunnel (16 MB).
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// How long either side waits for an HTTP response before giving up.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// A message exchanged on the tunnel control channel.
///
/// Bodies are carried as text. Non-UTF-8 payloads are relayed lossily; the
/// wire format predates binary frames and is kept for compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Relay tells the client which public name it is reachable under.
    /// Carries the fully qualified `<label>.<domain>`.
    SubdomainAssigned { subdomain: String },

    /// Client asks to move its session to a specific bare label.
    SubdomainRequest { requested_subdomain: String },

    /// Relay forwards a public HTTP request into the tunnel.
    HttpRequest {
        id: String,
        method: String,
        path: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        body: String,
    },

    /// Client returns the local server's response for a forwarded request.
    HttpResponse {
        id: String,
        #[serde(default)]
        status: u16,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        body: String,
    },

    /// Relay reports a session-level problem without closing the session.
    Error { error: String },
}

impl Frame {
    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame received from the wire. Unknown `type` tags and frames
    /// missing required fields are errors; the caller logs and drops them.
    pub fn decode(text: &str) -> Result<Frame> {
        Ok(serde_json::from_str(text)?)
    }
}
