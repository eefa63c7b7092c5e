//! Subdomain registry for the porthole relay.
//!
//! Maps bare labels to live tunnel sessions. At most one session per label;
//! rename is atomic with respect to lookups.

use std::collections::HashMap;
use std::sync::Arc;

use porthole_shared::{ident, Error, Result};
use tokio::sync::RwLock;

use crate::tunnel::TunnelHandle;

#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<TunnelHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff no session is registered at `label`.
    pub async fn available(&self, label: &str) -> bool {
        !self.sessions.read().await.contains_key(label)
    }

    /// Insert a session under `label` and stamp the label on the session.
    /// Fails if the label is occupied.
    pub async fn register(&self, label: &str, session: Arc<TunnelHandle>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(label) {
            return Err(Error::SubdomainTaken(label.to_string()));
        }
        *session.label.write().await = label.to_string();
        sessions.insert(label.to_string(), session);
        Ok(())
    }

    /// Register under a fresh random label, regenerating on collision.
    pub async fn register_fresh(&self, session: Arc<TunnelHandle>) -> String {
        loop {
            let label = ident::subdomain_label();
            if self.register(&label, session.clone()).await.is_ok() {
                return label;
            }
        }
    }

    /// Remove `label` if present. Idempotent. Dropping the registry's handle
    /// releases its hold on the session queue; once the session task's own
    /// clone goes away the writer loop observes the queue closing and sends
    /// the websocket close frame.
    pub async fn unregister(&self, label: &str) {
        self.sessions.write().await.remove(label);
    }

    pub async fn lookup(&self, label: &str) -> Option<Arc<TunnelHandle>> {
        self.sessions.read().await.get(label).cloned()
    }

    /// Atomically move a session from `old` to `new`. Concurrent lookups see
    /// the old label or the new one, never both or neither. On failure the
    /// registry is unchanged.
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(new) {
            return Err(Error::SubdomainTaken(new.to_string()));
        }
        let Some(session) = sessions.remove(old) else {
            return Err(Error::UnknownSubdomain(old.to_string()));
        };
        *session.label.write().await = new.to_string();
        sessions.insert(new.to_string(), session);
        Ok(())
    }
}
