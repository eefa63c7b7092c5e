//! Metrics for the porthole relay.
//!
//! Atomic counters exposed as Prometheus text at `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    total_requests: AtomicU64,
    active_tunnels: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed public request by final status.
    pub fn record_request(&self, status: u16) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
        let counter = match status / 100 {
            2 => &self.inner.status_2xx,
            3 => &self.inner.status_3xx,
            4 => &self.inner.status_4xx,
            5 => &self.inner.status_5xx,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_opened(&self) {
        self.inner.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        self.inner.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn to_prometheus(&self) -> String {
        format!(
            r#"# HELP porthole_requests_total Total public requests processed
# TYPE porthole_requests_total counter
porthole_requests_total {}

# HELP porthole_active_tunnels Connected tunnel sessions
# TYPE porthole_active_tunnels gauge
porthole_active_tunnels {}

# HELP porthole_requests_by_status Public requests by status class
# TYPE porthole_requests_by_status counter
porthole_requests_by_status{{status="2xx"}} {}
porthole_requests_by_status{{status="3xx"}} {}
porthole_requests_by_status{{status="4xx"}} {}
porthole_requests_by_status{{status="5xx"}} {}
"#,
            self.inner.total_requests.load(Ordering::Relaxed),
            self.inner.active_tunnels.load(Ordering::Relaxed),
            self.inner.status_2xx.load(Ordering::Relaxed),
            self.inner.status_3xx.load(Ordering::Relaxed),
            self.inner.status_4xx.load(Ordering::Relaxed),
            self.inner.status_5xx.load(Ordering::Relaxed),
        )
    }
}
