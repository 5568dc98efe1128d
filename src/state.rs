//! Shared application state passed to all subsystems.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::auth::AuthStore;
use crate::config::Config;

/// Central application state shared across all tunnels.
pub struct AppState {
    pub config: Arc<Config>,
    /// Tiered UUID authorization store.
    pub auth: Arc<AuthStore>,
    /// Shared client for DoH queries and traffic reports.
    pub http: reqwest::Client,
    /// Process-wide counters exposed on /api/stats.
    pub metrics: Arc<ServerMetrics>,
}

/// Aggregate tunnel metrics.
pub struct ServerMetrics {
    pub tunnels_total: AtomicU64,
    pub tunnels_active: AtomicU64,
    pub bytes_uplink: AtomicU64,
    pub bytes_downlink: AtomicU64,
    started: Instant,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            tunnels_total: AtomicU64::new(0),
            tunnels_active: AtomicU64::new(0),
            bytes_uplink: AtomicU64::new(0),
            bytes_downlink: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn tunnel_opened(&self) {
        self.tunnels_total.fetch_add(1, Ordering::Relaxed);
        self.tunnels_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self, uplink: u64, downlink: u64) {
        self.tunnels_active.fetch_sub(1, Ordering::Relaxed);
        self.bytes_uplink.fetch_add(uplink, Ordering::Relaxed);
        self.bytes_downlink.fetch_add(downlink, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new(config: Config, auth: Arc<AuthStore>, http: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            auth,
            http,
            metrics: Arc::new(ServerMetrics::new()),
        })
    }
}
