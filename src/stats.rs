//! Per-tunnel traffic accounting and the optional usage report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

/// Ceiling on one usage-report POST.
const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Uplink/downlink byte totals for one tunnel. Uplink is client → remote.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    uplink: AtomicU64,
    downlink: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_uplink(&self, bytes: u64) {
        self.uplink.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downlink(&self, bytes: u64) {
        self.downlink.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uplink(&self) -> u64 {
        self.uplink.load(Ordering::Relaxed)
    }

    pub fn downlink(&self) -> u64 {
        self.downlink.load(Ordering::Relaxed)
    }

    pub fn is_zero(&self) -> bool {
        self.uplink() == 0 && self.downlink() == 0
    }
}

#[derive(Debug, Serialize)]
struct UsageReport<'a> {
    uuid: &'a str,
    uplink: u64,
    downlink: u64,
}

/// Fire-and-forget usage report. Spawned at tunnel close; never blocks
/// teardown and never propagates failure.
pub fn spawn_usage_report(
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    uuid: String,
    uplink: u64,
    downlink: u64,
) {
    tokio::spawn(async move {
        let mut req = http
            .post(&endpoint)
            .timeout(REPORT_TIMEOUT)
            .json(&UsageReport {
                uuid: &uuid,
                uplink,
                downlink,
            });
        if let Some(token) = &token {
            req = req.bearer_auth(token);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(uuid = %uuid, uplink, downlink, "usage reported");
            }
            Ok(resp) => {
                warn!(uuid = %uuid, status = %resp.status(), "usage report rejected");
            }
            Err(e) => {
                warn!(uuid = %uuid, error = %e, "usage report failed");
            }
        }
    });
}
