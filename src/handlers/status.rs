//! Status and health check handlers for the add-on server.
//!
//! - `/status` - runtime counters and webhook dispatch latency
//! - `/health` - simple liveness check
//!
//! # Architecture
//!
//! ```text
//! HTTP Request ──> Axum Router ──> status endpoint ──> RuntimeStats
//!                                        │                 │
//!                                        ▼                 ▼
//!                                 StatusResponse   LatencyHistogram
//!                                        │           + Counters
//!                                        ▼
//!                                   JSON Response
//! ```
//!
//! # Example Response
//!
//! ```json
//! {
//!   "name": "hipchat-addon",
//!   "version": "0.1.1",
//!   "status": "running",
//!   "uptime_seconds": 3600,
//!   "installations": 12,
//!   "counters": {
//!     "installs": 14, "uninstalls": 2,
//!     "webhooks_received": 530, "webhooks_delivered": 120,
//!     "webhooks_ignored": 402, "auth_failures": 3, "callback_errors": 5
//!   },
//!   "latency": { "p50_ms": 12.5, "p95_ms": 45.2, "p99_ms": 98.7, ... },
//!   "timestamp": "2026-01-01T12:00:00+00:00"
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Server version from Cargo.toml
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name from Cargo.toml
pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");

// ============================================================================
// Response Types
// ============================================================================

/// Health check response for simple liveness checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Health status (always "healthy" if responding)
    pub status: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

/// Detailed server status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Server name
    pub name: String,

    /// Server version
    pub version: String,

    /// Always "running" if responding
    pub status: String,

    /// Server uptime in seconds
    pub uptime_seconds: u64,

    /// Installations currently stored
    pub installations: usize,

    /// Lifecycle and webhook counters
    pub counters: Counters,

    /// Webhook dispatch latency
    pub latency: LatencyMetrics,

    /// RFC 3339 timestamp of when status was generated
    pub timestamp: String,
}

impl StatusResponse {
    /// Snapshot the runtime statistics
    pub fn collect(stats: &RuntimeStats, installations: usize) -> Self {
        Self {
            name: SERVER_NAME.to_string(),
            version: SERVER_VERSION.to_string(),
            status: "running".to_string(),
            uptime_seconds: stats.uptime_seconds(),
            installations,
            counters: stats.counters(),
            latency: stats.latency_metrics(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Successful install callbacks
    pub installs: u64,
    /// Uninstall callbacks that removed a record
    pub uninstalls: u64,
    /// Webhook requests received
    pub webhooks_received: u64,
    /// Deliveries the handler processed
    pub webhooks_delivered: u64,
    /// Deliveries that did not match
    pub webhooks_ignored: u64,
    /// Rejected webhook tokens
    pub auth_failures: u64,
    /// Handler failures
    pub callback_errors: u64,
}

/// Latency percentile metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyMetrics {
    /// 50th percentile (median) latency in milliseconds
    pub p50_ms: f64,

    /// 95th percentile latency in milliseconds
    pub p95_ms: f64,

    /// 99th percentile latency in milliseconds
    pub p99_ms: f64,

    /// Total number of samples recorded
    pub total_requests: u64,

    /// Mean latency in milliseconds
    pub mean_ms: f64,

    /// Maximum latency recorded in milliseconds
    pub max_ms: f64,
}

// ============================================================================
// Latency Histogram
// ============================================================================

/// Thread-safe latency histogram.
///
/// Tracks latencies from 1 microsecond to 60 seconds with 3 significant
/// figures of precision.
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: RwLock<Histogram<u64>>,
}

impl LatencyHistogram {
    /// Create a new latency histogram.
    pub fn new() -> Self {
        // Constant bounds are always valid
        let histogram =
            Histogram::new_with_bounds(1, 60_000_000, 3).expect("valid histogram bounds");
        Self {
            inner: RwLock::new(histogram),
        }
    }

    /// Record a latency value in microseconds.
    ///
    /// Values outside the histogram bounds are ignored.
    pub fn record(&self, latency_us: u64) {
        let _ = self.inner.write().record(latency_us);
    }

    /// Record a latency duration.
    pub fn record_duration(&self, duration: std::time::Duration) {
        self.record(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX));
    }

    /// Get the total count of recorded values.
    pub fn count(&self) -> u64 {
        self.inner.read().len()
    }

    /// Percentiles converted to milliseconds.
    pub fn metrics(&self) -> LatencyMetrics {
        let hist = self.inner.read();
        if hist.is_empty() {
            return LatencyMetrics::default();
        }
        LatencyMetrics {
            p50_ms: hist.value_at_percentile(50.0) as f64 / 1000.0,
            p95_ms: hist.value_at_percentile(95.0) as f64 / 1000.0,
            p99_ms: hist.value_at_percentile(99.0) as f64 / 1000.0,
            total_requests: hist.len(),
            mean_ms: hist.mean() / 1000.0,
            max_ms: hist.max() as f64 / 1000.0,
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Runtime Statistics
// ============================================================================

/// Shared counters updated by the request handlers.
///
/// All fields are atomics or internally locked; safe to share behind an
/// `Arc` across every request.
#[derive(Debug)]
pub struct RuntimeStats {
    start_time: Instant,
    installs: AtomicU64,
    uninstalls: AtomicU64,
    webhooks_received: AtomicU64,
    webhooks_delivered: AtomicU64,
    webhooks_ignored: AtomicU64,
    auth_failures: AtomicU64,
    callback_errors: AtomicU64,
    dispatch_latency: LatencyHistogram,
}

impl RuntimeStats {
    /// Create zeroed stats starting now
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            installs: AtomicU64::new(0),
            uninstalls: AtomicU64::new(0),
            webhooks_received: AtomicU64::new(0),
            webhooks_delivered: AtomicU64::new(0),
            webhooks_ignored: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            callback_errors: AtomicU64::new(0),
            dispatch_latency: LatencyHistogram::new(),
        }
    }

    /// Get the server uptime in seconds.
    #[inline]
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    #[inline]
    pub(crate) fn record_install(&self) {
        self.installs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_uninstall(&self) {
        self.uninstalls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_webhook_received(&self) {
        self.webhooks_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_delivered(&self, elapsed: std::time::Duration) {
        self.webhooks_delivered.fetch_add(1, Ordering::Relaxed);
        self.dispatch_latency.record_duration(elapsed);
    }

    #[inline]
    pub(crate) fn record_ignored(&self) {
        self.webhooks_ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_callback_error(&self, elapsed: std::time::Duration) {
        self.callback_errors.fetch_add(1, Ordering::Relaxed);
        self.dispatch_latency.record_duration(elapsed);
    }

    /// Counter snapshot
    pub fn counters(&self) -> Counters {
        Counters {
            installs: self.installs.load(Ordering::Relaxed),
            uninstalls: self.uninstalls.load(Ordering::Relaxed),
            webhooks_received: self.webhooks_received.load(Ordering::Relaxed),
            webhooks_delivered: self.webhooks_delivered.load(Ordering::Relaxed),
            webhooks_ignored: self.webhooks_ignored.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
        }
    }

    /// Dispatch latency percentiles
    #[inline]
    pub fn latency_metrics(&self) -> LatencyMetrics {
        self.dispatch_latency.metrics()
    }
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HTTP Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// # Route
/// `GET /health`
#[instrument(skip_all)]
pub async fn health_handler() -> impl IntoResponse {
    debug!("Health check requested");
    (StatusCode::OK, Json(HealthResponse::default()))
}
