#![forbid(unsafe_code)]

//! Relay telemetry.
//!
//! Installs the `tracing` subscriber used by every relay crate and keeps a small set of
//! Prometheus counters describing frame traffic and faults. Counters live in a dedicated
//! [`prometheus::Registry`] so embedding applications can expose or merge them as they see fit.

use std::sync::Arc;

use anyhow::Context;
use once_cell::sync::OnceCell;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::{info, span, Level};
use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber filtered by `RUST_LOG`, or by `level` when the variable is
/// unset. Returns `false` when a global subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Create a tracing span for operations.
pub fn create_span(name: &str, operation: &str) -> tracing::Span {
    span!(
        Level::INFO,
        "relay_operation",
        operation = operation,
        operation_name = name,
    )
}

/// Counters exported by a relay gateway.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    frames_total: IntCounterVec,
    faults_total: IntCounterVec,
    sessions_active: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("relay".into()), None)
            .context("creating relay registry")?;
        let frames_total = IntCounterVec::new(
            Opts::new("frames_total", "Frames handled by proxy sessions"),
            &["kind", "direction"],
        )?;
        let faults_total = IntCounterVec::new(
            Opts::new("faults_total", "Exchange-terminating faults by category"),
            &["category", "kind"],
        )?;
        let sessions_active = IntGauge::new("sessions_active", "Proxy sessions currently live")?;

        registry.register(Box::new(frames_total.clone()))?;
        registry.register(Box::new(faults_total.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;

        Ok(Self { registry, frames_total, faults_total, sessions_active })
    }

    /// Count one frame; `direction` is `inbound` or `outbound`.
    pub fn record_frame(&self, kind: &str, direction: &str) {
        self.frames_total.with_label_values(&[kind, direction]).inc();
    }

    pub fn record_fault(&self, category: &str, kind: &str) {
        self.faults_total.with_label_values(&[category, kind]).inc();
    }

    pub fn session_opened(&self) {
        self.sessions_active.inc();
    }

    pub fn session_closed(&self) {
        self.sessions_active.dec();
    }

    pub fn frames(&self, kind: &str, direction: &str) -> u64 {
        self.frames_total.with_label_values(&[kind, direction]).get()
    }

    pub fn faults(&self, category: &str, kind: &str) -> u64 {
        self.faults_total.with_label_values(&[category, kind]).get()
    }

    pub fn active_sessions(&self) -> i64 {
        self.sessions_active.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every counter in the Prometheus text exposition format.
    pub fn encode_text(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

/// Global metrics instance.
static METRICS: OnceCell<Arc<Metrics>> = OnceCell::new();

/// Initialize global metrics. Later calls return the instance installed first.
pub fn init_metrics() -> anyhow::Result<Arc<Metrics>> {
    let metrics = METRICS.get_or_try_init(|| Metrics::new().map(Arc::new))?;
    info!("relay metrics registry initialized");
    Ok(metrics.clone())
}

/// Get global metrics, if installed.
pub fn metrics() -> Option<Arc<Metrics>> {
    METRICS.get().cloned()
}

/// Record a fault globally; no-op until [`init_metrics`] ran.
pub fn record_fault(category: &str, kind: &str) {
    if let Some(m) = metrics() {
        m.record_fault(category, kind);
    }
}

/// Record a frame globally; no-op until [`init_metrics`] ran.
pub fn record_frame(kind: &str, direction: &str) {
    if let Some(m) = metrics() {
        m.record_frame(kind, direction);
    }
}

/// Track a session start globally; no-op until [`init_metrics`] ran.
pub fn record_session_opened() {
    if let Some(m) = metrics() {
        m.session_opened();
    }
}

pub fn record_session_closed() {
    if let Some(m) = metrics() {
        m.session_closed();
    }
}
