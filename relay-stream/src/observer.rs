#![forbid(unsafe_code)]

//! Observability hooks. Sessions report every terminal fault with enough context to diagnose it.

use std::sync::Arc;

use relay_telemetry::Metrics;
use tracing::{error, warn};

use crate::errors::{FaultCategory, StreamError};
use crate::frame::FrameKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    pub origin_id: u64,
    pub routed_id: u64,
    /// Half-stream the offending frame or request belonged to.
    pub stream_id: u64,
    pub kind: FrameKind,
    pub error: StreamError,
}

pub trait FaultObserver: Send + Sync {
    fn on_fault(&self, report: &FaultReport);

    fn on_frame(&self, _kind: FrameKind, _inbound: bool) {}
}

/// Writes faults to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl FaultObserver for LogObserver {
    fn on_fault(&self, report: &FaultReport) {
        match report.error.category() {
            FaultCategory::Resource => error!(
                "exchange {}:{} stream {} {}: {}",
                report.origin_id, report.routed_id, report.stream_id, report.kind, report.error
            ),
            _ => warn!(
                "exchange {}:{} stream {} {}: {}",
                report.origin_id, report.routed_id, report.stream_id, report.kind, report.error
            ),
        }
    }
}

/// Logs like [`LogObserver`] and counts frames and faults in Prometheus.
#[derive(Clone)]
pub struct MetricsObserver {
    metrics: Arc<Metrics>,
}

impl MetricsObserver {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl FaultObserver for MetricsObserver {
    fn on_fault(&self, report: &FaultReport) {
        LogObserver.on_fault(report);
        self.metrics.record_fault(report.error.category().as_str(), report.kind.as_str());
    }

    fn on_frame(&self, kind: FrameKind, inbound: bool) {
        self.metrics.record_frame(kind.as_str(), if inbound { "inbound" } else { "outbound" });
    }
}
