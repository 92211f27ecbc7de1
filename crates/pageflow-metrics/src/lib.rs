//! # Pageflow Metrics
//!
//! Prometheus counters and gauges for the serving core, plus `tracing`
//! subscriber setup for the binary.
//!
//! The collector is a process global: the binary initializes it once, and
//! the engine records into it when present. Recording into an uninitialized
//! collector is a no-op, so library tests never need metrics plumbing.

#![warn(missing_docs)]

pub mod collector;
pub mod tracing_setup;

pub use collector::MetricsCollector;
pub use tracing_setup::{init_tracing, LogFormat, TracingConfig};

use std::sync::OnceLock;

use thiserror::Error;

static METRICS: OnceLock<MetricsCollector> = OnceLock::new();

/// Metrics and tracing errors.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// `init_metrics` called twice.
    #[error("metrics already initialized")]
    AlreadyInitialized,

    /// Prometheus registration failed.
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Subscriber installation failed.
    #[error("tracing error: {0}")]
    Tracing(String),
}

/// Install the process-wide collector.
pub fn init_metrics() -> Result<(), MetricsError> {
    let collector = MetricsCollector::new()?;
    METRICS
        .set(collector)
        .map_err(|_| MetricsError::AlreadyInitialized)
}

/// The process-wide collector, when initialized.
pub fn metrics() -> Option<&'static MetricsCollector> {
    METRICS.get()
}
