//! Prometheus metric registration and recording.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::MetricsError;

/// Counters and gauges for the serving core.
pub struct MetricsCollector {
    registry: Registry,

    /// Requests accepted off the request ring.
    pub requests_ingested: IntCounter,
    /// Requests dropped anywhere in the pipeline.
    pub requests_dropped: IntCounter,
    /// Response deltas published.
    pub deltas_emitted: IntCounter,
    /// Tokens sampled.
    pub tokens_generated: IntCounter,

    /// Free pages in the pool (approximate).
    pub free_pages: IntGauge,
    /// Sequences currently running.
    pub running_seqs: IntGauge,
    /// Sequences waiting for admission.
    pub waiting_seqs: IntGauge,
}

impl MetricsCollector {
    /// Register every metric against a fresh registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let requests_ingested = IntCounter::new(
            "pageflow_requests_ingested_total",
            "Requests accepted off the request ring",
        )?;
        let requests_dropped = IntCounter::new(
            "pageflow_requests_dropped_total",
            "Requests dropped anywhere in the pipeline",
        )?;
        let deltas_emitted = IntCounter::new(
            "pageflow_deltas_emitted_total",
            "Response deltas published to the response ring",
        )?;
        let tokens_generated =
            IntCounter::new("pageflow_tokens_generated_total", "Tokens sampled")?;
        let free_pages = IntGauge::new("pageflow_free_pages", "Free KV-cache pages")?;
        let running_seqs = IntGauge::new("pageflow_running_seqs", "Sequences running")?;
        let waiting_seqs = IntGauge::new("pageflow_waiting_seqs", "Sequences waiting")?;

        registry.register(Box::new(requests_ingested.clone()))?;
        registry.register(Box::new(requests_dropped.clone()))?;
        registry.register(Box::new(deltas_emitted.clone()))?;
        registry.register(Box::new(tokens_generated.clone()))?;
        registry.register(Box::new(free_pages.clone()))?;
        registry.register(Box::new(running_seqs.clone()))?;
        registry.register(Box::new(waiting_seqs.clone()))?;

        Ok(Self {
            registry,
            requests_ingested,
            requests_dropped,
            deltas_emitted,
            tokens_generated,
            free_pages,
            running_seqs,
            waiting_seqs,
        })
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
