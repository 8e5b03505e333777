// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics collection for the SAP proxy.
//!
//! Tracks upstream traffic, CSRF handshakes, and gateway fallbacks.

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;

use crate::error::AppError;

/// Metrics collector for the proxy
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,

    // Upstream metrics
    pub upstream_requests: IntCounter,
    pub upstream_failures: IntCounter,
    pub upstream_latency: Histogram,

    // CSRF handshake metrics
    pub csrf_fetches: IntCounter,
    pub csrf_failures: IntCounter,

    // Dispatch metrics
    pub gateway_fallbacks: IntCounter,
    pub transfers_rejected: IntCounter,
}

fn counter(name: &str, help: &str) -> Result<IntCounter, AppError> {
    IntCounter::with_opts(Opts::new(name, help))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to create metric: {}", e)))
}

impl Metrics {
    pub fn new() -> Result<Self, AppError> {
        let registry = Registry::new();

        let upstream_requests = counter(
            "bsp_proxy_upstream_requests_total",
            "Total number of requests sent to SAP",
        )?;
        let upstream_failures = counter(
            "bsp_proxy_upstream_failures_total",
            "Total number of SAP requests that failed at the transport level",
        )?;
        let upstream_latency = Histogram::with_opts(
            HistogramOpts::new(
                "bsp_proxy_upstream_latency_seconds",
                "Duration of SAP requests in seconds",
            )
            .buckets(vec![
                0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
        )
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to create metric: {}", e)))?;

        let csrf_fetches = counter(
            "bsp_proxy_csrf_fetches_total",
            "Total number of CSRF token handshakes attempted",
        )?;
        let csrf_failures = counter(
            "bsp_proxy_csrf_failures_total",
            "Total number of CSRF handshakes that returned no token",
        )?;
        let gateway_fallbacks = counter(
            "bsp_proxy_gateway_fallbacks_total",
            "Total number of writes retried against the direct SAP backend",
        )?;
        let transfers_rejected = counter(
            "bsp_proxy_transfers_rejected_total",
            "Total number of transfer requests rejected by validation",
        )?;

        for collector in [
            Box::new(upstream_requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(upstream_failures.clone()),
            Box::new(upstream_latency.clone()),
            Box::new(csrf_fetches.clone()),
            Box::new(csrf_failures.clone()),
            Box::new(gateway_fallbacks.clone()),
            Box::new(transfers_rejected.clone()),
        ] {
            registry.register(collector).map_err(|e| {
                AppError::Internal(anyhow::anyhow!("Failed to register metric: {}", e))
            })?;
        }

        Ok(Self {
            registry: Arc::new(registry),
            upstream_requests,
            upstream_failures,
            upstream_latency,
            csrf_fetches,
            csrf_failures,
            gateway_fallbacks,
            transfers_rejected,
        })
    }

    /// Record a request sent to SAP
    pub fn record_upstream_request(&self) {
        self.upstream_requests.inc();
    }

    /// Record a transport-level SAP failure
    pub fn record_upstream_failure(&self) {
        self.upstream_failures.inc();
    }

    /// Observe latency for a SAP request in seconds
    pub fn record_upstream_latency(&self, seconds: f64) {
        self.upstream_latency.observe(seconds);
    }

    pub fn record_csrf_fetch(&self) {
        self.csrf_fetches.inc();
    }

    pub fn record_csrf_failure(&self) {
        self.csrf_failures.inc();
    }

    pub fn record_gateway_fallback(&self) {
        self.gateway_fallbacks.inc();
    }

    pub fn record_transfer_rejected(&self) {
        self.transfers_rejected.inc();
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String, AppError> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer).map_err(|e| {
            AppError::Internal(anyhow::anyhow!(
                "Failed to convert metrics to string: {}",
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_registered_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_gateway_fallback();
        metrics.record_csrf_fetch();

        let text = metrics.export().unwrap();

        assert!(text.contains("bsp_proxy_gateway_fallbacks_total 1"));
        assert!(text.contains("bsp_proxy_csrf_fetches_total 1"));
    }
}
