//! Prometheus metrics
//!
//! Counters and gauges for deliveries, inbound frames and registry size,
//! registered on a dedicated registry so several instances can coexist in tests.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Relay metrics
#[derive(Debug, Clone)]
pub struct RelayMetrics {
    registry: Registry,
    /// Delivery attempts by outcome (`ok`, `provider_error`, `no_subscription`, `no_push_token`)
    pub deliveries: IntCounterVec,
    /// Relayed frames by kind (`receipt`, `unrecognized`, `undecodable`, `overflow`)
    pub frames: IntCounterVec,
    pub active_subscriptions: IntGauge,
    pub monitored_addresses: IntGauge,
    /// 1 while the event stream is open
    pub stream_connected: IntGauge,
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl RelayMetrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let deliveries = IntCounterVec::new(
            Opts::new("push_relay_deliveries_total", "Push delivery attempts by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let frames = IntCounterVec::new(
            Opts::new("push_relay_frames_total", "Relayed event-stream frames by kind"),
            &["kind"],
        )
        .map_err(metrics_error)?;
        let active_subscriptions = IntGauge::new(
            "push_relay_active_subscriptions",
            "Number of registered device subscriptions",
        )
        .map_err(metrics_error)?;
        let monitored_addresses = IntGauge::new(
            "push_relay_monitored_addresses",
            "Number of distinct addresses with at least one subscriber",
        )
        .map_err(metrics_error)?;
        let stream_connected = IntGauge::new(
            "push_relay_stream_connected",
            "Whether the upstream event stream is open",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(deliveries.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(frames.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(active_subscriptions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(monitored_addresses.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(stream_connected.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            deliveries,
            frames,
            active_subscriptions,
            monitored_addresses,
            stream_connected,
        })
    }

    /// Count a delivery attempt
    pub fn record_delivery(&self, outcome: &str) {
        self.deliveries.with_label_values(&[outcome]).inc();
    }

    /// Count a relayed frame
    pub fn record_frame(&self, kind: &str) {
        self.frames.with_label_values(&[kind]).inc();
    }

    /// Render the text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.record_delivery("ok");
        metrics.record_delivery("ok");
        metrics.record_frame("receipt");
        metrics.active_subscriptions.set(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("push_relay_deliveries_total{outcome=\"ok\"} 2"));
        assert!(text.contains("push_relay_frames_total{kind=\"receipt\"} 1"));
        assert!(text.contains("push_relay_active_subscriptions 3"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = RelayMetrics::new().unwrap();
        let b = RelayMetrics::new().unwrap();
        a.record_delivery("ok");
        assert!(!b.render().unwrap().contains("outcome=\"ok\""));
    }
}
