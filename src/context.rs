//! Relay Context
//!
//! The components a running relay shares between the stream handler, the
//! relay task and the HTTP handlers. Built once at startup and passed around
//! as `Arc<RelayContext>`.

use crate::metrics::RelayMetrics;
use crate::notify::NotificationDispatcher;
use crate::registry::SubscriptionRegistry;
use crate::stream::{ConnectionState, EventStreamClient, StreamStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Shared handles for one relay instance
#[derive(Debug)]
pub struct RelayContext {
    pub registry: Arc<SubscriptionRegistry>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub stream: EventStreamClient,
    pub metrics: Arc<RelayMetrics>,
}

/// Persistence part of the health report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceHealth {
    pub dirty: bool,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failures: u64,
}

/// Aggregated service health
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `ok`, or `degraded` when the stream is down or unsaved changes exist
    pub status: &'static str,
    pub active_subscriptions: usize,
    pub monitored_addresses: usize,
    pub stream: StreamStatus,
    pub persistence: PersistenceHealth,
}

impl RelayContext {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<NotificationDispatcher>,
        stream: EventStreamClient,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            dispatcher,
            stream,
            metrics,
        })
    }

    /// Build the health report
    pub fn health(&self) -> HealthReport {
        let stats = self.registry.stats();
        let stream = self.stream.status();
        let healthy = stream.state == ConnectionState::Open && !stats.dirty;

        HealthReport {
            status: if healthy { "ok" } else { "degraded" },
            active_subscriptions: stats.active_subscriptions,
            monitored_addresses: stats.monitored_addresses,
            stream,
            persistence: PersistenceHealth {
                dirty: stats.dirty,
                last_saved_at: stats.last_saved_at,
                last_error: stats.last_persist_error,
                failures: stats.persist_failures,
            },
        }
    }

    /// Copy current sizes and stream state into the gauges
    pub fn refresh_gauges(&self) {
        let stats = self.registry.stats();
        self.metrics
            .active_subscriptions
            .set(stats.active_subscriptions as i64);
        self.metrics
            .monitored_addresses
            .set(stats.monitored_addresses as i64);
        self.metrics
            .stream_connected
            .set(i64::from(self.stream.is_connected()));
    }
}
