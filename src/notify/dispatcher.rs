//! Notification Dispatcher
//!
//! Delivers one message to one device, or fans a message out to many devices
//! with every delivery isolated from the others. Failures are reported in the
//! returned [`DeliveryResult`], never raised.

use crate::domain::ports::{PushMessage, PushProvider};
use crate::error::Error;
use crate::metrics::RelayMetrics;
use crate::registry::SubscriptionRegistry;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound for a single provider call
    pub send_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Delivery Result
// =============================================================================

/// Outcome of delivering to one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub device_token: String,
    pub success: bool,
    /// Provider ticket when accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResult {
    fn delivered(device_token: &str, ticket: String) -> Self {
        Self {
            device_token: device_token.to_string(),
            success: true,
            ticket: Some(ticket),
            error: None,
        }
    }

    fn failed(device_token: &str, error: impl Into<String>) -> Self {
        Self {
            device_token: device_token.to_string(),
            success: false,
            ticket: None,
            error: Some(error.into()),
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Turns registry lookups into provider deliveries
pub struct NotificationDispatcher {
    config: DispatcherConfig,
    registry: Arc<SubscriptionRegistry>,
    provider: Arc<dyn PushProvider>,
    metrics: Arc<RelayMetrics>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("provider", &self.provider.provider_name())
            .field("send_timeout", &self.config.send_timeout)
            .finish()
    }
}

impl NotificationDispatcher {
    /// Create a new dispatcher
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<SubscriptionRegistry>,
        provider: Arc<dyn PushProvider>,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            provider,
            metrics,
        })
    }

    /// Deliver `message` to one device
    pub async fn send_notification(&self, device_token: &str, message: &PushMessage) -> DeliveryResult {
        let Some(subscription) = self.registry.subscription(device_token) else {
            self.metrics.record_delivery("no_subscription");
            debug!(device_token = %device_token, "No subscription for device");
            return DeliveryResult::failed(device_token, "no subscription for device");
        };
        let Some(push_token) = subscription.push_token else {
            self.metrics.record_delivery("no_push_token");
            debug!(device_token = %device_token, "Device has no push token");
            return DeliveryResult::failed(device_token, "device has no push token");
        };

        let timeout = self.config.send_timeout;
        let outcome = match tokio::time::timeout(timeout, self.provider.send(&push_token, message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProviderTimeout(timeout)),
        };

        match outcome {
            Ok(ticket) => {
                self.metrics.record_delivery("ok");
                info!(
                    device_token = %device_token,
                    ticket = %ticket.id,
                    provider = self.provider.provider_name(),
                    "Notification delivered"
                );
                DeliveryResult::delivered(device_token, ticket.id)
            }
            Err(e) => {
                self.metrics.record_delivery("provider_error");
                warn!(
                    device_token = %device_token,
                    error = %e,
                    provider = self.provider.provider_name(),
                    "Notification delivery failed"
                );
                DeliveryResult::failed(device_token, e.to_string())
            }
        }
    }

    /// Deliver `message` to every device, independently
    ///
    /// Results are returned in input order; one failure never affects another device.
    pub async fn broadcast<I, S>(&self, device_tokens: I, message: &PushMessage) -> Vec<DeliveryResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<String> = device_tokens
            .into_iter()
            .map(|t| t.as_ref().to_string())
            .collect();
        let results = join_all(
            tokens
                .iter()
                .map(|token| self.send_notification(token, message)),
        )
        .await;

        let delivered = results.iter().filter(|r| r.success).count();
        debug!(
            devices = results.len(),
            delivered = delivered,
            failed = results.len() - delivered,
            "Broadcast complete"
        );
        results
    }

    /// Deliver `message` to every device subscribed to `address`
    pub async fn notify_address(&self, address: &str, message: &PushMessage) -> Vec<DeliveryResult> {
        let mut devices: Vec<String> = self.registry.devices_for_address(address).into_iter().collect();
        if devices.is_empty() {
            debug!(address = %address, "No devices subscribed to address");
            return Vec::new();
        }
        devices.sort();
        self.broadcast(devices, message).await
    }
}
