//! Domain Ports - Core trait definitions for the relay
//!
//! These traits define the boundaries between the relay logic and external systems:
//! durable snapshot storage, the push-delivery provider and the upstream event source.
//! Adapters implement these traits to provide concrete functionality.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Snapshot Types
// =============================================================================

/// Serialized form of a single subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// Subscribed addresses, stored as a sorted sequence
    pub addresses: Vec<String>,
    /// Delivery-provider token, `null` when not yet deliverable
    #[serde(default)]
    pub expo_push_token: Option<String>,
    /// Creation time of the subscription
    pub created_at: DateTime<Utc>,
}

/// Full dump of registry state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Subscriptions keyed by device token
    #[serde(default)]
    pub subscriptions: BTreeMap<String, SnapshotEntry>,
    /// When this snapshot was taken
    pub last_updated: DateTime<Utc>,
}

impl Snapshot {
    /// Number of subscriptions in the snapshot
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether the snapshot holds no subscriptions
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// Durable storage for registry snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Read the last saved snapshot
    ///
    /// Returns `Ok(None)` when nothing has been saved yet. A snapshot that exists
    /// but cannot be decoded is an error.
    async fn load(&self) -> Result<Option<Snapshot>>;

    /// Overwrite the stored snapshot
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Human-readable location, used in logs
    fn describe(&self) -> String;
}

// =============================================================================
// Push Delivery Types
// =============================================================================

/// A formatted notification ready for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    /// Structured payload delivered alongside the notification
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
}

impl PushMessage {
    /// Create a message with the default sound
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            data: serde_json::Value::Null,
            sound: Some("default".to_string()),
        }
    }

    /// Attach a structured payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Receipt returned by the provider for an accepted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTicket {
    pub id: String,
}

/// Opaque push-delivery capability
#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Deliver one message to one push token
    async fn send(&self, push_token: &str, message: &PushMessage) -> Result<PushTicket>;

    /// Provider name, used in logs
    fn provider_name(&self) -> &str;
}

// =============================================================================
// Event Source
// =============================================================================

/// Raw text frames read from an open event-source connection
///
/// The stream ends when the remote side closes the connection; an `Err` item
/// reports a transport failure.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Upstream event-source transport
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a new connection to `url`
    async fn open(&self, url: &str) -> Result<FrameStream>;
}
