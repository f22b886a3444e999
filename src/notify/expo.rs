//! Expo push provider
//!
//! Posts one message per call to the Expo push service and turns the
//! returned ticket into a [`PushTicket`] or a delivery error.

use crate::domain::ports::{PushMessage, PushProvider, PushTicket};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Public Expo push endpoint
pub const DEFAULT_EXPO_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Expo provider
#[derive(Debug, Clone)]
pub struct ExpoConfig {
    pub endpoint: String,
    /// Bearer token for projects with enhanced push security
    pub access_token: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ExpoConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_EXPO_ENDPOINT.to_string(),
            access_token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct ExpoMessage<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'a str>,
    priority: &'static str,
}

#[derive(Debug, Deserialize)]
struct ExpoTicket {
    status: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// `data` is a single ticket for a single message, a list for a batch
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpoTickets {
    One(ExpoTicket),
    Many(Vec<ExpoTicket>),
}

#[derive(Debug, Deserialize)]
struct ExpoResponse {
    #[serde(default)]
    data: Option<ExpoTickets>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

// =============================================================================
// Provider
// =============================================================================

/// Push provider backed by the Expo push service
#[derive(Debug, Clone)]
pub struct ExpoPushProvider {
    config: ExpoConfig,
    client: reqwest::Client,
}

impl ExpoPushProvider {
    /// Create a new provider
    pub fn new(config: ExpoConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

#[async_trait]
impl PushProvider for ExpoPushProvider {
    #[instrument(skip(self, message), fields(endpoint = %self.config.endpoint))]
    async fn send(&self, push_token: &str, message: &PushMessage) -> Result<PushTicket> {
        let payload = ExpoMessage {
            to: push_token,
            title: &message.title,
            body: &message.body,
            data: &message.data,
            sound: message.sound.as_deref(),
            priority: "high",
        };

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Accept", "application/json")
            .json(&payload);
        if let Some(token) = &self.config.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Delivery(format!(
                "push service returned {}: {}",
                status, body
            )));
        }

        let parsed: ExpoResponse = response.json().await?;
        if let Some(first) = parsed.errors.first() {
            return Err(Error::Delivery(format!("push service error: {}", first)));
        }

        let ticket = match parsed.data {
            Some(ExpoTickets::One(ticket)) => ticket,
            Some(ExpoTickets::Many(tickets)) => tickets
                .into_iter()
                .next()
                .ok_or_else(|| Error::Delivery("push service returned no ticket".into()))?,
            None => return Err(Error::Delivery("push service returned no ticket".into())),
        };

        match (ticket.status.as_str(), ticket.id) {
            ("ok", Some(id)) => {
                debug!(ticket = %id, "Push ticket accepted");
                Ok(PushTicket { id })
            }
            ("ok", None) => Err(Error::Delivery("ticket accepted without id".into())),
            (_, _) => Err(Error::Delivery(
                ticket
                    .message
                    .unwrap_or_else(|| format!("ticket status {}", ticket.status)),
            )),
        }
    }

    fn provider_name(&self) -> &str {
        "expo"
    }
}
