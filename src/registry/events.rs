//! Registry Events
//!
//! Events emitted by the subscription registry for external consumers to react to
//! subscription lifecycle changes.

use serde::{Deserialize, Serialize};

/// Events emitted by the subscription registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A device subscription was installed (new or replaced)
    Subscribed {
        device_token: String,
        address_count: usize,
        replaced: bool,
    },

    /// A device subscription was removed on request
    Unsubscribed { device_token: String },

    /// An address claim moved between devices sharing a push token
    AddressReassigned {
        address: String,
        from_device: String,
        to_device: String,
    },

    /// A subscription lost its last address through reassignment
    SubscriptionDropped { device_token: String },
}

impl RegistryEvent {
    /// Get the device token this event is about
    pub fn device_token(&self) -> &str {
        match self {
            RegistryEvent::Subscribed { device_token, .. } => device_token,
            RegistryEvent::Unsubscribed { device_token } => device_token,
            RegistryEvent::AddressReassigned { from_device, .. } => from_device,
            RegistryEvent::SubscriptionDropped { device_token } => device_token,
        }
    }

    /// Check if this event removed a subscription entirely
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            RegistryEvent::Unsubscribed { .. } | RegistryEvent::SubscriptionDropped { .. }
        )
    }
}

impl std::fmt::Display for RegistryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryEvent::Subscribed {
                device_token,
                address_count,
                replaced,
            } => write!(
                f,
                "subscribed {} to {} address(es){}",
                device_token,
                address_count,
                if *replaced { " (replaced)" } else { "" }
            ),
            RegistryEvent::Unsubscribed { device_token } => {
                write!(f, "unsubscribed {}", device_token)
            }
            RegistryEvent::AddressReassigned {
                address,
                from_device,
                to_device,
            } => write!(f, "reassigned {} from {} to {}", address, from_device, to_device),
            RegistryEvent::SubscriptionDropped { device_token } => {
                write!(f, "dropped emptied subscription {}", device_token)
            }
        }
    }
}
