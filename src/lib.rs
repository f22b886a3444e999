//! Chain Push Relay
//!
//! Relays blockchain events to mobile devices as push notifications. A
//! resilient client reads frames from an upstream event stream, a registry maps
//! monitored addresses to subscribed devices, and a dispatcher delivers the
//! formatted notifications through a push provider.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   frames    ┌─────────┐   receipts   ┌──────────────────────┐
//! │ EventStreamClient│ ──(mpsc)──▶ │  Relay  │ ───────────▶ │NotificationDispatcher│
//! │  (reconnecting)  │             └─────────┘              └──────────┬───────────┘
//! └──────────────────┘                  │ address → devices            │ push
//!                                       ▼                              ▼
//!                            ┌──────────────────────┐         ┌────────────────┐
//!   REST API ──────────────▶ │ SubscriptionRegistry │         │  PushProvider  │
//!   (/subscribe, /health)    │  (snapshot persisted)│         │     (Expo)     │
//!                            └──────────────────────┘         └────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`stream`]: Event-stream client with bounded reconnects
//! - [`registry`]: Address/device subscription registry
//! - [`persistence`]: Snapshot stores
//! - [`notify`]: Dispatcher and push providers
//! - [`relay`]: Frame decoding and routing
//! - [`api`]: HTTP boundary
//! - [`domain`]: Core types and traits
//! - [`error`]: Error types and handling

pub mod api;
pub mod context;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod persistence;
pub mod registry;
pub mod relay;
pub mod stream;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use context::{HealthReport, RelayContext};

pub use domain::ports::{
    EventSource, PushMessage, PushProvider, PushTicket, Snapshot, SnapshotEntry, SnapshotStore,
};

pub use error::{Error, ErrorCategory, Result};

pub use metrics::RelayMetrics;

pub use notify::{
    DeliveryResult, DispatcherConfig, ExpoConfig, ExpoPushProvider, NotificationDispatcher,
};

pub use persistence::{FileSnapshotStore, MemorySnapshotStore};

pub use registry::{RegistryConfig, RegistryEvent, RegistryStats, Subscription, SubscriptionRegistry};

pub use relay::{frame_forwarder, Relay, TransactionReceipt};

pub use stream::{
    ConnectionState, EventStreamClient, StreamClientConfig, StreamFrame, StreamStatus,
    WebSocketSource,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
