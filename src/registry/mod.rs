//! Subscription Registry Module
//!
//! Bidirectional address/device index with push-token deduplication and
//! snapshot persistence.

pub mod subscription_registry;
pub mod events;

pub use subscription_registry::*;
pub use events::*;
