//! Notification Delivery
//!
//! The dispatcher resolves devices through the subscription registry and hands
//! formatted messages to a [`PushProvider`](crate::domain::PushProvider).
//! The Expo adapter talks to the Expo push HTTP API.

pub mod dispatcher;
pub mod expo;

pub use dispatcher::*;
pub use expo::*;
