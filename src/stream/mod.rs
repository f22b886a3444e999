//! Event Stream Module
//!
//! Resilient client for the upstream event source: a single reconnecting
//! connection with fixed-delay bounded retries, forwarding decoded frames to
//! one registered handler.

pub mod client;
pub mod frame;
pub mod websocket;

pub use client::*;
pub use frame::*;
pub use websocket::WebSocketSource;
