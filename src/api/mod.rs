//! API Module
//!
//! HTTP boundary for subscription management, health and metrics.

pub mod rest;
pub mod server;
pub mod validation;

pub use rest::*;
pub use server::*;
pub use validation::*;
