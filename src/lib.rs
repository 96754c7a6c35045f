//! Relaycast: rule-driven channel forwarding engine.

pub mod activity;
pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
