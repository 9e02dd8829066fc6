//! Client-side resilience layer for a remote API gateway.
//!
//! Circuit breakers, in-flight request collapsing, local/server conflict
//! detection, fallback caching and query recovery after reconnects.

pub mod admin;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod consistency;
pub mod degradation;
pub mod lifecycle;
pub mod observability;
pub mod recovery;
pub mod resilience;
pub mod storage;

pub use config::schema::ResilienceConfig;
pub use lifecycle::{ResilienceLayer, Shutdown};
