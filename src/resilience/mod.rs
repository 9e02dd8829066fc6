//! Call-level resilience.
//!
//! # Data Flow
//! ```text
//! Call to a backend endpoint:
//!     → dedup.rs (join an identical in-flight call, or start one)
//!     → registry.rs (resolve the endpoint's breaker)
//!     → circuit_breaker.rs (refuse while open, record the outcome otherwise)
//! ```
//!
//! # Design Decisions
//! - One breaker per endpoint identifier, created on first use
//! - A refused call never reaches the backend and is not counted as a failure
//! - Retrying is left to callers

pub mod circuit_breaker;
pub mod dedup;
pub mod registry;

pub use circuit_breaker::{CallError, CircuitBreaker, CircuitBreakerOptions, CircuitSnapshot, CircuitState, FailureRecord};
pub use dedup::{request_key, RequestDeduplicator, SharedOutcome};
pub use registry::{execute_with, CircuitBreakerRegistry};
