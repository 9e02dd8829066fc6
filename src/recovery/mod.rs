//! Query recovery subsystem.
//!
//! # Data Flow
//! ```text
//! Periodic timers (coordinator.rs):
//!     health tick  → probe.rs GET {base}{path} → observe_reachability
//!     stuck tick   → reset + invalidate errored queries past the threshold
//!     stale tick   → invalidate idle queries with old data
//!
//! Platform connectivity changes:
//!     ConnectivityMonitor → observe_reachability
//!
//! observe_reachability (unreachable → reachable):
//!     wait stabilization delay (cancelled by any newer transition)
//!     → reset + invalidate + refetch errored/stale queries
//!     → invalidate all + refetch all
//!     → RecoveryEvent to subscribers
//! ```
//!
//! # Design Decisions
//! - The query cache is external and only reached through `QueryStore`
//! - A probe that gets no response trusts the platform connectivity flag
//! - Each sweep is independently switchable

pub mod coordinator;
pub mod probe;
pub mod store;

pub use coordinator::{QueryHealthReport, RecoveryCoordinator, RecoveryEvent, RecoveryTrigger};
pub use probe::{status_is_reachable, HealthProbe, ProbeError, ProbeOutcome};
pub use store::{FetchStatus, MemoryQueryStore, QueryRecord, QueryStore, StoreCall};
