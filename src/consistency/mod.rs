//! Local/server data consistency.
//!
//! # Data Flow
//! ```text
//! fetched server snapshot + cached local snapshot
//!     → DataConsistencyService::detect_conflicts (per-field, newest writer wins the `source` hint)
//!     → resolve_conflict (local | server | manual) → resolution history
//!     → sync_across_tabs → TopicBroadcaster topic "data_sync_{entity}"
//! ```
//!
//! Field write times and the API version mismatch log live in the durable store.

pub mod conflicts;
pub mod version;

pub use conflicts::{
    sync_topic, ConflictNotFound, ConflictResolution, DataConflict, DataConsistencyService, Resolution, Snapshot,
    Source, SyncMessage,
};
pub use version::{ApiVersion, ApiVersionManager, LoggedMismatch, VersionMismatch};
