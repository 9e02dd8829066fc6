//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build ResilienceLayer → Spawn background tasks
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Broadcast shutdown → Tasks leave their loops → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then services, then listeners
//! - Every long-running task owns a shutdown receiver

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{wait_for_signal, ShutdownSignal};
pub use startup::{GuardedDeduplicator, ResilienceLayer, Served, StartupError};
