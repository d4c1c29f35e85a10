//! Reconciliation loop primitives.
//!
//! This library provides the pure building blocks of the agent world
//! reconciler, which converges a set of local workers to a desired-state list
//! held by an external store. Key concepts:
//!
//! - **Desired state**: the agents that should be running (from the store).
//! - **Snapshot**: the desired state processed by the previous tick.
//! - **Content hash**: opaque fingerprint of a behavior graph; a worker reloads
//!   a graph only when the fetched hash differs from the one it last loaded.
//!
//! # Invariants
//!
//! - Diffing is by identity only, never by deep value equality
//! - Hash comparison is positional and explicit, never whole-structure
//! - A port is handed out to at most one holder at a time

mod diff;
mod failures;
mod hash;
mod ports;

use std::time::Duration;

pub use diff::{diff_ids, needs_reload, stale_positions, IdDiff};
pub use failures::FailureTracker;
pub use hash::GraphHash;
pub use ports::{PortError, PortPool, PortRange};

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(3);

/// Default bound on a single store call or graph load.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default worker port range (inclusive).
pub const DEFAULT_PORT_RANGE: PortRange = PortRange::new(10001, 10100);

/// Consecutive failures tolerated before log escalation.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default failure tracking window.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
