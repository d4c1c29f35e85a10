//! magick-world Agent Reconciler Library
//!
//! Keeps a set of in-process agent workers synchronized with the desired
//! agent list held by an external store, and hot-reloads each worker's
//! behavior graphs ("spells") when their content hash changes.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler (timer)
//! └── Orchestrator (one tick at a time)
//!     ├── AgentStore      (desired state, graph descriptors)
//!     ├── WorkerRegistry  (id -> WorkerInstance, PortPool)
//!     └── WorkerRuntime   (start/stop workers, load graphs)
//! ```
//!
//! ## Modules
//!
//! - `orchestrator`: tick algorithm and phase state machine
//! - `reconciler`: interval loop with start/stop
//! - `registry`: typed worker map and port accounting
//! - `worker`: per-agent lifecycle and cached graph hashes
//! - `store`: store interface and in-memory implementation
//! - `runtime`: worker runtime interface and mock implementation

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use error::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, OrchestratorConfig, TickOutcome, TickPhase, TickReport};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerHandle};
pub use runtime::{GraphSlot, MockRuntime, RuntimeEvent, WorkerRuntime};
pub use store::{AgentStore, BehaviorGraphDescriptor, DesiredAgentRecord, MemoryStore};
