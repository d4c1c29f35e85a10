//! Error taxonomy for the orchestrator.
//!
//! Everything except [`OrchestratorError::Internal`] is retryable: it is
//! reported, the current tick stops, and the next tick starts over from the
//! same snapshot.

use std::time::Duration;

use magick_id::AgentId;
use magick_reconcile::PortError;
use thiserror::Error;

/// Orchestrator errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Store call failed or timed out. Nothing was mutated.
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// A worker with this id is already registered.
    #[error("worker already exists: {0}")]
    DuplicateWorker(AgentId),

    /// No port left for a new worker.
    #[error("cannot create worker {agent_id}: {source}")]
    PoolExhausted {
        agent_id: AgentId,
        #[source]
        source: PortError,
    },

    /// The runtime refused to boot a worker. Its port was released.
    #[error("worker {agent_id} failed to start: {message}")]
    WorkerStartFailed { agent_id: AgentId, message: String },

    /// A behavior graph could not be loaded. The cached hash is left stale.
    #[error("failed to load graph '{graph}' into worker {agent_id}: {message}")]
    GraphLoadFailed {
        agent_id: AgentId,
        graph: String,
        message: String,
    },

    /// Registry or pool invariant violated. Not retryable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Returns false only for contract violations that must stop the loop.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }

    /// Short machine-readable kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::DuplicateWorker(_) => "duplicate_worker",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::WorkerStartFailed { .. } => "worker_start_failed",
            Self::GraphLoadFailed { .. } => "graph_load_failed",
            Self::Internal(_) => "internal",
        }
    }

    pub(crate) fn store(operation: &str, error: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(format!("{operation}: {error}"))
    }

    pub(crate) fn store_timeout(operation: &str, after: Duration) -> Self {
        Self::StoreUnavailable(format!("{operation}: timed out after {after:?}"))
    }
}

/// Result alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
