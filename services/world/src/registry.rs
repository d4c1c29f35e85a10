//! Worker registry: the typed id → worker map plus the port pool it draws
//! from. Both are owned by the orchestrator and mutated sequentially.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use magick_id::AgentId;
use magick_reconcile::{PortPool, PortRange};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::runtime::WorkerRuntime;
use crate::worker::WorkerInstance;

/// Live workers keyed by agent id.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: BTreeMap<AgentId, WorkerInstance>,
    pool: PortPool,
}

impl WorkerRegistry {
    /// Create an empty registry drawing ports from `ports`.
    pub fn new(ports: PortRange) -> Self {
        Self {
            workers: BTreeMap::new(),
            pool: PortPool::new(ports),
        }
    }

    /// Allocate a port, boot a worker and register it.
    ///
    /// On a boot failure the port goes straight back to the pool.
    pub async fn add_worker(
        &mut self,
        id: &AgentId,
        runtime: &dyn WorkerRuntime,
        timeout: Duration,
    ) -> Result<u16> {
        if self.workers.contains_key(id) {
            return Err(OrchestratorError::DuplicateWorker(id.clone()));
        }

        let port = self
            .pool
            .allocate()
            .map_err(|source| OrchestratorError::PoolExhausted {
                agent_id: id.clone(),
                source,
            })?;

        let mut worker = WorkerInstance::create(id.clone(), port);
        if let Err(e) = worker.boot(runtime, timeout).await {
            worker.destroy(runtime, &mut self.pool, timeout).await;
            return Err(e);
        }

        info!(agent_id = %id, port, "Added worker");
        self.workers.insert(id.clone(), worker);
        Ok(port)
    }

    /// Destroy and unregister a worker. Returns false if it was not there.
    pub async fn remove_worker(
        &mut self,
        id: &AgentId,
        runtime: &dyn WorkerRuntime,
        timeout: Duration,
    ) -> bool {
        let Some(mut worker) = self.workers.remove(id) else {
            debug!(agent_id = %id, "Remove of unknown worker ignored");
            return false;
        };

        worker.destroy(runtime, &mut self.pool, timeout).await;
        info!(agent_id = %id, port = worker.port(), "Removed worker");
        true
    }

    /// Destroy every worker.
    pub async fn clear(&mut self, runtime: &dyn WorkerRuntime, timeout: Duration) -> usize {
        let ids = self.ids();
        for id in &ids {
            self.remove_worker(id, runtime, timeout).await;
        }
        ids.len()
    }

    pub fn get(&self, id: &AgentId) -> Option<&WorkerInstance> {
        self.workers.get(id)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.workers.contains_key(id)
    }

    /// Live ids, sorted.
    pub fn ids(&self) -> Vec<AgentId> {
        self.workers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Mutable access to every worker; each item borrows a distinct worker.
    pub fn workers_mut(&mut self) -> impl Iterator<Item = &mut WorkerInstance> {
        self.workers.values_mut()
    }

    pub fn pool(&self) -> &PortPool {
        &self.pool
    }

    /// Verify that ports and workers agree.
    ///
    /// Every worker must be running, hold an allocated port no other worker
    /// holds, and the pool must have exactly one allocation per worker.
    pub fn check_invariants(&self) -> Result<()> {
        let mut ports = BTreeSet::new();

        for (id, worker) in &self.workers {
            if worker.id() != id {
                return Err(OrchestratorError::Internal(format!(
                    "worker {} registered under {id}",
                    worker.id()
                )));
            }
            if !worker.is_running() {
                return Err(OrchestratorError::Internal(format!(
                    "registered worker {id} is not running"
                )));
            }
            if !self.pool.is_allocated(worker.port()) || !ports.insert(worker.port()) {
                return Err(OrchestratorError::Internal(format!(
                    "port {} of worker {id} is not exclusively allocated",
                    worker.port()
                )));
            }
        }

        if self.pool.allocated() != self.workers.len() {
            return Err(OrchestratorError::Internal(format!(
                "{} ports allocated for {} workers",
                self.pool.allocated(),
                self.workers.len()
            )));
        }

        Ok(())
    }
}
