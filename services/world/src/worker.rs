//! Worker instances.
//!
//! A worker is the runtime counterpart of one enabled agent record. It holds
//! a port for its whole life and remembers, per graph slot, the hash it last
//! loaded successfully. Those cached hashes change only inside
//! [`WorkerInstance::load_root`] and [`WorkerInstance::load_spell`], and only
//! after the runtime reports success.

use std::time::Duration;

use magick_id::AgentId;
use magick_reconcile::{needs_reload, stale_positions, GraphHash, PortPool};
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::runtime::{GraphSlot, WorkerHandle, WorkerRuntime};
use crate::store::BehaviorGraphDescriptor;

/// Runtime state of one agent.
#[derive(Debug)]
pub struct WorkerInstance {
    id: AgentId,
    port: u16,
    handle: Option<WorkerHandle>,
    root_spell_hash: Option<GraphHash>,
    spell_hashes: Vec<Option<GraphHash>>,
    destroyed: bool,
}

impl WorkerInstance {
    /// Construct a worker around an already allocated port. Nothing runs yet.
    pub fn create(id: AgentId, port: u16) -> Self {
        Self {
            id,
            port,
            handle: None,
            root_spell_hash: None,
            spell_hashes: Vec::new(),
            destroyed: false,
        }
    }

    /// Start the agent behind this worker.
    pub async fn boot(&mut self, runtime: &dyn WorkerRuntime, timeout: Duration) -> Result<()> {
        if self.destroyed {
            return Err(OrchestratorError::Internal(format!(
                "boot of destroyed worker {}",
                self.id
            )));
        }

        // A timed-out start is dropped; the runtime owns cleanup of a
        // cancelled start (see `WorkerRuntime::start_worker`).
        let start = runtime.start_worker(&self.id, self.port);
        let started = match tokio::time::timeout(timeout, start).await {
            Ok(started) => started,
            Err(_) => {
                warn!(agent_id = %self.id, port = self.port, ?timeout, "Worker start abandoned");
                Err(anyhow::anyhow!("timed out after {timeout:?}"))
            }
        };

        match started {
            Ok(handle) => {
                info!(agent_id = %self.id, port = self.port, boot_id = %handle.boot_id, "Worker started");
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => Err(OrchestratorError::WorkerStartFailed {
                agent_id: self.id.clone(),
                message: e.to_string(),
            }),
        }
    }

    /// Tear the worker down and give its port back.
    ///
    /// Safe to call more than once and on a worker that never booted. A
    /// failing runtime teardown is logged; the port is released regardless.
    pub async fn destroy(
        &mut self,
        runtime: &dyn WorkerRuntime,
        pool: &mut PortPool,
        timeout: Duration,
    ) {
        if self.destroyed {
            return;
        }

        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(timeout, runtime.stop_worker(&handle)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(agent_id = %self.id, error = %e, "Error stopping worker"),
                Err(_) => warn!(agent_id = %self.id, ?timeout, "Timed out stopping worker"),
            }
        }

        if let Err(e) = pool.release(self.port) {
            error!(agent_id = %self.id, port = self.port, error = %e, "Port release failed");
        }

        self.root_spell_hash = None;
        self.spell_hashes.clear();
        self.destroyed = true;

        debug!(agent_id = %self.id, port = self.port, "Worker destroyed");
    }

    /// Load `graph` as the root graph if its hash differs from the cached one.
    ///
    /// Returns whether a load happened.
    pub async fn load_root(
        &mut self,
        runtime: &dyn WorkerRuntime,
        graph: &BehaviorGraphDescriptor,
        timeout: Duration,
    ) -> Result<bool> {
        if !self.needs_root_reload(&graph.hash) {
            return Ok(false);
        }

        info!(
            agent_id = %self.id,
            graph = %graph.name,
            old_hash = ?self.root_spell_hash.as_ref().map(GraphHash::as_str),
            new_hash = %graph.hash,
            "Reloading root spell"
        );

        self.load(runtime, GraphSlot::Root, graph, timeout).await?;
        self.root_spell_hash = Some(graph.hash.clone());
        Ok(true)
    }

    /// Load `graph` into spell position `index` if its hash differs.
    ///
    /// Returns whether a load happened.
    pub async fn load_spell(
        &mut self,
        runtime: &dyn WorkerRuntime,
        index: usize,
        graph: &BehaviorGraphDescriptor,
        timeout: Duration,
    ) -> Result<bool> {
        let cached = self.spell_hashes.get(index).and_then(Option::as_ref);
        if !needs_reload(cached, &graph.hash) {
            return Ok(false);
        }

        info!(
            agent_id = %self.id,
            index,
            graph = %graph.name,
            new_hash = %graph.hash,
            "Reloading spell"
        );

        self.load(runtime, GraphSlot::Spell(index), graph, timeout)
            .await?;

        if self.spell_hashes.len() <= index {
            self.spell_hashes.resize(index + 1, None);
        }
        self.spell_hashes[index] = Some(graph.hash.clone());
        Ok(true)
    }

    async fn load(
        &self,
        runtime: &dyn WorkerRuntime,
        slot: GraphSlot,
        graph: &BehaviorGraphDescriptor,
        timeout: Duration,
    ) -> Result<()> {
        let Some(handle) = &self.handle else {
            return Err(OrchestratorError::Internal(format!(
                "graph load into worker {} which is not running",
                self.id
            )));
        };

        let loaded = tokio::time::timeout(timeout, runtime.load_graph(handle, slot, graph))
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("timed out after {timeout:?}")));

        loaded.map_err(|e| OrchestratorError::GraphLoadFailed {
            agent_id: self.id.clone(),
            graph: graph.name.clone(),
            message: e.to_string(),
        })
    }

    /// Truncate or extend the spell cache to the desired list length.
    ///
    /// Extending adds empty entries, which always count as stale.
    pub fn align_spells(&mut self, len: usize) {
        self.spell_hashes.resize(len, None);
    }

    /// Positions whose fetched hash differs from the cache.
    pub fn stale_spells(&self, fetched: &[Option<GraphHash>]) -> Vec<usize> {
        stale_positions(&self.spell_hashes, fetched)
    }

    pub fn needs_root_reload(&self, hash: &GraphHash) -> bool {
        needs_reload(self.root_spell_hash.as_ref(), hash)
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn root_spell_hash(&self) -> Option<&GraphHash> {
        self.root_spell_hash.as_ref()
    }

    pub fn spell_hashes(&self) -> &[Option<GraphHash>] {
        &self.spell_hashes
    }

    /// Booted and not yet destroyed.
    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.destroyed
    }
}
