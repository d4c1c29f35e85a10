//! The orchestrator: one reconciliation tick at a time.
//!
//! A tick:
//! 1. Fetches the desired agent list from the store
//! 2. Diffs it by id against the last snapshot and the live registry
//! 3. Destroys workers that are no longer wanted
//! 4. Creates workers that are wanted but not running
//! 5. Recreates dirty workers and clears their flag in the store
//! 6. Reloads root graphs whose hash changed
//! 7. Reloads spell graphs whose hash changed, position by position
//! 8. Replaces the snapshot with the fetched list
//!
//! Steps 6 and 7 run concurrently across workers and are joined before the
//! tick ends. Any store or graph load failure aborts the tick and keeps the
//! old snapshot; the next tick retries from there.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use magick_id::{AgentId, TickId};
use magick_reconcile::{
    diff_ids, FailureTracker, GraphHash, PortRange, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_FAILURE_WINDOW, DEFAULT_OPERATION_TIMEOUT, DEFAULT_PORT_RANGE,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{OrchestratorError, Result};
use crate::registry::WorkerRegistry;
use crate::runtime::WorkerRuntime;
use crate::store::{AgentStore, BehaviorGraphDescriptor, DesiredAgentRecord};
use crate::worker::WorkerInstance;

/// Orchestrator configuration. Fixed for the orchestrator's lifetime.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ports handed to workers.
    pub ports: PortRange,

    /// Upper bound for any single store call, worker start/stop or graph load.
    pub operation_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ports: DEFAULT_PORT_RANGE,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// Where the orchestrator is within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TickPhase {
    Idle = 0,
    Fetching = 1,
    Diffing = 2,
    Reconciling = 3,
}

impl TickPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Fetching,
            2 => Self::Diffing,
            3 => Self::Reconciling,
            _ => Self::Idle,
        }
    }
}

/// Holds the phase away from `Idle` for the duration of one tick.
struct PhaseGuard<'a> {
    phase: &'a AtomicU8,
}

impl<'a> PhaseGuard<'a> {
    /// Enter `Fetching`, or `None` if a tick is already running.
    fn try_begin(phase: &'a AtomicU8) -> Option<Self> {
        phase
            .compare_exchange(
                TickPhase::Idle as u8,
                TickPhase::Fetching as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()
            .map(|_| Self { phase })
    }

    fn enter(&self, next: TickPhase) {
        self.phase.store(next as u8, Ordering::SeqCst);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(TickPhase::Idle as u8, Ordering::SeqCst);
    }
}

/// A failure recovered within a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickFailure {
    pub agent_id: Option<AgentId>,
    pub kind: &'static str,
    pub message: String,
}

impl From<&OrchestratorError> for TickFailure {
    fn from(error: &OrchestratorError) -> Self {
        let agent_id = match error {
            OrchestratorError::DuplicateWorker(id) => Some(id.clone()),
            OrchestratorError::PoolExhausted { agent_id, .. }
            | OrchestratorError::WorkerStartFailed { agent_id, .. }
            | OrchestratorError::GraphLoadFailed { agent_id, .. } => Some(agent_id.clone()),
            OrchestratorError::StoreUnavailable(_) | OrchestratorError::Internal(_) => None,
        };

        Self {
            agent_id,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick_id: TickId,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub created: Vec<AgentId>,
    pub destroyed: Vec<AgentId>,
    pub recreated: Vec<AgentId>,
    /// Graph loads performed (root and spells).
    pub reloads: usize,
    pub failures: Vec<TickFailure>,
    /// False when the tick aborted and the previous snapshot was kept.
    pub snapshot_replaced: bool,
}

impl TickReport {
    fn new(tick_id: TickId) -> Self {
        Self {
            tick_id,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            created: Vec::new(),
            destroyed: Vec::new(),
            recreated: Vec::new(),
            reloads: 0,
            failures: Vec::new(),
            snapshot_replaced: false,
        }
    }

    /// True if the tick changed nothing.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
            && self.destroyed.is_empty()
            && self.recreated.is_empty()
            && self.reloads == 0
    }

    fn record(&mut self, error: &OrchestratorError) {
        self.failures.push(TickFailure::from(error));
    }
}

/// Result of [`Orchestrator::tick`].
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// All steps ran and the snapshot was replaced.
    Completed(TickReport),
    /// A retryable failure aborted the tick.
    Failed(TickReport),
    /// Another tick was in flight.
    Skipped,
}

impl TickOutcome {
    pub fn report(&self) -> Option<&TickReport> {
        match self {
            Self::Completed(report) | Self::Failed(report) => Some(report),
            Self::Skipped => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Mutable state touched by ticks. Locked for a whole tick.
struct ReconcileState {
    registry: WorkerRegistry,
    snapshot: Vec<DesiredAgentRecord>,
    failures: FailureTracker,
}

/// Graph reload results for one worker.
#[derive(Default)]
struct WorkerReload {
    loads: usize,
    errors: Vec<OrchestratorError>,
}

/// Keeps local workers converged to the store's desired state.
pub struct Orchestrator {
    store: Arc<dyn AgentStore>,
    runtime: Arc<dyn WorkerRuntime>,
    operation_timeout: Duration,
    phase: AtomicU8,
    state: Mutex<ReconcileState>,
    last_report: RwLock<Option<TickReport>>,
}

impl Orchestrator {
    /// Create an orchestrator with an empty registry and snapshot.
    pub fn new(
        store: Arc<dyn AgentStore>,
        runtime: Arc<dyn WorkerRuntime>,
        config: OrchestratorConfig,
    ) -> Self {
        info!(
            ports = %config.ports,
            operation_timeout_secs = config.operation_timeout.as_secs(),
            "Creating orchestrator"
        );

        Self {
            store,
            runtime,
            operation_timeout: config.operation_timeout,
            phase: AtomicU8::new(TickPhase::Idle as u8),
            state: Mutex::new(ReconcileState {
                registry: WorkerRegistry::new(config.ports),
                snapshot: Vec::new(),
                failures: FailureTracker::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_FAILURE_WINDOW),
            }),
            last_report: RwLock::new(None),
        }
    }

    /// Current tick phase.
    pub fn phase(&self) -> TickPhase {
        TickPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Ids of all live workers, sorted.
    ///
    /// Waits for an in-flight tick to finish, so the result never reflects a
    /// half-applied tick.
    pub async fn list_active_worker_ids(&self) -> Vec<AgentId> {
        self.state.lock().await.registry.ids()
    }

    /// Port held by a live worker.
    pub async fn worker_port(&self, id: &AgentId) -> Option<u16> {
        self.state.lock().await.registry.get(id).map(WorkerInstance::port)
    }

    /// Cached root hash and spell hashes of a live worker.
    pub async fn worker_hashes(
        &self,
        id: &AgentId,
    ) -> Option<(Option<GraphHash>, Vec<Option<GraphHash>>)> {
        let state = self.state.lock().await;
        let worker = state.registry.get(id)?;
        Some((
            worker.root_spell_hash().cloned(),
            worker.spell_hashes().to_vec(),
        ))
    }

    /// Free ports left in the pool.
    pub async fn available_ports(&self) -> usize {
        self.state.lock().await.registry.pool().available()
    }

    /// Report of the most recent tick that was not skipped.
    pub async fn last_report(&self) -> Option<TickReport> {
        self.last_report.read().await.clone()
    }

    /// Ask the store to empty every agent's spell list.
    pub async fn reset_agent_spells(&self) -> Result<()> {
        info!("Resetting agent spells in store");
        self.bounded_store("reset_agent_spells", self.store.reset_agent_spells())
            .await
    }

    /// Destroy every worker. Waits for an in-flight tick first.
    pub async fn shutdown(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state
            .registry
            .clear(self.runtime.as_ref(), self.operation_timeout)
            .await;
        state.snapshot.clear();
        info!(removed, "Orchestrator shut down");
        removed
    }

    /// Run one reconciliation tick.
    ///
    /// Returns `Skipped` if a tick is already running. Retryable failures
    /// are reported through `Failed`; only an internal invariant violation
    /// is returned as an error.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let Some(guard) = PhaseGuard::try_begin(&self.phase) else {
            debug!("Tick already in flight, skipping");
            return Ok(TickOutcome::Skipped);
        };

        let tick_id = TickId::new();
        let span = info_span!("tick", tick_id = %tick_id);

        async move {
            let started = Instant::now();
            let mut report = TickReport::new(tick_id);
            let mut state = self.state.lock().await;

            let result = self.reconcile(&guard, &mut state, &mut report).await;
            let result = result.and_then(|()| state.registry.check_invariants());
            report.elapsed = started.elapsed();

            let outcome = match result {
                Ok(()) => {
                    state.failures.clear("tick");
                    state.failures.prune();
                    if report.is_noop() {
                        debug!(live = state.registry.len(), "Tick completed, nothing to do");
                    } else {
                        info!(
                            live = state.registry.len(),
                            created = report.created.len(),
                            destroyed = report.destroyed.len(),
                            recreated = report.recreated.len(),
                            reloads = report.reloads,
                            failures = report.failures.len(),
                            "Tick completed"
                        );
                    }
                    TickOutcome::Completed(report)
                }
                Err(e) if e.is_retryable() => {
                    report.record(&e);
                    let consecutive = state.failures.record_failure("tick");
                    if state.failures.is_escalated("tick") {
                        error!(error = %e, kind = e.kind(), consecutive, "Tick failed repeatedly");
                    } else {
                        warn!(error = %e, kind = e.kind(), consecutive, "Tick failed, will retry");
                    }
                    TickOutcome::Failed(report)
                }
                Err(e) => {
                    report.record(&e);
                    error!(error = %e, "Tick hit an unrecoverable error");
                    *self.last_report.write().await = Some(report);
                    return Err(e);
                }
            };

            drop(state);
            *self.last_report.write().await = outcome.report().cloned();
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn reconcile(
        &self,
        guard: &PhaseGuard<'_>,
        state: &mut ReconcileState,
        report: &mut TickReport,
    ) -> Result<()> {
        let timeout = self.operation_timeout;
        let runtime = self.runtime.as_ref();

        // 1. Fetch
        let desired = self
            .bounded_store("list_desired_agents", self.store.list_desired_agents())
            .await?;

        // 2. Diff
        guard.enter(TickPhase::Diffing);

        let mut desired_by_id: BTreeMap<AgentId, &DesiredAgentRecord> = BTreeMap::new();
        for record in &desired {
            if desired_by_id.insert(record.id.clone(), record).is_some() {
                warn!(agent_id = %record.id, "Duplicate agent record in desired state, keeping the last one");
            }
        }

        let wanted: BTreeSet<AgentId> = desired_by_id
            .values()
            .filter(|record| record.enabled)
            .map(|record| record.id.clone())
            .collect();

        let live: BTreeSet<AgentId> = state.registry.ids().into_iter().collect();
        let previous: BTreeSet<AgentId> = state
            .snapshot
            .iter()
            .filter(|record| record.enabled)
            .map(|record| record.id.clone())
            .chain(live.iter().cloned())
            .collect();

        let diff = diff_ids(previous, wanted.iter().cloned());
        let to_create: Vec<AgentId> = wanted.difference(&live).cloned().collect();

        debug!(
            desired = desired.len(),
            wanted = wanted.len(),
            live = live.len(),
            removed = diff.removed.len(),
            added = diff.added.len(),
            to_create = to_create.len(),
            "Diffed desired state"
        );

        // 3. Destroy
        guard.enter(TickPhase::Reconciling);

        for id in &diff.removed {
            if state.registry.remove_worker(id, runtime, timeout).await {
                state.failures.clear_owner(id.as_str());
                report.destroyed.push(id.clone());
            }
        }

        // 4. Create
        for id in &to_create {
            match state.registry.add_worker(id, runtime, timeout).await {
                Ok(_) => report.created.push(id.clone()),
                Err(e) if e.is_retryable() => {
                    warn!(agent_id = %id, error = %e, kind = e.kind(), "Worker not created, will retry");
                    report.record(&e);
                }
                Err(e) => return Err(e),
            }
        }

        // 5. Dirty resets
        for record in desired_by_id.values().filter(|record| record.dirty) {
            let id = &record.id;
            if !state.registry.contains(id) {
                continue;
            }

            if !report.created.contains(id) {
                info!(agent_id = %id, "Agent marked dirty, recreating worker");
                state.registry.remove_worker(id, runtime, timeout).await;
                if let Err(e) = state.registry.add_worker(id, runtime, timeout).await {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    warn!(agent_id = %id, error = %e, "Dirty worker not recreated, will retry");
                    report.record(&e);
                    continue;
                }
                report.recreated.push(id.clone());
            }

            match tokio::time::timeout(timeout, self.store.clear_dirty(id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(agent_id = %id, error = %e, "Failed to clear dirty flag"),
                Err(_) => warn!(agent_id = %id, ?timeout, "Timed out clearing dirty flag"),
            }
        }

        // 6 + 7. Graph reloads, concurrent across workers
        let reloads = state.registry.workers_mut().filter_map(|worker| {
            let record = desired_by_id.get(worker.id()).copied()?;
            Some(self.reload_graphs(worker, record))
        });
        let results: Vec<(AgentId, WorkerReload)> = join_all(reloads).await;

        let mut load_errors = Vec::new();
        for (id, result) in results {
            report.reloads += result.loads;
            if result.errors.is_empty() {
                state.failures.clear_owner(id.as_str());
                continue;
            }
            for e in result.errors {
                let consecutive = state.failures.record_failure(&format!("{id}/{}", e.kind()));
                if state.failures.is_escalated(&format!("{id}/{}", e.kind())) {
                    error!(agent_id = %id, error = %e, consecutive, "Graph reload failing repeatedly");
                } else {
                    warn!(agent_id = %id, error = %e, consecutive, "Graph reload failed");
                }
                load_errors.push(e);
            }
        }

        if let Some((decisive, rest)) = take_decisive(load_errors) {
            for e in &rest {
                report.record(e);
            }
            return Err(decisive);
        }

        // 8. Commit
        state.snapshot = desired;
        report.snapshot_replaced = true;
        Ok(())
    }

    /// Bring one worker's graphs up to date: root first, then spells.
    async fn reload_graphs(
        &self,
        worker: &mut WorkerInstance,
        record: &DesiredAgentRecord,
    ) -> (AgentId, WorkerReload) {
        let mut result = WorkerReload::default();
        let timeout = self.operation_timeout;
        let runtime = self.runtime.as_ref();

        if let Some(root_name) = &record.root_spell_name {
            let fetched = self
                .bounded_store("get_behavior_graph", self.store.get_behavior_graph(root_name))
                .await;

            match fetched {
                Ok(Some(graph)) => match worker.load_root(runtime, &graph, timeout).await {
                    Ok(loaded) => result.loads += usize::from(loaded),
                    Err(e) => {
                        result.errors.push(e);
                        return (record.id.clone(), result);
                    }
                },
                Ok(None) => {
                    warn!(agent_id = %record.id, graph = %root_name, "Root spell not found in store");
                }
                Err(e) => {
                    result.errors.push(e);
                    return (record.id.clone(), result);
                }
            }
        }

        worker.align_spells(record.spell_names.len());
        if record.spell_names.is_empty() {
            return (record.id.clone(), result);
        }

        let graphs = match self
            .bounded_store(
                "get_behavior_graphs",
                self.store.get_behavior_graphs(&record.spell_names),
            )
            .await
        {
            Ok(graphs) => graphs,
            Err(e) => {
                result.errors.push(e);
                return (record.id.clone(), result);
            }
        };

        let by_name: BTreeMap<&str, &BehaviorGraphDescriptor> = graphs
            .iter()
            .map(|graph| (graph.name.as_str(), graph))
            .collect();

        let aligned: Vec<Option<&BehaviorGraphDescriptor>> = record
            .spell_names
            .iter()
            .map(|name| {
                let graph = by_name.get(name.as_str()).copied();
                if graph.is_none() {
                    warn!(agent_id = %record.id, graph = %name, "Spell not found in store");
                }
                graph
            })
            .collect();

        let fetched: Vec<Option<GraphHash>> = aligned
            .iter()
            .map(|graph| graph.map(|graph| graph.hash.clone()))
            .collect();

        for index in worker.stale_spells(&fetched) {
            let Some(graph) = aligned.get(index).copied().flatten() else {
                continue;
            };
            match worker.load_spell(runtime, index, graph, timeout).await {
                Ok(loaded) => result.loads += usize::from(loaded),
                Err(e) => result.errors.push(e),
            }
        }

        (record.id.clone(), result)
    }

    /// Await a store call under the operation timeout.
    async fn bounded_store<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(OrchestratorError::store(operation, e)),
            Err(_) => Err(OrchestratorError::store_timeout(
                operation,
                self.operation_timeout,
            )),
        }
    }
}

/// Split off the error that decides a failed tick. A fatal error wins over
/// retryable ones; otherwise the first error in the list.
fn take_decisive(
    mut errors: Vec<OrchestratorError>,
) -> Option<(OrchestratorError, Vec<OrchestratorError>)> {
    if errors.is_empty() {
        return None;
    }
    let index = errors
        .iter()
        .position(|e| !e.is_retryable())
        .unwrap_or(0);
    let decisive = errors.remove(index);
    Some((decisive, errors))
}
