//! Worker runtime interface and mock implementation.
//!
//! The runtime abstracts what a worker actually is:
//! - Starting and stopping the process-local agent behind a worker
//! - Loading a behavior graph into a running agent (the graph loader)
//!
//! A mock implementation is provided for testing and development.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use magick_id::{AgentId, BootId};
use magick_reconcile::GraphHash;
use tracing::{debug, info};

use crate::store::BehaviorGraphDescriptor;

/// Handle to a running worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Boot ID (unique per boot).
    pub boot_id: BootId,

    pub agent_id: AgentId,

    /// Port the worker serves on.
    pub port: u16,
}

/// Where a graph is attached inside a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphSlot {
    Root,
    /// Position in the agent's spell list.
    Spell(usize),
}

impl std::fmt::Display for GraphSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Root => f.write_str("root"),
            Self::Spell(index) => write!(f, "spell[{index}]"),
        }
    }
}

/// Worker runtime interface.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Start the agent behind a worker.
    ///
    /// The returned future must be cancel-safe. A start that outlives the
    /// operation timeout is dropped, its port goes back to the pool and no
    /// `stop_worker` call follows, so an implementation must not leave
    /// anything running (or bound to the port) once the future is dropped
    /// before it resolves.
    async fn start_worker(&self, agent_id: &AgentId, port: u16) -> Result<WorkerHandle>;

    /// Tear a worker down.
    async fn stop_worker(&self, handle: &WorkerHandle) -> Result<()>;

    /// Parse, build and install a behavior graph into a running worker.
    async fn load_graph(
        &self,
        handle: &WorkerHandle,
        slot: GraphSlot,
        graph: &BehaviorGraphDescriptor,
    ) -> Result<()>;
}

/// Everything the mock runtime was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Started {
        agent_id: AgentId,
        port: u16,
    },
    Stopped {
        agent_id: AgentId,
        port: u16,
    },
    Loaded {
        agent_id: AgentId,
        slot: GraphSlot,
        graph: String,
        hash: GraphHash,
    },
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    /// Whether workers should "fail" to start.
    fail_starts: AtomicBool,

    /// Graph names whose loads fail.
    failing_graphs: Mutex<BTreeSet<String>>,

    /// Artificial latency per worker start, in milliseconds.
    start_delay_ms: AtomicU64,

    /// Artificial latency per graph load, in milliseconds.
    load_delay_ms: AtomicU64,

    events: Mutex<Vec<RuntimeEvent>>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            fail_starts: AtomicBool::new(false),
            failing_graphs: Mutex::new(BTreeSet::new()),
            start_delay_ms: AtomicU64::new(0),
            load_delay_ms: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing() -> Self {
        let runtime = Self::new();
        runtime.set_fail_starts(true);
        runtime
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Make loads of the named graph fail (or succeed again).
    pub fn set_graph_failing(&self, graph: &str, failing: bool) {
        if let Ok(mut graphs) = self.failing_graphs.lock() {
            if failing {
                graphs.insert(graph.to_string());
            } else {
                graphs.remove(graph);
            }
        }
    }

    /// Delay every worker start. Nothing is recorded for a start that is
    /// dropped while waiting.
    pub fn set_start_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.start_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Delay every graph load.
    pub fn set_load_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.load_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Recorded events concerning one agent.
    pub fn events_for(&self, agent_id: &AgentId) -> Vec<RuntimeEvent> {
        self.events()
            .into_iter()
            .filter(|event| match event {
                RuntimeEvent::Started { agent_id: id, .. }
                | RuntimeEvent::Stopped { agent_id: id, .. }
                | RuntimeEvent::Loaded { agent_id: id, .. } => id == agent_id,
            })
            .collect()
    }

    /// Number of graph loads recorded.
    pub fn load_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, RuntimeEvent::Loaded { .. }))
            .count()
    }

    /// Forget recorded events.
    pub fn clear_events(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn record(&self, event: RuntimeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn graph_fails(&self, graph: &str) -> bool {
        self.failing_graphs
            .lock()
            .map(|graphs| graphs.contains(graph))
            .unwrap_or(false)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerRuntime for MockRuntime {
    async fn start_worker(&self, agent_id: &AgentId, port: u16) -> Result<WorkerHandle> {
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.fail_starts.load(Ordering::SeqCst) {
            anyhow::bail!("Mock runtime configured to fail");
        }

        let boot_id = BootId::new();
        info!(agent_id = %agent_id, port, boot_id = %boot_id, "[MOCK] Starting worker");

        self.record(RuntimeEvent::Started {
            agent_id: agent_id.clone(),
            port,
        });

        Ok(WorkerHandle {
            boot_id,
            agent_id: agent_id.clone(),
            port,
        })
    }

    async fn stop_worker(&self, handle: &WorkerHandle) -> Result<()> {
        info!(
            agent_id = %handle.agent_id,
            boot_id = %handle.boot_id,
            "[MOCK] Stopping worker"
        );

        self.record(RuntimeEvent::Stopped {
            agent_id: handle.agent_id.clone(),
            port: handle.port,
        });

        Ok(())
    }

    async fn load_graph(
        &self,
        handle: &WorkerHandle,
        slot: GraphSlot,
        graph: &BehaviorGraphDescriptor,
    ) -> Result<()> {
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.graph_fails(&graph.name) {
            anyhow::bail!("Mock runtime configured to fail loading '{}'", graph.name);
        }

        debug!(
            agent_id = %handle.agent_id,
            slot = %slot,
            graph = %graph.name,
            hash = %graph.hash,
            "[MOCK] Graph loaded"
        );

        self.record(RuntimeEvent::Loaded {
            agent_id: handle.agent_id.clone(),
            slot,
            graph: graph.name.clone(),
            hash: graph.hash.clone(),
        });

        Ok(())
    }
}
