//! Desired-state store interface and in-memory implementation.
//!
//! The store is the single source of truth for which agents should run and
//! which behavior graphs they carry. How it persists and queries that data is
//! not the reconciler's concern; it only needs:
//! - The full list of desired agents
//! - Behavior graph descriptors (already hashed) by name
//! - A way to acknowledge a forced reset by clearing `dirty`

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use magick_id::AgentId;
use magick_reconcile::GraphHash;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One agent as the store wants it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredAgentRecord {
    /// Stable identity, also used as the worker id.
    pub id: AgentId,

    /// Only enabled agents get a worker.
    pub enabled: bool,

    /// Forces a full worker reset on the next tick.
    #[serde(default)]
    pub dirty: bool,

    /// Graph loaded first into the worker.
    #[serde(default)]
    pub root_spell_name: Option<String>,

    /// Additional graphs, in load order.
    #[serde(default)]
    pub spell_names: Vec<String>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl DesiredAgentRecord {
    /// An enabled, clean record with no graphs.
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            enabled: true,
            dirty: false,
            root_spell_name: None,
            spell_names: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_root_spell(mut self, name: impl Into<String>) -> Self {
        self.root_spell_name = Some(name.into());
        self
    }

    pub fn with_spells<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spell_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_dirty(mut self, dirty: bool) -> Self {
        self.dirty = dirty;
        self
    }
}

/// A loadable behavior graph, hashed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorGraphDescriptor {
    pub name: String,
    pub hash: GraphHash,
    /// Opaque payload handed to the loader.
    pub definition: serde_json::Value,
}

impl BehaviorGraphDescriptor {
    /// Build a descriptor, hashing the definition.
    pub fn from_definition(name: impl Into<String>, definition: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            hash: GraphHash::from_definition(&definition),
            definition,
        }
    }
}

/// Desired-state store interface.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Every agent record, enabled or not.
    async fn list_desired_agents(&self) -> Result<Vec<DesiredAgentRecord>>;

    /// Acknowledge a forced reset.
    async fn clear_dirty(&self, id: &AgentId) -> Result<()>;

    /// Look up one graph by name.
    async fn get_behavior_graph(&self, name: &str) -> Result<Option<BehaviorGraphDescriptor>>;

    /// Look up several graphs at once. Unknown names are left out; callers
    /// match results back by name, not by position.
    async fn get_behavior_graphs(&self, names: &[String]) -> Result<Vec<BehaviorGraphDescriptor>>;

    /// Empty every agent's spell list.
    async fn reset_agent_spells(&self) -> Result<()>;
}

/// Seed data for [`MemoryStore`].
#[derive(Debug, Default, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub agents: Vec<DesiredAgentRecord>,
    #[serde(default)]
    pub graphs: Vec<GraphSeed>,
}

/// A graph entry in a seed file. The hash is computed when absent.
#[derive(Debug, Deserialize)]
pub struct GraphSeed {
    pub name: String,
    pub definition: serde_json::Value,
    #[serde(default)]
    pub hash: Option<GraphHash>,
}

/// In-process store for development and testing.
pub struct MemoryStore {
    agents: RwLock<BTreeMap<AgentId, DesiredAgentRecord>>,
    graphs: RwLock<BTreeMap<String, BehaviorGraphDescriptor>>,

    /// When set, every call fails.
    unavailable: AtomicBool,

    /// When set, only `clear_dirty` fails.
    clear_dirty_failing: AtomicBool,

    /// Artificial latency for `list_desired_agents`, in milliseconds.
    list_delay_ms: AtomicU64,

    list_calls: AtomicU64,
    cleared: Mutex<Vec<AgentId>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            graphs: RwLock::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
            clear_dirty_failing: AtomicBool::new(false),
            list_delay_ms: AtomicU64::new(0),
            list_calls: AtomicU64::new(0),
            cleared: Mutex::new(Vec::new()),
        }
    }

    /// Create a store pre-populated from seed data.
    pub fn from_seed(seed: StoreSeed) -> Self {
        let agents = seed
            .agents
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let graphs = seed
            .graphs
            .into_iter()
            .map(|graph| {
                let hash = graph
                    .hash
                    .unwrap_or_else(|| GraphHash::from_definition(&graph.definition));
                let descriptor = BehaviorGraphDescriptor {
                    name: graph.name.clone(),
                    hash,
                    definition: graph.definition,
                };
                (graph.name, descriptor)
            })
            .collect();

        Self {
            agents: RwLock::new(agents),
            graphs: RwLock::new(graphs),
            ..Self::new()
        }
    }

    /// Load seed data from a JSON file.
    pub fn from_seed_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let seed: StoreSeed = serde_json::from_str(&raw)
            .with_context(|| format!("parsing seed file {}", path.display()))?;

        info!(
            path = %path.display(),
            agents = seed.agents.len(),
            graphs = seed.graphs.len(),
            "Loaded store seed"
        );

        Ok(Self::from_seed(seed))
    }

    /// Insert or replace an agent record.
    pub async fn upsert_agent(&self, mut record: DesiredAgentRecord) {
        record.updated_at = Utc::now();
        self.agents.write().await.insert(record.id.clone(), record);
    }

    /// Delete an agent record.
    pub async fn remove_agent(&self, id: &AgentId) -> Option<DesiredAgentRecord> {
        self.agents.write().await.remove(id)
    }

    /// Current record for an agent.
    pub async fn agent(&self, id: &AgentId) -> Option<DesiredAgentRecord> {
        self.agents.read().await.get(id).cloned()
    }

    /// Store a graph definition under a name and return its new hash.
    pub async fn put_graph(&self, name: &str, definition: serde_json::Value) -> GraphHash {
        let descriptor = BehaviorGraphDescriptor::from_definition(name, definition);
        let hash = descriptor.hash.clone();
        self.graphs.write().await.insert(name.to_string(), descriptor);
        hash
    }

    /// Store a graph with an explicit hash.
    pub async fn put_graph_with_hash(&self, name: &str, hash: GraphHash) {
        let descriptor = BehaviorGraphDescriptor {
            name: name.to_string(),
            hash,
            definition: serde_json::json!({ "name": name }),
        };
        self.graphs.write().await.insert(name.to_string(), descriptor);
    }

    /// Make every call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `clear_dirty` fail while every other call keeps working.
    pub fn set_clear_dirty_failing(&self, failing: bool) {
        self.clear_dirty_failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every `list_desired_agents` call.
    pub fn set_list_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.list_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of `list_desired_agents` calls served so far.
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Every id whose dirty flag was cleared, in call order.
    pub fn cleared_dirty(&self) -> Vec<AgentId> {
        self.cleared
            .lock()
            .map(|cleared| cleared.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("memory store marked unavailable");
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn list_desired_agents(&self) -> Result<Vec<DesiredAgentRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.check_available()?;
        Ok(self.agents.read().await.values().cloned().collect())
    }

    async fn clear_dirty(&self, id: &AgentId) -> Result<()> {
        self.check_available()?;
        if self.clear_dirty_failing.load(Ordering::SeqCst) {
            anyhow::bail!("clear_dirty rejected for {id}");
        }

        if let Ok(mut cleared) = self.cleared.lock() {
            cleared.push(id.clone());
        }

        if let Some(record) = self.agents.write().await.get_mut(id) {
            record.dirty = false;
            record.updated_at = Utc::now();
        }

        debug!(agent_id = %id, "Cleared dirty flag");
        Ok(())
    }

    async fn get_behavior_graph(&self, name: &str) -> Result<Option<BehaviorGraphDescriptor>> {
        self.check_available()?;
        Ok(self.graphs.read().await.get(name).cloned())
    }

    async fn get_behavior_graphs(&self, names: &[String]) -> Result<Vec<BehaviorGraphDescriptor>> {
        self.check_available()?;
        let graphs = self.graphs.read().await;
        Ok(names
            .iter()
            .filter_map(|name| graphs.get(name).cloned())
            .collect())
    }

    async fn reset_agent_spells(&self) -> Result<()> {
        self.check_available()?;
        let now = Utc::now();
        for record in self.agents.write().await.values_mut() {
            record.spell_names.clear();
            record.updated_at = now;
        }
        Ok(())
    }
}
