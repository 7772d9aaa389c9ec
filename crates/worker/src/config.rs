use crate::invoker::{CommandRpcInvoker, RpcCommand};
use anyhow::{Context, Result};
use keel_core::workflow::{WorkflowOrchestrator, WorkflowRegistry};
use keel_core::{InMemoryQueue, LockPolicy, RedbStateStore, WorkerConfig, WorkflowStateStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeelConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub locking: LockPolicy,

    #[serde(default)]
    pub worker: WorkerConfig,

    /// Directory holding build-time workflow metadata (`*.json`)
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,

    /// External commands backing each remote procedure, by RPC name
    #[serde(default)]
    pub rpc: HashMap<String, RpcCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

fn default_state_file() -> String {
    "state.redb".to_string()
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from("workflows")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl KeelConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // A missing file means defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            toml::from_str("").context("Failed to build default configuration")?
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the state store path
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_file)
    }

    /// Get the workflow metadata directory. Relative paths resolve
    /// against the data directory.
    pub fn workflows_path(&self) -> PathBuf {
        if self.workflows_dir.is_absolute() {
            self.workflows_dir.clone()
        } else {
            self.data_dir.join(&self.workflows_dir)
        }
    }
}

/// Everything a command needs to drive runs
pub struct AppState {
    pub orchestrator: Arc<WorkflowOrchestrator>,
    pub queue: Arc<InMemoryQueue>,
    pub store: Arc<dyn WorkflowStateStore>,
}

impl AppState {
    pub fn new(config: &KeelConfig) -> Result<Self> {
        let workflows_path = config.workflows_path();
        let registry = if workflows_path.exists() {
            WorkflowRegistry::load_dir(&workflows_path).context("Failed to load workflow metadata")?
        } else {
            tracing::warn!(
                "Workflow directory {} not found, no workflows registered",
                workflows_path.display()
            );
            WorkflowRegistry::new()
        };
        tracing::info!("Registered {} workflows", registry.workflows().len());

        let store: Arc<dyn WorkflowStateStore> = Arc::new(
            RedbStateStore::new(config.state_path()).context("Failed to open state store")?,
        );
        let queue = Arc::new(InMemoryQueue::new());
        let invoker = Arc::new(CommandRpcInvoker::new(config.rpc.clone()));

        let orchestrator = Arc::new(
            WorkflowOrchestrator::new(Arc::new(registry), store.clone(), queue.clone(), invoker)
                .with_lock_policy(config.locking.clone()),
        );

        Ok(Self {
            orchestrator,
            queue,
            store,
        })
    }
}
