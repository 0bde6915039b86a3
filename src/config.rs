//! Engine settings and YAML workspace loading.

use crate::model::{Collection, Environment, TestCase, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::report::{EXCEPTION_PREVIEW_LIMIT, PREVIEW_LIMIT};
use crate::script::{NodeSandbox, DEFAULT_SCRIPT_TIMEOUT};
use crate::store::MemoryStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables shared by the case runner and the sandbox.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub node_binary: PathBuf,
    pub script_timeout: Duration,
    /// Cap on concurrently running sandbox processes across all runs.
    pub max_sandbox_processes: usize,
    pub default_request_timeout_secs: u64,
    pub preview_limit: usize,
    pub exception_preview_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_binary: PathBuf::from("node"),
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
            max_sandbox_processes: 4,
            default_request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            preview_limit: PREVIEW_LIMIT,
            exception_preview_limit: EXCEPTION_PREVIEW_LIMIT,
        }
    }
}

impl EngineConfig {
    pub fn sandbox(&self) -> NodeSandbox {
        NodeSandbox::new(
            self.node_binary.clone(),
            self.script_timeout,
            self.max_sandbox_processes,
        )
    }
}

/// One workspace file: environments, collections with ordered cases,
/// and standalone cases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub collections: Vec<WorkspaceCollection>,
    #[serde(default)]
    pub cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceCollection {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Listed in execution order.
    #[serde(default)]
    pub cases: Vec<TestCase>,
}

impl Workspace {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn merge(&mut self, other: Workspace) {
        self.environments.extend(other.environments);
        self.collections.extend(other.collections);
        self.cases.extend(other.cases);
    }

    /// Load everything into a fresh store. Collection cases take their
    /// collection id and their position as sort order.
    pub async fn into_store(self) -> Result<MemoryStore> {
        let store = MemoryStore::new();
        for environment in self.environments {
            let id = environment.id;
            store
                .insert_environment(environment)
                .await
                .with_context(|| format!("invalid environment {id}"))?;
        }
        for collection in self.collections {
            for (position, mut case) in collection.cases.into_iter().enumerate() {
                case.collection_id = Some(collection.id);
                case.sort_order = position as i32;
                store.insert_case(case).await;
            }
            store
                .insert_collection(Collection {
                    id: collection.id,
                    name: collection.name,
                    description: collection.description,
                })
                .await;
        }
        for case in self.cases {
            store.insert_case(case).await;
        }
        Ok(store)
    }
}

#[derive(Debug)]
pub struct WorkspaceLoader {
    pub search_paths: Vec<PathBuf>,
}

impl WorkspaceLoader {
    pub fn new() -> Self {
        Self {
            search_paths: vec![PathBuf::from("apiprobe")],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<Workspace> {
        let path = path.as_ref();
        info!("Loading workspace from {}", path.display());

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read workspace file: {}", path.display()))?;
        let workspace = Workspace::from_yaml(&content)
            .with_context(|| format!("Failed to parse YAML from {}", path.display()))?;

        debug!(
            environments = workspace.environments.len(),
            collections = workspace.collections.len(),
            cases = workspace.cases.len(),
            "Parsed workspace file"
        );
        Ok(workspace)
    }

    /// Merge every `.yaml`/`.yml` file of a directory, in file name order.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Workspace> {
        let dir = dir.as_ref();
        info!("Loading workspace files from directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_workspace_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut workspace = Workspace::default();
        for path in paths {
            match self.load_file(&path) {
                Ok(loaded) => workspace.merge(loaded),
                Err(err) => warn!("Skipping {}: {:#}", path.display(), err),
            }
        }
        Ok(workspace)
    }

    pub fn load_path<P: AsRef<Path>>(&self, path: P) -> Result<Workspace> {
        let path = path.as_ref();
        if path.is_dir() {
            self.load_dir(path)
        } else {
            self.load_file(path)
        }
    }

    /// Merge all existing search paths.
    pub fn load_all(&self) -> Result<Workspace> {
        let mut workspace = Workspace::default();
        for path in self.search_paths.iter().filter(|p| p.exists()) {
            workspace.merge(self.load_path(path)?);
        }
        Ok(workspace)
    }
}

impl Default for WorkspaceLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn is_workspace_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}
