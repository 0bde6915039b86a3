//! Persistence collaborators used by the engine, plus an in-memory store.

use crate::model::{
    CaseId, Collection, CollectionId, Environment, EnvironmentId, LastStatus, Report, ReportId,
    RunId, RunSummary, TestCase,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Read access to cases/environments and the last-run write-back.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn collection(&self, id: CollectionId) -> Result<Option<Collection>>;

    /// Enabled cases of a collection, in execution order.
    async fn enabled_cases(&self, collection_id: CollectionId) -> Result<Vec<TestCase>>;

    async fn case(&self, id: CaseId) -> Result<Option<TestCase>>;

    async fn environment(&self, id: EnvironmentId) -> Result<Option<Environment>>;

    async fn record_last_run(&self, id: CaseId, at: DateTime<Utc>, status: LastStatus)
        -> Result<()>;
}

/// Write interface for run records and reports.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Persist a run in `running` state and return its id.
    async fn create_run(&self, run: &RunSummary) -> Result<RunId>;

    async fn finalize_run(&self, run: &RunSummary) -> Result<()>;

    async fn create_report(&self, report: &Report) -> Result<ReportId>;

    async fn attach_report(&self, run_id: RunId, report_id: ReportId) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<CollectionId, Collection>,
    cases: HashMap<CaseId, TestCase>,
    environments: HashMap<EnvironmentId, Environment>,
    runs: HashMap<RunId, RunSummary>,
    reports: HashMap<ReportId, Report>,
    next_run_id: RunId,
    next_report_id: ReportId,
}

/// Process-local store backing the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_collection(&self, collection: Collection) {
        let mut state = self.state.write().await;
        state.collections.insert(collection.id, collection);
    }

    pub async fn insert_case(&self, case: TestCase) {
        let mut state = self.state.write().await;
        state.cases.insert(case.id, case);
    }

    /// Store an environment; rejects ones over the variable cap.
    pub async fn insert_environment(&self, environment: Environment) -> Result<()> {
        environment.validate()?;
        let mut state = self.state.write().await;
        state.environments.insert(environment.id, environment);
        Ok(())
    }

    pub async fn collections(&self) -> Vec<Collection> {
        let state = self.state.read().await;
        let mut collections: Vec<Collection> = state.collections.values().cloned().collect();
        collections.sort_by_key(|c| c.id);
        collections
    }

    pub async fn run(&self, id: RunId) -> Option<RunSummary> {
        self.state.read().await.runs.get(&id).cloned()
    }

    pub async fn report(&self, id: ReportId) -> Option<Report> {
        self.state.read().await.reports.get(&id).cloned()
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn collection(&self, id: CollectionId) -> Result<Option<Collection>> {
        Ok(self.state.read().await.collections.get(&id).cloned())
    }

    async fn enabled_cases(&self, collection_id: CollectionId) -> Result<Vec<TestCase>> {
        let state = self.state.read().await;
        let mut cases: Vec<TestCase> = state
            .cases
            .values()
            .filter(|c| c.enabled && c.collection_id == Some(collection_id))
            .cloned()
            .collect();
        cases.sort_by_key(|c| (c.sort_order, c.id));
        Ok(cases)
    }

    async fn case(&self, id: CaseId) -> Result<Option<TestCase>> {
        Ok(self.state.read().await.cases.get(&id).cloned())
    }

    async fn environment(&self, id: EnvironmentId) -> Result<Option<Environment>> {
        Ok(self.state.read().await.environments.get(&id).cloned())
    }

    async fn record_last_run(
        &self,
        id: CaseId,
        at: DateTime<Utc>,
        status: LastStatus,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let case = state
            .cases
            .get_mut(&id)
            .ok_or_else(|| anyhow!("case {id} does not exist"))?;
        case.last_run_at = Some(at);
        case.last_status = status;
        Ok(())
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn create_run(&self, run: &RunSummary) -> Result<RunId> {
        let mut state = self.state.write().await;
        state.next_run_id += 1;
        let id = state.next_run_id;
        let mut stored = run.clone();
        stored.run_id = id;
        state.runs.insert(id, stored);
        debug!(run_id = id, "Created run record");
        Ok(id)
    }

    async fn finalize_run(&self, run: &RunSummary) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .runs
            .get_mut(&run.run_id)
            .ok_or_else(|| anyhow!("run {} does not exist", run.run_id))?;
        if stored.is_finalized() {
            return Err(anyhow!("run {} is already finalized", run.run_id));
        }
        *stored = run.clone();
        Ok(())
    }

    async fn create_report(&self, report: &Report) -> Result<ReportId> {
        let mut state = self.state.write().await;
        if !state.runs.contains_key(&report.run_id) {
            return Err(anyhow!("run {} does not exist", report.run_id));
        }
        state.next_report_id += 1;
        let id = state.next_report_id;
        state.reports.insert(id, report.clone());
        Ok(id)
    }

    async fn attach_report(&self, run_id: RunId, report_id: ReportId) -> Result<()> {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run {run_id} does not exist"))?;
        run.report_id = Some(report_id);
        Ok(())
    }
}
