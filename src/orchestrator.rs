//! Collection runs: ordered case execution, progress tracking, reports.

use crate::error::EngineError;
use crate::model::{
    CaseResult, CollectionId, EnvOverride, Environment, EnvironmentId, EnvironmentMode,
    LastStatus, ReportId, RunId, RunStatus, RunSummary, TestCase,
};
use crate::report::build_report;
use crate::runner::{resolve_environment, CaseRunner};
use crate::script::apply_environment_changes;
use crate::store::{CaseStore, ReportStore};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Live counters of one in-progress run.
#[derive(Debug)]
pub struct RunHandle {
    total: usize,
    completed: AtomicUsize,
    passed: AtomicUsize,
    failed: AtomicUsize,
    stop: AtomicBool,
}

impl RunHandle {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            passed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        }
    }

    fn record(&self, passed: bool) {
        if passed {
            self.passed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub run_id: RunId,
    pub total: usize,
    pub completed: usize,
    pub passed: usize,
    pub failed: usize,
    pub stop_requested: bool,
}

/// Runs currently executing, keyed by run id.
///
/// Entries exist from run creation until the run finishes, whether it
/// completes, is cancelled or aborts.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<RunId, Arc<RunHandle>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, Arc<RunHandle>>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, run_id: RunId, total: usize) -> Arc<RunHandle> {
        let handle = Arc::new(RunHandle::new(total));
        self.lock().insert(run_id, Arc::clone(&handle));
        handle
    }

    fn remove(&self, run_id: RunId) {
        self.lock().remove(&run_id);
    }

    pub fn progress(&self, run_id: RunId) -> Option<RunProgress> {
        self.lock().get(&run_id).map(|handle| RunProgress {
            run_id,
            total: handle.total,
            completed: handle.completed.load(Ordering::SeqCst),
            passed: handle.passed.load(Ordering::SeqCst),
            failed: handle.failed.load(Ordering::SeqCst),
            stop_requested: handle.stop_requested(),
        })
    }

    /// Ask a run to stop before its next case. Returns `false` when no
    /// such run is active.
    pub fn request_stop(&self, run_id: RunId) -> bool {
        match self.lock().get(&run_id) {
            Some(handle) => {
                handle.stop.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Removes the registry entry however the run ends.
struct Registration {
    registry: Arc<RunRegistry>,
    run_id: RunId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.run_id);
    }
}

/// What the caller gets back from a finished collection run.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionRunOutcome {
    pub run_id: RunId,
    pub report_id: ReportId,
    pub status: RunStatus,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_seconds: f64,
    pub results: Vec<CaseResult>,
}

pub struct Orchestrator<S> {
    store: Arc<S>,
    runner: Arc<CaseRunner>,
    registry: Arc<RunRegistry>,
}

impl<S> Orchestrator<S>
where
    S: CaseStore + ReportStore,
{
    pub fn new(store: Arc<S>, runner: Arc<CaseRunner>) -> Self {
        Self::with_registry(store, runner, Arc::new(RunRegistry::new()))
    }

    pub fn with_registry(
        store: Arc<S>,
        runner: Arc<CaseRunner>,
        registry: Arc<RunRegistry>,
    ) -> Self {
        Self {
            store,
            runner,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Run every enabled case of a collection in order.
    ///
    /// Case-level failures never abort the run. Only a persistence
    /// failure does, after a best-effort attempt to close the run record.
    #[instrument(skip(self))]
    pub async fn run_collection(
        &self,
        collection_id: CollectionId,
        env_override: EnvOverride,
    ) -> Result<CollectionRunOutcome, EngineError> {
        let store = self.store.as_ref();
        let collection = store
            .collection(collection_id)
            .await
            .map_err(EngineError::persistence)?
            .ok_or_else(|| EngineError::NotFound(format!("collection {collection_id}")))?;

        let cases = store
            .enabled_cases(collection_id)
            .await
            .map_err(EngineError::persistence)?;
        if cases.is_empty() {
            return Err(EngineError::Validation(format!(
                "collection {collection_id} ({}) has no enabled cases",
                collection.name
            )));
        }
        for case in &cases {
            case.validate()?;
        }

        let run_environment = match env_override {
            EnvOverride::Explicit(Some(id)) => Some(
                store
                    .environment(id)
                    .await
                    .map_err(EngineError::persistence)?
                    .ok_or_else(|| EngineError::NotFound(format!("environment {id}")))?,
            ),
            _ => None,
        };
        let mut plan = Vec::with_capacity(cases.len());
        for case in cases {
            let environment = match env_override {
                EnvOverride::Explicit(_) => run_environment.clone(),
                EnvOverride::Absent => resolve_environment(store, env_override, &case).await?,
            };
            plan.push((case, environment));
        }

        let mut summary = RunSummary {
            run_id: 0,
            collection_id,
            collection_name: collection.name.clone(),
            status: RunStatus::Running,
            environment_mode: env_override.mode(),
            environment_id: run_environment.as_ref().map(|e| e.id),
            environment_name: run_environment.as_ref().map(|e| e.name.clone()),
            total: plan.len(),
            passed: 0,
            failed: 0,
            skipped: 0,
            duration_seconds: 0.0,
            started_at: Utc::now(),
            finished_at: None,
            results: Vec::with_capacity(plan.len()),
            report_id: None,
            error_message: None,
        };
        summary.run_id = store
            .create_run(&summary)
            .await
            .map_err(EngineError::persistence)?;
        let run_id = summary.run_id;

        let handle = self.registry.register(run_id, summary.total);
        let _registration = Registration {
            registry: Arc::clone(&self.registry),
            run_id,
        };
        info!(
            run_id,
            total = summary.total,
            mode = ?summary.environment_mode,
            "Starting collection run: {}",
            collection.name
        );

        let started = Instant::now();
        let executed = self.execute_plan(&handle, &mut summary, plan).await;
        summary.duration_seconds = started.elapsed().as_secs_f64();
        summary.finished_at = Some(Utc::now());
        summary.passed = handle.passed.load(Ordering::SeqCst);
        summary.failed = handle.failed.load(Ordering::SeqCst);

        if let Err(err) = executed {
            summary.status = RunStatus::Failed;
            summary.error_message = Some(err.to_string());
            if let Err(finalize_err) = store.finalize_run(&summary).await {
                warn!(run_id, "Could not close aborted run: {finalize_err:#}");
            }
            return Err(err);
        }

        summary.status = if summary.skipped > 0 {
            RunStatus::Cancelled
        } else if summary.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        store
            .finalize_run(&summary)
            .await
            .map_err(EngineError::persistence)?;

        let report = build_report(&summary, &collection);
        let report_id = store
            .create_report(&report)
            .await
            .map_err(EngineError::persistence)?;
        store
            .attach_report(run_id, report_id)
            .await
            .map_err(EngineError::persistence)?;

        info!(
            run_id,
            report_id,
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Collection run finished in {:.2} s",
            summary.duration_seconds
        );

        Ok(CollectionRunOutcome {
            run_id,
            report_id,
            status: summary.status,
            total: summary.total,
            passed: summary.passed,
            failed: summary.failed,
            skipped: summary.skipped,
            duration_seconds: summary.duration_seconds,
            results: summary.results,
        })
    }

    async fn execute_plan(
        &self,
        handle: &RunHandle,
        summary: &mut RunSummary,
        plan: Vec<(TestCase, Option<Environment>)>,
    ) -> Result<(), EngineError> {
        let total = plan.len();
        // Variables carried between cases, one snapshot per effective environment.
        let mut overlays: HashMap<Option<EnvironmentId>, HashMap<String, Value>> = HashMap::new();

        for (index, (case, environment)) in plan.into_iter().enumerate() {
            if handle.stop_requested() {
                summary.skipped = total - index;
                info!(
                    run_id = summary.run_id,
                    skipped = summary.skipped,
                    "Stop requested, skipping remaining cases"
                );
                break;
            }
            info!("Running case {}/{}: {}", index + 1, total, case.name);

            let overlay = overlays
                .entry(environment.as_ref().map(|e| e.id))
                .or_insert_with(|| {
                    environment
                        .as_ref()
                        .map(|e| e.variables.clone())
                        .unwrap_or_default()
                });
            let outcome = self
                .runner
                .execute(&case, environment.as_ref(), overlay.clone())
                .await;
            apply_environment_changes(overlay, &outcome.environment_changes);

            let passed = outcome.result.passed;
            self.store
                .record_last_run(case.id, Utc::now(), LastStatus::from_passed(passed))
                .await
                .map_err(EngineError::persistence)?;
            handle.record(passed);
            summary.results.push(outcome.result);
        }
        Ok(())
    }
}
