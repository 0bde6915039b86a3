use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use apiprobe::http_client::{HttpExecutor, PreparedRequest, ReqwestExecutor, TransportError};
use apiprobe::script::{NodeSandbox, ScriptContext, ScriptExecutor, ScriptPhase};
use apiprobe::store::{CaseStore, MemoryStore, ReportStore};
use apiprobe::{
    CaseRunner, Collection, EngineConfig, EngineError, EnvOverride, Environment,
    EnvironmentMode, HttpMethod, LastStatus, Orchestrator, Report, ReportId, ResponseSnapshot, RunId,
    RunRegistry, RunStatus, RunSummary, ScriptResult, TestCase, Workspace,
};
use async_trait::async_trait;
use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route(
                "/users",
                get(|| async move { Json(json!([{"id": 1, "name": "ada"}])) }).post(
                    |Json(body): Json<Value>| async move {
                        (
                            StatusCode::CREATED,
                            Json(json!({"id": 7, "name": body["name"]})),
                        )
                    },
                ),
            )
            .route(
                "/users/:id",
                get(|Path(id): Path<u64>| async move { Json(json!({"id": id})) }),
            )
            .route(
                "/status/:code",
                get(|Path(code): Path<u16>| async move {
                    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
                }),
            )
            .route(
                "/echo-headers",
                get(|headers: HeaderMap| async move {
                    let map: HashMap<String, String> = headers
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                        .collect();
                    Json(json!(map))
                }),
            );

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn load_workspace(base_url: &str) -> MemoryStore {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let path = manifest_dir.join("tests/fixtures/workspace.yaml");
    let content = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {path:?}: {e}"));
    let content = content.replace("__BASE_URL__", base_url);
    Workspace::from_yaml(&content)
        .unwrap_or_else(|e| panic!("failed to parse workspace yaml: {e}"))
        .into_store()
        .await
        .expect("workspace should load")
}

fn node_available() -> bool {
    std::process::Command::new("node")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success())
}

fn case(id: u64, url: &str) -> TestCase {
    serde_yaml::from_str(&format!("id: {id}\nname: case {id}\nurl: \"{url}\"\n")).unwrap()
}

fn environment(id: u64, name: &str, vars: &[(&str, Value)]) -> Environment {
    Environment {
        id,
        name: name.to_string(),
        base_url: None,
        base_headers: HashMap::new(),
        variables: vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    }
}

async fn collection_store(cases: Vec<TestCase>) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store
        .insert_collection(Collection {
            id: 1,
            name: "checkout".to_string(),
            description: None,
        })
        .await;
    for (position, mut case) in cases.into_iter().enumerate() {
        case.collection_id = Some(1);
        case.sort_order = position as i32;
        store.insert_case(case).await;
    }
    Arc::new(store)
}

/// Answers 200 to everything and counts calls.
#[derive(Default)]
struct CountingHttp {
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
    on_call: Option<Box<dyn Fn() + Send + Sync>>,
}

#[async_trait]
impl HttpExecutor for CountingHttp {
    async fn execute(
        &self,
        request: &PreparedRequest,
    ) -> Result<ResponseSnapshot, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(request.url.clone());
        if let Some(on_call) = &self.on_call {
            on_call();
        }
        Ok(ResponseSnapshot {
            status: 200,
            headers: HashMap::new(),
            body: json!({}),
            elapsed_ms: 1,
            size_bytes: 2,
            size: "2 B".to_string(),
        })
    }
}

type Responder = dyn Fn(ScriptPhase, &str) -> ScriptResult + Send + Sync;

/// Script executor driven by the script source text.
struct ScriptedSandbox {
    respond: Box<Responder>,
}

impl ScriptedSandbox {
    fn new(respond: impl Fn(ScriptPhase, &str) -> ScriptResult + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
        }
    }
}

#[async_trait]
impl ScriptExecutor for ScriptedSandbox {
    async fn execute(
        &self,
        phase: ScriptPhase,
        source: &str,
        _context: &ScriptContext,
    ) -> ScriptResult {
        (self.respond)(phase, source)
    }
}

fn passing_scripts() -> Arc<ScriptedSandbox> {
    Arc::new(ScriptedSandbox::new(|_, _| ScriptResult::empty_success(1)))
}

fn live_runner(scripts: Arc<dyn ScriptExecutor>) -> Arc<CaseRunner> {
    let http = Arc::new(ReqwestExecutor::new().expect("client should build"));
    Arc::new(CaseRunner::new(http, scripts, EngineConfig::default()))
}

fn node_runner(timeout: Duration) -> Arc<CaseRunner> {
    let config = EngineConfig {
        script_timeout: timeout,
        ..EngineConfig::default()
    };
    Arc::new(CaseRunner::from_config(config).expect("runner should build"))
}

#[tokio::test]
async fn substitutes_variables_and_environment_headers() {
    let server = TestServer::spawn().await;
    let store = load_workspace(&server.base_url).await;
    let mut echo = case(300, "/echo-headers");
    echo.environment_id = Some(1);
    echo.headers = [("X-User".to_string(), "{{user}}".to_string())].into();
    store.insert_case(echo).await;

    let runner = live_runner(passing_scripts());
    let result = runner
        .run_case(&store, 300, EnvOverride::Absent)
        .await
        .expect("case should run");

    assert!(result.passed, "case should pass: {:?}", result.error);
    assert_eq!(result.url, format!("{}/echo-headers", server.base_url));
    let echoed = &result.response.as_ref().unwrap().body;
    assert_eq!(echoed["authorization"], json!("Bearer secret-token"));
    assert_eq!(echoed["x-user"], json!("ada"));
    assert_eq!(result.environment_name.as_deref(), Some("local"));

    server.shutdown().await;
}

#[tokio::test]
async fn unresolved_placeholders_are_left_in_place() {
    let server = TestServer::spawn().await;
    let store = MemoryStore::new();
    store
        .insert_case(case(1, &format!("{}/users/{{{{missing}}}}", server.base_url)))
        .await;

    let runner = live_runner(passing_scripts());
    let result = runner
        .run_case(&store, 1, EnvOverride::Absent)
        .await
        .expect("case should run");

    assert!(result.url.ends_with("/users/{{missing}}"));
    assert!(!result.passed);

    server.shutdown().await;
}

#[tokio::test]
async fn scriptless_cases_pass_only_below_400() {
    let server = TestServer::spawn().await;
    let runner = live_runner(passing_scripts());
    let store = MemoryStore::new();

    for (id, code) in [200u16, 201, 204, 400, 404, 418, 500, 503].into_iter().enumerate() {
        let id = id as u64 + 1;
        store
            .insert_case(case(id, &format!("{}/status/{code}", server.base_url)))
            .await;
        let result = runner
            .run_case(&store, id, EnvOverride::Absent)
            .await
            .expect("case should run");
        assert_eq!(result.status_code, Some(code));
        assert_eq!(result.passed, code < 400, "status {code}");
        assert_eq!(result.error.is_some(), code >= 400, "status {code}");

        let stored = store.case(id).await.unwrap().unwrap();
        assert_eq!(stored.last_status, LastStatus::from_passed(code < 400));
    }

    server.shutdown().await;
}

#[tokio::test]
async fn failed_pre_script_never_reaches_the_network() {
    let mut guarded = case(1, "http://h/orders");
    guarded.pre_script = Some("fail".to_string());
    let mut plain = case(2, "http://h/health");
    plain.pre_script = Some("ok".to_string());
    let store = collection_store(vec![guarded, plain]).await;

    let http = Arc::new(CountingHttp::default());
    let scripts = Arc::new(ScriptedSandbox::new(|_, source| {
        if source == "fail" {
            ScriptResult::failed("signing key missing", 1)
        } else {
            ScriptResult::empty_success(1)
        }
    }));
    let runner = Arc::new(CaseRunner::new(
        http.clone(),
        scripts,
        EngineConfig::default(),
    ));
    let orchestrator = Orchestrator::new(store.clone(), runner);

    let outcome = orchestrator
        .run_collection(1, EnvOverride::Absent)
        .await
        .expect("run should complete");

    assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*http.urls.lock().unwrap(), vec!["http://h/health".to_string()]);
    let first = &outcome.results[0];
    assert!(!first.passed);
    assert_eq!(first.status_code, None);
    assert_eq!(
        first.error.as_deref(),
        Some("pre-script failed: signing key missing")
    );
    assert!(outcome.results[1].passed);
    assert_eq!(outcome.status, RunStatus::Failed);
}

#[tokio::test]
async fn transport_failure_does_not_stop_the_batch() {
    let server = TestServer::spawn().await;
    let store = Arc::new(load_workspace(&server.base_url).await);
    let orchestrator = Orchestrator::new(store.clone(), live_runner(passing_scripts()));

    let outcome = orchestrator
        .run_collection(10, EnvOverride::Absent)
        .await
        .expect("run should complete");

    assert_eq!(outcome.total, 3);
    assert_eq!(outcome.results.len(), 3);
    assert_eq!(outcome.passed + outcome.failed, 3);
    assert_eq!((outcome.passed, outcome.failed), (1, 2));
    assert_eq!(outcome.skipped, 0);
    assert_eq!(outcome.status, RunStatus::Failed);

    let ids: Vec<u64> = outcome.results.iter().map(|r| r.case_id).collect();
    assert_eq!(ids, vec![101, 102, 103]);

    let unreachable = &outcome.results[1];
    assert_eq!(unreachable.status_code, None);
    assert!(unreachable.error.is_some());
    assert_eq!(unreachable.attachments[0].name, "exception");
    assert_eq!(outcome.results[2].error.as_deref(), Some("HTTP 500"));

    let run = store.run(outcome.run_id).await.expect("run is stored");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.report_id, Some(outcome.report_id));
    assert!(run.finished_at.is_some());
    assert_eq!(run.environment_mode, EnvironmentMode::Individual);

    let report = store.report(outcome.report_id).await.expect("report is stored");
    assert_eq!(report.title, "smoke - API test report");
    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.success_rate, 33.33);
    assert_eq!(report.summary.environment, "mixed");
    assert_eq!(report.results.len(), 3);

    server.shutdown().await;
}

#[tokio::test]
async fn collection_without_enabled_cases_is_rejected() {
    let store = Arc::new(load_workspace("http://unused").await);
    let orchestrator = Orchestrator::new(store.clone(), live_runner(passing_scripts()));

    let err = orchestrator
        .run_collection(20, EnvOverride::Absent)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(store.run(1).await.is_none());

    let err = orchestrator
        .run_collection(99, EnvOverride::Absent)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn unified_mode_overrides_every_case_environment() {
    let mut first = case(1, "http://h/{{tenant}}/a");
    first.environment_id = Some(1);
    let mut second = case(2, "http://h/{{tenant}}/b");
    second.environment_id = Some(2);
    let store = collection_store(vec![first, second]).await;
    for env in [
        environment(1, "alpha", &[("tenant", json!("a"))]),
        environment(2, "beta", &[("tenant", json!("b"))]),
        environment(3, "gamma", &[("tenant", json!("g"))]),
    ] {
        store.insert_environment(env).await.unwrap();
    }

    let http = Arc::new(CountingHttp::default());
    let runner = Arc::new(CaseRunner::new(
        http.clone(),
        passing_scripts(),
        EngineConfig::default(),
    ));
    let orchestrator = Orchestrator::new(store.clone(), runner);

    let unified = orchestrator
        .run_collection(1, EnvOverride::Explicit(Some(3)))
        .await
        .unwrap();
    for result in &unified.results {
        assert_eq!(result.environment_id, Some(3));
        assert_eq!(result.environment_name.as_deref(), Some("gamma"));
        assert!(result.url.starts_with("http://h/g/"));
    }
    let run = store.run(unified.run_id).await.unwrap();
    assert_eq!(run.environment_mode, EnvironmentMode::Unified);
    assert_eq!(run.environment_name.as_deref(), Some("gamma"));

    let individual = orchestrator
        .run_collection(1, EnvOverride::Absent)
        .await
        .unwrap();
    let envs: Vec<Option<u64>> = individual.results.iter().map(|r| r.environment_id).collect();
    assert_eq!(envs, vec![Some(1), Some(2)]);

    let bare = orchestrator
        .run_collection(1, EnvOverride::Explicit(None))
        .await
        .unwrap();
    for result in &bare.results {
        assert_eq!(result.environment_id, None);
        assert!(result.url.contains("{{tenant}}"));
    }
    let report = store.report(bare.report_id).await.unwrap();
    assert_eq!(report.summary.environment, "none");
    assert_eq!(report.environment.mode, EnvironmentMode::Unified);

    let err = orchestrator
        .run_collection(1, EnvOverride::Explicit(Some(42)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn environment_changes_flow_to_later_cases() {
    let mut login = case(1, "http://h/login");
    login.environment_id = Some(1);
    login.post_script = Some("save token".to_string());
    let mut profile = case(2, "http://h/profile/{{session}}");
    profile.environment_id = Some(1);
    let mut elsewhere = case(3, "http://h/other/{{session}}");
    elsewhere.environment_id = Some(2);
    let store = collection_store(vec![login, profile, elsewhere]).await;
    store
        .insert_environment(environment(1, "alpha", &[]))
        .await
        .unwrap();
    store
        .insert_environment(environment(2, "beta", &[]))
        .await
        .unwrap();

    let scripts = Arc::new(ScriptedSandbox::new(|_, source| {
        let mut result = ScriptResult::empty_success(1);
        if source == "save token" {
            result
                .environment_changes
                .insert("session".to_string(), json!("s-123"));
        }
        result
    }));
    let http = Arc::new(CountingHttp::default());
    let runner = Arc::new(CaseRunner::new(
        http.clone(),
        scripts,
        EngineConfig::default(),
    ));
    let orchestrator = Orchestrator::new(store.clone(), runner);

    let outcome = orchestrator
        .run_collection(1, EnvOverride::Absent)
        .await
        .unwrap();
    assert_eq!(outcome.results[1].url, "http://h/profile/s-123");
    assert_eq!(outcome.results[2].url, "http://h/other/{{session}}");

    let stored = store.environment(1).await.unwrap().unwrap();
    assert!(stored.variables.is_empty());
}

#[tokio::test]
async fn stop_request_skips_remaining_cases() {
    let store = collection_store(vec![
        case(1, "http://h/1"),
        case(2, "http://h/2"),
        case(3, "http://h/3"),
    ])
    .await;
    let registry = Arc::new(RunRegistry::new());
    let watcher = Arc::clone(&registry);
    let http = Arc::new(CountingHttp {
        on_call: Some(Box::new(move || {
            for run_id in watcher.active_runs() {
                let progress = watcher.progress(run_id).unwrap();
                assert_eq!(progress.total, 3);
                assert_eq!(progress.completed, 0);
                watcher.request_stop(run_id);
            }
        })),
        ..CountingHttp::default()
    });
    let runner = Arc::new(CaseRunner::new(
        http.clone(),
        passing_scripts(),
        EngineConfig::default(),
    ));
    let orchestrator = Orchestrator::with_registry(store.clone(), runner, Arc::clone(&registry));

    let outcome = orchestrator
        .run_collection(1, EnvOverride::Absent)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.skipped, 2);
    assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    assert!(registry.active_runs().is_empty());

    let run = store.run(outcome.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    let report = store.report(outcome.report_id).await.unwrap();
    assert_eq!(report.summary.skipped, 2);

    let untouched = store.case(3).await.unwrap().unwrap();
    assert_eq!(untouched.last_status, LastStatus::Pending);
}

/// Delegates to a memory store but cannot record case results.
struct ReadOnlyStore {
    inner: MemoryStore,
}

#[async_trait]
impl CaseStore for ReadOnlyStore {
    async fn collection(&self, id: u64) -> anyhow::Result<Option<Collection>> {
        self.inner.collection(id).await
    }

    async fn enabled_cases(&self, collection_id: u64) -> anyhow::Result<Vec<TestCase>> {
        self.inner.enabled_cases(collection_id).await
    }

    async fn case(&self, id: u64) -> anyhow::Result<Option<TestCase>> {
        self.inner.case(id).await
    }

    async fn environment(&self, id: u64) -> anyhow::Result<Option<Environment>> {
        self.inner.environment(id).await
    }

    async fn record_last_run(
        &self,
        _id: u64,
        _at: DateTime<Utc>,
        _status: LastStatus,
    ) -> anyhow::Result<()> {
        Err(anyhow!("database is read-only"))
    }
}

#[async_trait]
impl ReportStore for ReadOnlyStore {
    async fn create_run(&self, run: &RunSummary) -> anyhow::Result<RunId> {
        self.inner.create_run(run).await
    }

    async fn finalize_run(&self, run: &RunSummary) -> anyhow::Result<()> {
        self.inner.finalize_run(run).await
    }

    async fn create_report(&self, report: &Report) -> anyhow::Result<ReportId> {
        self.inner.create_report(report).await
    }

    async fn attach_report(&self, run_id: RunId, report_id: ReportId) -> anyhow::Result<()> {
        self.inner.attach_report(run_id, report_id).await
    }
}

#[tokio::test]
async fn persistence_failure_aborts_the_run() {
    let inner = MemoryStore::new();
    inner
        .insert_collection(Collection {
            id: 1,
            name: "checkout".to_string(),
            description: None,
        })
        .await;
    for id in 1..=2 {
        let mut c = case(id, "http://h/x");
        c.collection_id = Some(1);
        inner.insert_case(c).await;
    }
    let store = Arc::new(ReadOnlyStore { inner });
    let http = Arc::new(CountingHttp::default());
    let runner = Arc::new(CaseRunner::new(
        http.clone(),
        passing_scripts(),
        EngineConfig::default(),
    ));
    let orchestrator = Orchestrator::new(store.clone(), runner);

    let err = orchestrator
        .run_collection(1, EnvOverride::Absent)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    assert!(orchestrator.registry().active_runs().is_empty());

    let run = store.inner.run(1).await.expect("run record exists");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run
        .error_message
        .as_deref()
        .unwrap()
        .contains("database is read-only"));
    assert!(run.report_id.is_none());
}

#[tokio::test]
async fn concurrent_runs_are_isolated() {
    let store = collection_store(vec![case(1, "http://h/{{n}}")]).await;
    store
        .insert_collection(Collection {
            id: 2,
            name: "second".to_string(),
            description: None,
        })
        .await;
    let mut other = case(2, "http://h/{{n}}");
    other.collection_id = Some(2);
    store.insert_case(other).await;
    store
        .insert_environment(environment(1, "one", &[("n", json!(1))]))
        .await
        .unwrap();
    store
        .insert_environment(environment(2, "two", &[("n", json!(2))]))
        .await
        .unwrap();

    let runner = Arc::new(CaseRunner::new(
        Arc::new(CountingHttp::default()),
        passing_scripts(),
        EngineConfig::default(),
    ));
    let orchestrator = Orchestrator::new(store.clone(), runner);

    let (a, b) = tokio::join!(
        orchestrator.run_collection(1, EnvOverride::Explicit(Some(1))),
        orchestrator.run_collection(2, EnvOverride::Explicit(Some(2))),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.run_id, b.run_id);
    assert_eq!(a.results[0].url, "http://h/1");
    assert_eq!(b.results[0].url, "http://h/2");
}

#[tokio::test]
async fn post_script_assertion_decides_over_status() {
    if !node_available() {
        eprintln!("node not available, skipping");
        return;
    }
    let server = TestServer::spawn().await;
    let store = MemoryStore::new();
    let mut created = case(1, &format!("{}/users", server.base_url));
    created.post_script = Some(
        "pm.test('status is 201', () => pm.expect(pm.response.code).to.eql(201));".to_string(),
    );
    store.insert_case(created).await;

    let runner = node_runner(Duration::from_secs(10));
    let result = runner
        .run_case(&store, 1, EnvOverride::Absent)
        .await
        .unwrap();

    assert_eq!(result.status_code, Some(200));
    assert!(!result.passed);
    assert!(result.error.is_none());
    let post = result.script_execution.post_script.as_ref().unwrap();
    assert!(post.executed);
    assert!(!post.passed);
    assert_eq!(post.assertions.len(), 1);
    assert!(!post.assertions[0].passed);
    assert_eq!(post.assertions[0].name, "status is 201");

    server.shutdown().await;
}

#[tokio::test]
async fn scripts_chain_variables_through_a_live_run() {
    if !node_available() {
        eprintln!("node not available, skipping");
        return;
    }
    let server = TestServer::spawn().await;

    let mut create = case(1, "/users");
    create.method = HttpMethod::Post;
    create.environment_id = Some(1);
    create.body = Some(json!({"name": "{{name}}"}));
    create.pre_script = Some("pm.environment.set('name', 'neo');".to_string());
    create.post_script = Some(
        "pm.test('echoes name', () => pm.expect(pm.response.json()).to.have.property('name', 'neo'));\n\
         pm.environment.set('user_id', pm.response.json().id);"
            .to_string(),
    );
    let mut fetch = case(2, "/users/{{user_id}}");
    fetch.environment_id = Some(1);
    fetch.post_script = Some(
        "pm.test('found', () => { pm.expect(pm.response.code).to.be.below(300); \
         pm.expect(pm.response.json().id).to.eql(7); });"
            .to_string(),
    );

    let store = collection_store(vec![create, fetch]).await;
    let mut env = environment(1, "local", &[]);
    env.base_url = Some(server.base_url.clone());
    store.insert_environment(env).await.unwrap();

    let orchestrator = Orchestrator::new(store.clone(), node_runner(Duration::from_secs(10)));
    let outcome = orchestrator
        .run_collection(1, EnvOverride::Absent)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Success, "{:?}", outcome.results);
    assert_eq!(outcome.results[0].status_code, Some(201));
    assert_eq!(outcome.results[0].request.body, Some(json!({"name": "neo"})));
    assert_eq!(outcome.results[1].url, format!("{}/users/7", server.base_url));

    server.shutdown().await;
}

#[tokio::test]
async fn throwing_pre_script_reports_its_message() {
    if !node_available() {
        eprintln!("node not available, skipping");
        return;
    }
    let store = MemoryStore::new();
    let mut broken = case(1, "http://127.0.0.1:1/never");
    broken.pre_script = Some("throw new Error('boom');".to_string());
    store.insert_case(broken).await;

    let runner = node_runner(Duration::from_secs(10));
    let result = runner
        .run_case(&store, 1, EnvOverride::Absent)
        .await
        .unwrap();

    assert!(!result.passed);
    assert_eq!(result.status_code, None);
    assert_eq!(result.error.as_deref(), Some("pre-script failed: boom"));
}

#[tokio::test]
async fn runaway_script_is_killed_at_the_timeout() {
    if !node_available() {
        eprintln!("node not available, skipping");
        return;
    }
    let sandbox = NodeSandbox::new("node", Duration::from_secs(1), 1);
    let context = ScriptContext::pre(&HashMap::new(), &case(1, "http://h").request_snapshot());

    let started = Instant::now();
    let result = sandbox
        .execute(ScriptPhase::Pre, "while (true) {}", &context)
        .await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(result.executed);
    assert!(!result.passed);
    assert!(result.error.unwrap().contains("timed out"));
}

async fn run_post_script(source: &str, environment: &HashMap<String, Value>) -> ScriptResult {
    let sandbox = NodeSandbox::new("node", Duration::from_secs(10), 2);
    let response = ResponseSnapshot {
        status: 200,
        headers: HashMap::new(),
        body: json!({"id": 5, "name": "ada", "tags": ["a", "b"], "nothing": null}),
        elapsed_ms: 3,
        size_bytes: 48,
        size: "48 B".to_string(),
    };
    let context = ScriptContext::post(
        environment,
        &case(1, "http://h/users").request_snapshot(),
        &response,
    );
    sandbox.execute(ScriptPhase::Post, source, &context).await
}

#[tokio::test]
async fn assertion_matchers_report_pass_and_failure_text() {
    if !node_available() {
        eprintln!("node not available, skipping");
        return;
    }
    // (expression, passes, expected error text)
    let table: &[(&str, bool, Option<&str>)] = &[
        ("pm.expect(5).to.be.above(4)", true, None),
        ("pm.expect(5).to.not.be.above(4)", false, Some("expected 5 not to be above 4")),
        ("pm.expect(3).to.be.above(4)", false, Some("expected 3 to be above 4")),
        ("pm.expect(5).to.be.below(4)", false, Some("expected 5 to be below 4")),
        ("pm.expect(pm.response.code).to.not.be.below(200)", true, None),
        ("pm.expect(pm.response.json().tags).to.include('a')", true, None),
        ("pm.expect([1]).to.include(2)", false, Some("expected [1] to include 2")),
        (
            "pm.expect('hello world').to.not.include('world')",
            false,
            Some("expected \"hello world\" not to include \"world\""),
        ),
        ("pm.expect(pm.response.text()).to.include('ada')", true, None),
        ("pm.expect(pm.response.json().name).to.be.a('string')", true, None),
        ("pm.expect(pm.response.json().tags).to.be.an('array')", true, None),
        ("pm.expect(5).to.be.a('string')", false, Some("expected 5 to be a string")),
        ("pm.expect(null).to.not.be.an('object')", true, None),
        ("pm.expect(pm.response.json().name).to.exist", true, None),
        ("pm.expect(pm.response.json().nothing).to.exist", false, Some("expected null to exist")),
        ("pm.expect(pm.response.json().missing).to.not.exist()", true, None),
        ("pm.expect(5).to.not.exist", false, Some("expected 5 not to exist")),
        ("pm.expect({a: 1}).to.eql({a: 1})", true, None),
        (
            "pm.expect({a: 1}).to.not.eql({a: 1})",
            false,
            Some("expected {\"a\":1} not to equal {\"a\":1}"),
        ),
        ("pm.expect(pm.response.json()).to.not.have.property('missing')", true, None),
        (
            "pm.expect(pm.response.json()).to.have.property('id', 6)",
            false,
            Some("to have property 'id' of 6"),
        ),
    ];

    for (expression, passes, error) in table {
        let source = format!("pm.test('matcher', () => {{ {expression}; }});");
        let result = run_post_script(&source, &HashMap::new()).await;

        assert!(result.executed, "{expression}: {:?}", result.error);
        assert!(result.error.is_none(), "{expression}: {:?}", result.error);
        assert_eq!(result.passed, *passes, "{expression}");
        assert_eq!(result.assertions.len(), 1, "{expression}");
        let assertion = &result.assertions[0];
        assert_eq!(assertion.passed, *passes, "{expression}");
        match error {
            Some(text) => {
                let actual = assertion.error.as_deref().unwrap_or_default();
                assert!(actual.contains(text), "{expression}: got {actual:?}");
            }
            None => assert!(assertion.error.is_none(), "{expression}: {:?}", assertion.error),
        }
    }
}

#[tokio::test]
async fn environment_and_local_variables_in_scripts() {
    if !node_available() {
        eprintln!("node not available, skipping");
        return;
    }
    let environment: HashMap<String, Value> = [("token".to_string(), json!("t"))].into();

    let result = run_post_script(
        "pm.environment.set('extra', 1);\n\
         pm.test('keys', () => pm.expect(pm.environment.keys().sort()).to.eql(['extra', 'token']));\n\
         pm.environment.clear();\n\
         pm.test('cleared', () => pm.expect(pm.environment.get('extra')).to.not.exist);\n\
         pm.test('stored kept', () => pm.expect(pm.environment.get('token')).to.eql('t'));\n\
         pm.environment.set('kept', 'yes');",
        &environment,
    )
    .await;
    assert!(result.passed, "{:?}", result.assertions);
    assert_eq!(result.assertions.len(), 3);
    assert_eq!(result.environment_changes.len(), 1);
    assert_eq!(result.environment_changes["kept"], json!("yes"));

    let result = run_post_script(
        "pm.variables.set('local', 'x');\n\
         pm.test('local', () => pm.expect(pm.variables.get('local')).to.eql('x'));\n\
         pm.test('falls back', () => pm.expect(pm.variables.get('token')).to.eql('t'));\n\
         pm.variables.clear();\n\
         pm.test('cleared', () => pm.expect(pm.variables.get('local')).to.not.exist);",
        &environment,
    )
    .await;
    assert!(result.passed, "{:?}", result.assertions);
    assert_eq!(result.assertions.len(), 3);
    assert!(result.environment_changes.is_empty());
}

#[tokio::test]
async fn scripts_cannot_exit_before_reporting() {
    if !node_available() {
        eprintln!("node not available, skipping");
        return;
    }
    for source in [
        "pm.test('t', () => { throw new Error('x'); }); process.exit(0);",
        "pm.test('t', () => { throw new Error('x'); }); globalThis.process.exit(0);",
    ] {
        let result = run_post_script(source, &HashMap::new()).await;
        assert!(result.executed);
        assert!(!result.passed, "{source}");
        let error = result.error.unwrap_or_default();
        assert!(error.contains("exit"), "{source}: got {error:?}");
    }
}
