//! Case execution: pre-script, substitution, request, post-script, verdict.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::http_client::{HttpExecutor, PreparedRequest, ReqwestExecutor};
use crate::model::{
    CaseId, CaseResult, EnvOverride, Environment, LastStatus, RequestSnapshot, ScriptExecution,
    TestCase,
};
use crate::report::{derive_error, exception_attachment, response_attachments, safe_text};
use crate::script::{
    apply_environment_changes, apply_request_changes, ScriptContext, ScriptExecutor, ScriptPhase,
};
use crate::store::CaseStore;
use crate::variables::{merge_headers, substitute, substitute_deep, substitute_map};
use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Result of one execution plus the variable changes its scripts produced.
#[derive(Debug, Clone)]
pub struct CaseOutcome {
    pub result: CaseResult,
    /// Empty when the pre-script failed.
    pub environment_changes: Map<String, Value>,
}

/// Pass/fail verdict for a case.
///
/// Without a status code (no response) the case fails. Once any script
/// ran, the scripts alone decide; otherwise the status must be below 400.
pub fn case_passed(status: Option<u16>, scripts: &ScriptExecution) -> bool {
    let Some(status) = status else {
        return false;
    };
    if scripts.any_executed() {
        let pre = scripts.pre_script.as_ref().map_or(true, |s| s.passed);
        let post = scripts.post_script.as_ref().map_or(true, |s| s.passed);
        return pre && post;
    }
    status < 400
}

/// Join a scheme-less URL onto the environment base URL.
pub fn join_base_url(base_url: Option<&str>, url: &str) -> String {
    match base_url.map(str::trim).filter(|b| !b.is_empty()) {
        Some(base) if !url.contains("://") => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        ),
        _ => url.to_string(),
    }
}

/// Load the environment a case should run under.
///
/// A run-level override naming a missing environment is an error; a
/// case's own dangling `environment_id` runs without an environment.
pub async fn resolve_environment<S>(
    store: &S,
    env_override: EnvOverride,
    case: &TestCase,
) -> Result<Option<Environment>, EngineError>
where
    S: CaseStore + ?Sized,
{
    let Some(id) = env_override.effective_for(case) else {
        return Ok(None);
    };
    let environment = store
        .environment(id)
        .await
        .map_err(EngineError::persistence)?;
    match (environment, env_override) {
        (Some(environment), _) => Ok(Some(environment)),
        (None, EnvOverride::Explicit(_)) => Err(EngineError::NotFound(format!("environment {id}"))),
        (None, EnvOverride::Absent) => {
            warn!(
                case_id = case.id,
                environment_id = id,
                "Case references a missing environment, running without one"
            );
            Ok(None)
        }
    }
}

pub struct CaseRunner {
    http: Arc<dyn HttpExecutor>,
    scripts: Arc<dyn ScriptExecutor>,
    config: EngineConfig,
}

impl CaseRunner {
    pub fn new(
        http: Arc<dyn HttpExecutor>,
        scripts: Arc<dyn ScriptExecutor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            http,
            scripts,
            config,
        }
    }

    /// Runner backed by `reqwest` and a Node.js sandbox.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let http = Arc::new(ReqwestExecutor::new()?);
        let scripts = Arc::new(config.sandbox());
        Ok(Self::new(http, scripts, config))
    }

    /// Execute one case against a private copy of `variables`.
    ///
    /// Never fails: script and transport problems end up in the returned
    /// `CaseResult`.
    #[instrument(skip(self, case, environment, variables), fields(case_id = case.id, name = %case.name))]
    pub async fn execute(
        &self,
        case: &TestCase,
        environment: Option<&Environment>,
        mut variables: HashMap<String, Value>,
    ) -> CaseOutcome {
        let start = Instant::now();
        let mut request = case.request_snapshot();
        let mut scripts = ScriptExecution::default();
        let mut changes = Map::new();

        if let Some(source) = case.pre_script_source() {
            let context = ScriptContext::pre(&variables, &request);
            let result = self.scripts.execute(ScriptPhase::Pre, source, &context).await;
            if !result.passed {
                warn!(error = ?result.error, "Pre-script failed, request not sent");
                let error = result
                    .error
                    .as_ref()
                    .map(|e| format!("{} failed: {e}", ScriptPhase::Pre));
                scripts.pre_script = Some(result);
                return CaseOutcome {
                    result: self.unsent_result(case, environment, request, scripts, error, start),
                    environment_changes: Map::new(),
                };
            }
            apply_request_changes(&mut request, &result.request_changes);
            apply_environment_changes(&mut variables, &result.environment_changes);
            changes.extend(result.environment_changes.clone());
            scripts.pre_script = Some(result);
        }

        let sent = resolve_request(&request, environment, &variables);
        let timeout_secs = case.effective_timeout_secs(self.config.default_request_timeout_secs);
        let prepared = PreparedRequest {
            method: sent.method,
            url: sent.url.clone(),
            headers: sent.headers.clone(),
            query: sent.params.clone(),
            body: sent.body.clone().filter(|_| sent.method.sends_body()),
            body_type: case.body_type,
            timeout: Duration::from_secs(timeout_secs),
        };
        debug!(url = %prepared.url, timeout_secs, "Sending request");

        let response = match self.http.execute(&prepared).await {
            Ok(response) => response,
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "Request failed");
                let mut result =
                    self.unsent_result(case, environment, sent, scripts, Some(message), start);
                if let Some(error) = &result.error {
                    result.attachments =
                        vec![exception_attachment(error, self.config.exception_preview_limit)];
                }
                return CaseOutcome {
                    result,
                    environment_changes: changes,
                };
            }
        };

        if let Some(source) = case.post_script_source() {
            let context = ScriptContext::post(&variables, &sent, &response);
            let result = self.scripts.execute(ScriptPhase::Post, source, &context).await;
            apply_environment_changes(&mut variables, &result.environment_changes);
            changes.extend(result.environment_changes.clone());
            scripts.post_script = Some(result);
        }

        let status = response.status;
        let passed = case_passed(Some(status), &scripts);
        let error = if passed {
            None
        } else {
            let preview = safe_text(&response.body, self.config.preview_limit);
            derive_error(&scripts, status, &preview)
        };

        info!(
            status,
            passed,
            elapsed_ms = response.elapsed_ms,
            "{} {} finished",
            sent.method,
            sent.url
        );

        let result = CaseResult {
            case_id: case.id,
            name: case.name.clone(),
            method: sent.method,
            url: sent.url.clone(),
            passed,
            status_code: Some(status),
            response_time_ms: response.elapsed_ms,
            duration_ms: start.elapsed().as_millis() as u64,
            attachments: response_attachments(&sent, &response, self.config.preview_limit),
            request: sent,
            response: Some(response),
            script_execution: scripts,
            error,
            environment_id: environment.map(|e| e.id),
            environment_name: environment.map(|e| e.name.clone()),
        };
        CaseOutcome {
            result,
            environment_changes: changes,
        }
    }

    fn unsent_result(
        &self,
        case: &TestCase,
        environment: Option<&Environment>,
        request: RequestSnapshot,
        scripts: ScriptExecution,
        error: Option<String>,
        start: Instant,
    ) -> CaseResult {
        CaseResult {
            case_id: case.id,
            name: case.name.clone(),
            method: request.method,
            url: request.url.clone(),
            passed: case_passed(None, &scripts),
            status_code: None,
            response_time_ms: 0,
            duration_ms: start.elapsed().as_millis() as u64,
            request,
            response: None,
            script_execution: scripts,
            attachments: Vec::new(),
            error,
            environment_id: environment.map(|e| e.id),
            environment_name: environment.map(|e| e.name.clone()),
        }
    }

    /// Load, execute and record a single stored case.
    #[instrument(skip(self, store))]
    pub async fn run_case<S>(
        &self,
        store: &S,
        case_id: CaseId,
        env_override: EnvOverride,
    ) -> Result<CaseResult, EngineError>
    where
        S: CaseStore + ?Sized,
    {
        let case = store
            .case(case_id)
            .await
            .map_err(EngineError::persistence)?
            .ok_or_else(|| EngineError::NotFound(format!("case {case_id}")))?;
        case.validate()?;

        let environment = resolve_environment(store, env_override, &case).await?;
        let variables = environment
            .as_ref()
            .map(|e| e.variables.clone())
            .unwrap_or_default();

        let outcome = self.execute(&case, environment.as_ref(), variables).await;
        store
            .record_last_run(
                case.id,
                Utc::now(),
                LastStatus::from_passed(outcome.result.passed),
            )
            .await
            .map_err(EngineError::persistence)?;
        Ok(outcome.result)
    }
}

/// Substitute variables into every request field and apply environment
/// defaults (base URL, base headers).
fn resolve_request(
    request: &RequestSnapshot,
    environment: Option<&Environment>,
    variables: &HashMap<String, Value>,
) -> RequestSnapshot {
    let url = substitute(&request.url, variables);
    let base_url = environment
        .and_then(|e| e.base_url.as_deref())
        .map(|b| substitute(b, variables));
    let base_headers = environment
        .map(|e| substitute_map(&e.base_headers, variables))
        .unwrap_or_default();

    RequestSnapshot {
        method: request.method,
        url: join_base_url(base_url.as_deref(), &url),
        headers: merge_headers(&base_headers, &substitute_map(&request.headers, variables)),
        params: substitute_map(&request.params, variables),
        body: request.body.as_ref().map(|b| substitute_deep(b, variables)),
    }
}
