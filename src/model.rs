//! Stored test definitions, execution snapshots and run records.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

pub type CaseId = u64;
pub type CollectionId = u64;
pub type EnvironmentId = u64;
pub type RunId = u64;
pub type ReportId = u64;

/// Request timeout applied when a case does not configure one.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on the number of variables an environment may hold.
pub const MAX_ENVIRONMENT_VARIABLES: usize = 100;

/// A stored HTTP test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: CaseId,
    #[serde(default)]
    pub collection_id: Option<CollectionId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
    /// URL template; may contain `{{name}}` placeholders.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, alias = "params")]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default)]
    pub pre_script: Option<String>,
    #[serde(default)]
    pub post_script: Option<String>,
    /// Per-request timeout; unset or zero means the engine default
    /// ([`DEFAULT_REQUEST_TIMEOUT_SECS`] unless configured otherwise).
    #[serde(default, alias = "timeout")]
    pub timeout_seconds: Option<u64>,
    /// Environment used when no run-level override applies.
    #[serde(default)]
    pub environment_id: Option<EnvironmentId>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub sort_order: i32,
    /// Written only by the case runner.
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: LastStatus,
}

fn default_enabled() -> bool {
    true
}

impl TestCase {
    /// Configured timeout, or `default` when unset or zero.
    pub fn effective_timeout_secs(&self, default: u64) -> u64 {
        self.timeout_seconds.filter(|secs| *secs > 0).unwrap_or(default)
    }

    /// Pre-script source, or `None` when blank.
    pub fn pre_script_source(&self) -> Option<&str> {
        non_blank(self.pre_script.as_deref())
    }

    /// Post-script source, or `None` when blank.
    pub fn post_script_source(&self) -> Option<&str> {
        non_blank(self.post_script.as_deref())
    }

    /// Reject cases that cannot be executed at all.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.url.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "case {} ({}) has no url",
                self.id, self.name
            )));
        }
        if self.body_type == BodyType::Form {
            if let Some(body) = &self.body {
                if !matches!(body, Value::Object(_) | Value::String(_)) {
                    return Err(EngineError::Validation(format!(
                        "case {} ({}) has a form body that is neither an object nor a string",
                        self.id, self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The request as stored, before scripts or substitution touch it.
    pub fn request_snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            method: self.method,
            url: self.url.clone(),
            headers: self.headers.clone(),
            params: self.query_params.clone(),
            body: self.body.clone(),
        }
    }
}

fn non_blank(source: Option<&str>) -> Option<&str> {
    source.filter(|s| !s.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Whether the engine attaches the case body to this method.
    pub fn sends_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Json,
    Form,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastStatus {
    #[default]
    Pending,
    Passed,
    Failed,
}

impl LastStatus {
    pub fn from_passed(passed: bool) -> Self {
        if passed {
            LastStatus::Passed
        } else {
            LastStatus::Failed
        }
    }
}

/// Named set of base headers and variables shared by the cases of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    /// Prefix for case URLs that carry no scheme.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default, alias = "headers")]
    pub base_headers: HashMap<String, String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl Environment {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.variables.len() > MAX_ENVIRONMENT_VARIABLES {
            return Err(EngineError::Validation(format!(
                "environment {} ({}) defines {} variables, the limit is {}",
                self.id,
                self.name,
                self.variables.len(),
                MAX_ENVIRONMENT_VARIABLES
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Run-level environment selection supplied by the caller.
///
/// `Absent` and `Explicit(None)` are different requests: the former lets
/// every case use its own environment, the latter forces every case to
/// run without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvOverride {
    #[default]
    Absent,
    Explicit(Option<EnvironmentId>),
}

impl EnvOverride {
    pub fn mode(&self) -> EnvironmentMode {
        match self {
            EnvOverride::Absent => EnvironmentMode::Individual,
            EnvOverride::Explicit(_) => EnvironmentMode::Unified,
        }
    }

    /// Environment id a case ends up with under this override.
    pub fn effective_for(&self, case: &TestCase) -> Option<EnvironmentId> {
        match self {
            EnvOverride::Absent => case.environment_id,
            EnvOverride::Explicit(id) => *id,
        }
    }
}

impl From<Option<Option<EnvironmentId>>> for EnvOverride {
    fn from(value: Option<Option<EnvironmentId>>) -> Self {
        match value {
            None => EnvOverride::Absent,
            Some(id) => EnvOverride::Explicit(id),
        }
    }
}

/// Caller payload for a collection run.
///
/// A missing `env_id` key and `"env_id": null` deserialize differently;
/// see [`EnvOverride`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default, deserialize_with = "deserialize_present")]
    pub env_id: Option<Option<EnvironmentId>>,
}

impl RunRequest {
    pub fn env_override(&self) -> EnvOverride {
        self.env_id.into()
    }
}

fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentMode {
    Unified,
    Individual,
}

/// Request fields as seen by a script or as finally sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Captured HTTP response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Decoded JSON when the payload parses, otherwise the raw text.
    pub body: Value,
    pub elapsed_ms: u64,
    pub size_bytes: usize,
    /// Human-readable size, e.g. `1.50 KB`.
    pub size: String,
}

/// Request overlay recorded by a pre-script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RequestChanges {
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.headers.is_none() && self.body.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Outcome of one sandbox invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptResult {
    pub executed: bool,
    pub passed: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub environment_changes: Map<String, Value>,
    #[serde(default)]
    pub request_changes: RequestChanges,
    #[serde(default)]
    pub assertions: Vec<AssertionResult>,
    pub duration_ms: u64,
}

impl ScriptResult {
    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            executed: true,
            passed: false,
            error: Some(error.into()),
            environment_changes: Map::new(),
            request_changes: RequestChanges::default(),
            assertions: Vec::new(),
            duration_ms,
        }
    }

    /// A script that ran but produced no readable result payload.
    pub fn empty_success(duration_ms: u64) -> Self {
        Self {
            executed: true,
            passed: true,
            error: None,
            environment_changes: Map::new(),
            request_changes: RequestChanges::default(),
            assertions: Vec::new(),
            duration_ms,
        }
    }

    pub fn failed_assertions(&self) -> usize {
        self.assertions.iter().filter(|a| !a.passed).count()
    }
}

/// Scripts that actually ran for a case; `None` means not executed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptExecution {
    pub pre_script: Option<ScriptResult>,
    pub post_script: Option<ScriptResult>,
}

impl ScriptExecution {
    pub fn any_executed(&self) -> bool {
        self.pre_script.is_some() || self.post_script.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Text,
    Json,
}

/// Bounded-length preview attached to a case result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub content: String,
}

/// Complete outcome record for one executed case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: CaseId,
    pub name: String,
    pub method: HttpMethod,
    /// URL actually requested (after scripts and substitution).
    pub url: String,
    pub passed: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    /// Wall-clock time for the whole case, scripts included.
    pub duration_ms: u64,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub script_execution: ScriptExecution,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub error: Option<String>,
    pub environment_id: Option<EnvironmentId>,
    pub environment_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

/// Persisted record of one collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Assigned by the report store on creation.
    pub run_id: RunId,
    pub collection_id: CollectionId,
    pub collection_name: String,
    pub status: RunStatus,
    pub environment_mode: EnvironmentMode,
    pub environment_id: Option<EnvironmentId>,
    pub environment_name: Option<String>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Cases never started because the run was stopped.
    pub skipped: usize,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<CaseResult>,
    pub report_id: Option<ReportId>,
    pub error_message: Option<String>,
}

impl RunSummary {
    pub fn is_finalized(&self) -> bool {
        self.status != RunStatus::Running
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Percentage of `total`, rounded to two decimals.
    pub success_rate: f64,
    pub duration_seconds: f64,
    pub environment: String,
    pub environment_mode: EnvironmentMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEnvironment {
    pub mode: EnvironmentMode,
    pub id: Option<EnvironmentId>,
    pub name: Option<String>,
    pub description: String,
}

/// Report document generated at the end of a collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: RunId,
    pub title: String,
    pub collection: Collection,
    pub environment: ReportEnvironment,
    pub summary: ReportSummary,
    pub results: Vec<CaseResult>,
    pub generated_at: DateTime<Utc>,
}
