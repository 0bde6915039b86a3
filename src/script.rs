//! Sandboxed pre/post script execution.
//!
//! Each invocation runs in a fresh `node` process fed over stdin. The
//! process reports back by printing [`RESULT_MARKER`] on stdout followed by
//! a single-line JSON object; everything else it prints is diagnostic.

use crate::model::{
    AssertionResult, RequestChanges, RequestSnapshot, ResponseSnapshot, ScriptResult,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// Delimiter preceding the result payload on the sandbox's stdout.
pub const RESULT_MARKER: &str = "__RESULT_OUTPUT__";

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(3);

const PRELUDE: &str = include_str!("sandbox_prelude.js");

const MAX_ERROR_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptPhase {
    Pre,
    Post,
}

impl fmt::Display for ScriptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptPhase::Pre => f.write_str("pre-script"),
            ScriptPhase::Post => f.write_str("post-script"),
        }
    }
}

/// Response as exposed to a post-script (`pm.response`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptResponse {
    pub status: u16,
    /// Alias of `status`.
    pub code: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub response_time: u64,
    pub elapsed_ms: u64,
    pub size: usize,
}

impl From<&ResponseSnapshot> for ScriptResponse {
    fn from(response: &ResponseSnapshot) -> Self {
        Self {
            status: response.status,
            code: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            response_time: response.elapsed_ms,
            elapsed_ms: response.elapsed_ms,
            size: response.size_bytes,
        }
    }
}

/// Serialized state handed to one script invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptContext {
    pub environment: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ScriptResponse>,
}

impl ScriptContext {
    pub fn pre(environment: &HashMap<String, Value>, request: &RequestSnapshot) -> Self {
        Self {
            environment: environment.clone(),
            request: Some(request.clone()),
            response: None,
        }
    }

    /// Post-phase context; `request` is the request that was sent and is
    /// read-only to the script.
    pub fn post(
        environment: &HashMap<String, Value>,
        request: &RequestSnapshot,
        response: &ResponseSnapshot,
    ) -> Self {
        Self {
            environment: environment.clone(),
            request: Some(request.clone()),
            response: Some(response.into()),
        }
    }
}

/// Runs one script against one context.
///
/// Implementations never fail: every problem is reported through a
/// `ScriptResult` with `passed == false`.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(
        &self,
        phase: ScriptPhase,
        source: &str,
        context: &ScriptContext,
    ) -> ScriptResult;
}

/// [`ScriptExecutor`] that spawns a Node.js process per invocation.
///
/// Clones share the process cap.
#[derive(Debug, Clone)]
pub struct NodeSandbox {
    node_binary: PathBuf,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl NodeSandbox {
    pub fn new(node_binary: impl Into<PathBuf>, timeout: Duration, max_processes: usize) -> Self {
        Self {
            node_binary: node_binary.into(),
            timeout,
            permits: Arc::new(Semaphore::new(max_processes.max(1))),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.node_binary);
        command
            .arg("-")
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        command
    }

    async fn run_program(&self, program: String) -> Result<Output, SandboxFailure> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| SandboxFailure::Spawn(format!("{}: {e}", self.node_binary.display())))?;
        let stdin = child.stdin.take();

        let run = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(program.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        // Dropping `run` on timeout drops the child, which kills it.
        match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(SandboxFailure::Io(e.to_string())),
            Err(_) => Err(SandboxFailure::Timeout(self.timeout)),
        }
    }
}

impl Default for NodeSandbox {
    fn default() -> Self {
        Self::new("node", DEFAULT_SCRIPT_TIMEOUT, 4)
    }
}

#[derive(Debug)]
enum SandboxFailure {
    Spawn(String),
    Io(String),
    Timeout(Duration),
}

impl fmt::Display for SandboxFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxFailure::Spawn(detail) => {
                write!(f, "failed to start script runtime ({detail})")
            }
            SandboxFailure::Io(detail) => write!(f, "script runtime I/O error: {detail}"),
            SandboxFailure::Timeout(limit) => {
                write!(f, "script execution timed out after {limit:?}")
            }
        }
    }
}

#[async_trait]
impl ScriptExecutor for NodeSandbox {
    #[instrument(skip(self, source, context), fields(phase = %phase))]
    async fn execute(
        &self,
        phase: ScriptPhase,
        source: &str,
        context: &ScriptContext,
    ) -> ScriptResult {
        let start = Instant::now();
        let elapsed_ms = || start.elapsed().as_millis() as u64;

        let program = match build_program(phase, source, context) {
            Ok(program) => program,
            Err(e) => return ScriptResult::failed(format!("{e:#}"), elapsed_ms()),
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return ScriptResult::failed("script sandbox is closed", elapsed_ms()),
        };

        let spawned_at = Instant::now();
        let result = match self.run_program(program).await {
            Ok(output) => interpret_output(phase, &output, elapsed_ms()),
            Err(failure) => {
                warn!(%failure, "{phase} did not complete");
                ScriptResult::failed(failure.to_string(), elapsed_ms())
            }
        };
        debug!(
            passed = result.passed,
            process_ms = spawned_at.elapsed().as_millis() as u64,
            "{phase} finished"
        );
        result
    }
}

/// Assemble the full program sent to the runtime.
pub fn build_program(phase: ScriptPhase, source: &str, context: &ScriptContext) -> Result<String> {
    let context_json =
        serde_json::to_string(context).context("failed to serialize script context")?;
    let source_json = serde_json::to_string(source).context("failed to encode script source")?;
    let phase_json = serde_json::to_string(&phase).context("failed to encode script phase")?;
    let marker_json = serde_json::to_string(RESULT_MARKER)?;

    Ok(format!(
        "const __MARKER = {marker_json};\n\
         const __PHASE = {phase_json};\n\
         const __CONTEXT = {context_json};\n\
         const __SOURCE = {source_json};\n\
         {PRELUDE}"
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SandboxPayload {
    environment_changes: Map<String, Value>,
    request_changes: RequestChanges,
    assertions: Vec<AssertionResult>,
}

/// Extract the result payload from the sandbox's stdout.
///
/// The host-generated epilogue prints last, so the final marker wins; only
/// the first non-empty line after it is parsed.
fn parse_output(stdout: &str) -> Option<SandboxPayload> {
    let (_, tail) = stdout.rsplit_once(RESULT_MARKER)?;
    let line = tail.lines().map(str::trim).find(|l| !l.is_empty())?;
    match serde_json::from_str(line) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!("Unreadable script result payload: {e}");
            None
        }
    }
}

fn interpret_output(phase: ScriptPhase, output: &Output, duration_ms: u64) -> ScriptResult {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        let raw = [stderr.trim(), stdout.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or("unknown script error");
        debug!(status = ?output.status.code(), "{phase} exited unsuccessfully");
        return ScriptResult::failed(extract_error_message(raw), duration_ms);
    }

    let Some(payload) = parse_output(&stdout) else {
        debug!("{phase} produced no result payload");
        return ScriptResult::empty_success(duration_ms);
    };

    let passed = payload.assertions.iter().all(|a| a.passed);
    ScriptResult {
        executed: true,
        passed,
        error: None,
        environment_changes: payload.environment_changes,
        request_changes: match phase {
            ScriptPhase::Pre => payload.request_changes,
            ScriptPhase::Post => RequestChanges::default(),
        },
        assertions: payload.assertions,
        duration_ms,
    }
}

/// Best-effort one-line message from runtime error output.
///
/// Picks the first line mentioning `Error:` that is not a stack frame and
/// returns what follows its first colon.
pub fn extract_error_message(raw: &str) -> String {
    for line in raw.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("at ") || !line.contains("Error:") {
            continue;
        }
        if let Some((_, message)) = line.split_once(':') {
            return message.trim().to_string();
        }
    }
    raw.chars().take(MAX_ERROR_CHARS).collect()
}

/// Overlay a pre-script's request changes; headers merge, url/body replace.
pub fn apply_request_changes(request: &mut RequestSnapshot, changes: &RequestChanges) {
    if let Some(url) = &changes.url {
        request.url = url.clone();
    }
    if let Some(headers) = &changes.headers {
        request
            .headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if let Some(body) = &changes.body {
        request.body = Some(body.clone());
    }
}

/// Upsert script environment changes into a variable snapshot.
pub fn apply_environment_changes(vars: &mut HashMap<String, Value>, changes: &Map<String, Value>) {
    for (key, value) in changes {
        vars.insert(key.clone(), value.clone());
    }
}
