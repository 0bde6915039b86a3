//! apiprobe CLI - run API test collections from YAML workspace files.

use anyhow::{anyhow, Context, Result};
use apiprobe::report::render_text;
use apiprobe::store::MemoryStore;
use apiprobe::variables::extract_variables;
use apiprobe::{
    CaseResult, CaseRunner, Collection, CollectionRunOutcome, EngineConfig, EnvOverride,
    EnvironmentId, Orchestrator, Report, RunStatus, WorkspaceLoader,
};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// apiprobe - API test case runner with sandboxed pre/post scripts.
#[derive(Parser, Debug)]
#[command(name = "apiprobe", version, about)]
struct Cli {
    /// Workspace file or directory.
    #[arg(short = 'w', long = "workspace", env = "APIPROBE_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Collection to run, by id or name. Runs every collection when omitted.
    #[arg(short = 'c', long = "collection", conflicts_with = "case")]
    collection: Option<String>,

    /// Run a single case by id.
    #[arg(long = "case")]
    case: Option<u64>,

    /// Environment applied to every case: an id, or `none` to run without one.
    #[arg(short = 'e', long = "env", value_parser = parse_env_arg)]
    env: Option<EnvArg>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Script timeout in seconds.
    #[arg(long = "script-timeout", env = "APIPROBE_SCRIPT_TIMEOUT", default_value_t = 3)]
    script_timeout: u64,

    /// Request timeout in seconds for cases that do not set one.
    #[arg(short = 't', long = "timeout", env = "APIPROBE_REQUEST_TIMEOUT", default_value_t = 30)]
    request_timeout: u64,

    /// Node.js binary used to run scripts.
    #[arg(long = "node", env = "APIPROBE_NODE", default_value = "node")]
    node_binary: PathBuf,

    /// Maximum number of script processes alive at once.
    #[arg(long = "max-sandbox-processes", env = "APIPROBE_MAX_SANDBOX_PROCESSES", default_value_t = 4)]
    max_sandbox_processes: usize,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

#[derive(Debug, Clone, Copy)]
struct EnvArg(Option<EnvironmentId>);

fn parse_env_arg(value: &str) -> Result<EnvArg, String> {
    if value.eq_ignore_ascii_case("none") {
        return Ok(EnvArg(None));
    }
    value
        .parse::<EnvironmentId>()
        .map(|id| EnvArg(Some(id)))
        .map_err(|_| format!("expected an environment id or `none`, got `{value}`"))
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn print_case_result(index: usize, result: &CaseResult, verbose: bool) {
    let status = if result.passed {
        "\x1b[32m✓\x1b[0m"
    } else {
        "\x1b[31m✗\x1b[0m"
    };
    let code = result
        .status_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "---".to_string());
    info!(
        "  {}. {} {} {} {} -> {} ({} ms)",
        index,
        status,
        result.name,
        result.method,
        result.url,
        code,
        result.duration_ms
    );

    if let Some(error) = &result.error {
        error!("     \x1b[31mError: {}\x1b[0m", error);
    }

    for script in [
        &result.script_execution.pre_script,
        &result.script_execution.post_script,
    ]
    .into_iter()
    .flatten()
    {
        for assertion in script.assertions.iter().filter(|a| !a.passed) {
            error!(
                "     \x1b[31mAssertion failed: {} {}\x1b[0m",
                assertion.name,
                assertion.error.as_deref().unwrap_or_default()
            );
        }
    }

    if verbose {
        let unresolved = unresolved_variables(result);
        if !unresolved.is_empty() {
            warn!("     Unresolved variables: {}", unresolved.join(", "));
        }
        if let Some(response) = &result.response {
            debug!("     Response: {} ({})", response.status, response.size);
        }
    }
}

/// Placeholders still present in the request that was sent.
fn unresolved_variables(result: &CaseResult) -> Vec<String> {
    let mut names = extract_variables(&result.url);
    for value in result.request.headers.values().chain(result.request.params.values()) {
        names.extend(extract_variables(value));
    }
    if let Some(body) = &result.request.body {
        names.extend(extract_variables(&body.to_string()));
    }
    names.sort();
    names.dedup();
    names
}

fn print_outcome(collection: &Collection, outcome: &CollectionRunOutcome, verbose: bool) {
    let status = match outcome.status {
        RunStatus::Success => "\x1b[32mPASS\x1b[0m",
        RunStatus::Cancelled => "\x1b[33mCANCELLED\x1b[0m",
        _ => "\x1b[31mFAIL\x1b[0m",
    };
    info!(
        "{} collection: {} (run {}, {:.2} s)",
        status, collection.name, outcome.run_id, outcome.duration_seconds
    );
    for (i, result) in outcome.results.iter().enumerate() {
        print_case_result(i + 1, result, verbose);
    }
    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Skipped: {}",
        outcome.total, outcome.passed, outcome.failed, outcome.skipped
    );
}

fn save_report(report: &Report, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = report.collection.name.replace([' ', '/'], "_");

    let (extension, content) = match format {
        ReportFormat::Json => ("json", serde_json::to_string_pretty(report)?),
        ReportFormat::Yaml => ("yaml", serde_yaml::to_string(report)?),
        ReportFormat::Text => ("txt", render_text(report)),
    };

    let file_path = report_dir.join(format!(
        "{sanitized_name}-{}-{timestamp}.{extension}",
        report.run_id
    ));
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

async fn load_store(workspace: Option<PathBuf>) -> Result<MemoryStore> {
    let mut loader = WorkspaceLoader::new();
    loader.add_path("tests/apiprobe");

    let workspace = match workspace {
        Some(path) => {
            if !path.exists() {
                return Err(anyhow!("Path does not exist: {}", path.display()));
            }
            loader
                .load_path(&path)
                .with_context(|| format!("Failed to load workspace: {}", path.display()))?
        }
        None => loader.load_all()?,
    };
    workspace.into_store().await
}

fn select_collections(all: Vec<Collection>, filter: Option<&str>) -> Result<Vec<Collection>> {
    let Some(filter) = filter else {
        if all.is_empty() {
            return Err(anyhow!("No collections found"));
        }
        return Ok(all);
    };
    let selected: Vec<Collection> = all
        .into_iter()
        .filter(|c| c.id.to_string() == filter || c.name.eq_ignore_ascii_case(filter))
        .collect();
    if selected.is_empty() {
        return Err(anyhow!("No collection matching `{filter}` was found"));
    }
    Ok(selected)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let store = Arc::new(load_store(args.workspace.clone()).await?);
    let config = EngineConfig {
        node_binary: args.node_binary.clone(),
        script_timeout: Duration::from_secs(args.script_timeout),
        max_sandbox_processes: args.max_sandbox_processes,
        default_request_timeout_secs: args.request_timeout,
        ..EngineConfig::default()
    };
    let runner = Arc::new(CaseRunner::from_config(config)?);
    let env_override = EnvOverride::from(args.env.map(|e| e.0));

    if let Some(case_id) = args.case {
        let result = runner.run_case(store.as_ref(), case_id, env_override).await?;
        print_case_result(1, &result, args.verbose);
        if !result.passed {
            exit(1);
        }
        return Ok(());
    }

    let collections = select_collections(store.collections().await, args.collection.as_deref())?;
    let orchestrator = Orchestrator::new(Arc::clone(&store), runner);

    let registry = Arc::clone(orchestrator.registry());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current case");
            for run_id in registry.active_runs() {
                registry.request_stop(run_id);
            }
        }
    });

    info!("Running {} collection(s)...", collections.len());
    let mut all_success = true;
    for collection in &collections {
        let outcome = match orchestrator.run_collection(collection.id, env_override).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "\x1b[31mCollection run error: {} - {}\x1b[0m",
                    collection.name, e
                );
                all_success = false;
                continue;
            }
        };
        print_outcome(collection, &outcome, args.verbose);
        all_success &= outcome.status == RunStatus::Success;

        if let Some(dir) = &args.report_dir {
            let Some(report) = store.report(outcome.report_id).await else {
                error!("Report {} is missing", outcome.report_id);
                continue;
            };
            match save_report(&report, dir, args.report_format) {
                Ok(path) => info!("Report saved: {}", path.display()),
                Err(e) => error!("Failed to save report: {}", e),
            }
        }
        if outcome.status == RunStatus::Cancelled {
            break;
        }
    }

    if !all_success {
        exit(1);
    }

    Ok(())
}
