//! Bounded previews, per-case error text and the run report document.

use crate::model::{
    Attachment, AttachmentKind, CaseResult, Collection, EnvironmentMode, Report,
    ReportEnvironment, ReportSummary, RequestSnapshot, ResponseSnapshot, RunSummary,
    ScriptExecution,
};
use chrono::Utc;
use serde_json::Value;
use std::fmt::Write as _;

pub const PREVIEW_LIMIT: usize = 2000;
pub const EXCEPTION_PREVIEW_LIMIT: usize = 1000;

const ELLIPSIS: &str = "...";

/// Render a value as text capped at `limit` characters, tail truncated
/// with `...`.
pub fn safe_text(value: &Value, limit: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate(&text, limit)
}

pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{ELLIPSIS}", &text[..cut]),
        None => text.to_string(),
    }
}

/// Previews attached to a case that produced a response.
pub fn response_attachments(
    request: &RequestSnapshot,
    response: &ResponseSnapshot,
    limit: usize,
) -> Vec<Attachment> {
    let headers = serde_json::to_value(&response.headers).unwrap_or(Value::Null);
    let mut attachments = vec![
        Attachment {
            name: "response_body".to_string(),
            kind: AttachmentKind::Text,
            content: safe_text(&response.body, limit),
        },
        Attachment {
            name: "response_headers".to_string(),
            kind: AttachmentKind::Json,
            content: safe_text(&headers, limit),
        },
    ];
    if let Some(body) = request.body.as_ref().filter(|b| !is_empty_body(b)) {
        attachments.push(Attachment {
            name: "request_body".to_string(),
            kind: AttachmentKind::Text,
            content: safe_text(body, limit),
        });
    }
    attachments
}

/// Preview attached to a case whose request never produced a response.
pub fn exception_attachment(message: &str, limit: usize) -> Attachment {
    Attachment {
        name: "exception".to_string(),
        kind: AttachmentKind::Text,
        content: truncate(message, limit),
    }
}

fn is_empty_body(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Error text for a failed case that got a response.
///
/// Priority: pre-script error, post-script error, HTTP status. Returns
/// `None` when the failure is assertion-only on a non-error status.
pub fn derive_error(
    scripts: &ScriptExecution,
    status: u16,
    body_preview: &str,
) -> Option<String> {
    if let Some(error) = scripts.pre_script.as_ref().and_then(|s| s.error.as_ref()) {
        return Some(format!("pre-script failed: {error}"));
    }
    if let Some(error) = scripts.post_script.as_ref().and_then(|s| s.error.as_ref()) {
        return Some(format!("post-script failed: {error}"));
    }
    if status >= 400 {
        if body_preview.is_empty() {
            return Some(format!("HTTP {status}"));
        }
        return Some(format!("HTTP {status}: {body_preview}"));
    }
    None
}

pub fn success_rate(passed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (passed as f64 / total as f64 * 10_000.0).round() / 100.0
}

/// Build the report document for a finalized run.
pub fn build_report(run: &RunSummary, collection: &Collection) -> Report {
    let environment = match run.environment_mode {
        EnvironmentMode::Unified => ReportEnvironment {
            mode: EnvironmentMode::Unified,
            id: run.environment_id,
            name: run.environment_name.clone(),
            description: "one environment applied to every case".to_string(),
        },
        EnvironmentMode::Individual => ReportEnvironment {
            mode: EnvironmentMode::Individual,
            id: None,
            name: None,
            description: "each case uses its own configured environment".to_string(),
        },
    };
    let environment_label = match run.environment_mode {
        EnvironmentMode::Unified => run
            .environment_name
            .clone()
            .unwrap_or_else(|| "none".to_string()),
        EnvironmentMode::Individual => "mixed".to_string(),
    };

    Report {
        run_id: run.run_id,
        title: format!("{} - API test report", collection.name),
        collection: collection.clone(),
        environment,
        summary: ReportSummary {
            total: run.total,
            passed: run.passed,
            failed: run.failed,
            skipped: run.skipped,
            success_rate: success_rate(run.passed, run.total),
            duration_seconds: (run.duration_seconds * 100.0).round() / 100.0,
            environment: environment_label,
            environment_mode: run.environment_mode,
        },
        results: run.results.clone(),
        generated_at: Utc::now(),
    }
}

/// Plain-text rendering of a report.
pub fn render_text(report: &Report) -> String {
    let summary = &report.summary;
    let mut out = String::new();
    let _ = writeln!(out, "{}", report.title);
    let _ = writeln!(
        out,
        "Environment: {} ({:?})",
        summary.environment, summary.environment_mode
    );
    let _ = writeln!(
        out,
        "Total: {}  Passed: {}  Failed: {}  Skipped: {}  Success rate: {:.2}%",
        summary.total, summary.passed, summary.failed, summary.skipped, summary.success_rate
    );
    let _ = writeln!(out, "Duration: {:.2} s\n", summary.duration_seconds);
    let _ = writeln!(out, "Cases:");
    for (i, result) in report.results.iter().enumerate() {
        let _ = writeln!(out, "{}", case_line(i + 1, result));
        if let Some(error) = &result.error {
            let _ = writeln!(out, "     Error: {error}");
        }
        for script in [
            &result.script_execution.pre_script,
            &result.script_execution.post_script,
        ]
        .into_iter()
        .flatten()
        {
            for assertion in &script.assertions {
                let mark = if assertion.passed { "ok" } else { "FAIL" };
                let _ = write!(out, "     [{mark}] {}", assertion.name);
                match &assertion.error {
                    Some(error) => {
                        let _ = writeln!(out, ": {error}");
                    }
                    None => out.push('\n'),
                }
            }
        }
    }
    out
}

fn case_line(index: usize, result: &CaseResult) -> String {
    let status = result
        .status_code
        .map(|s| s.to_string())
        .unwrap_or_else(|| "---".to_string());
    format!(
        "  {index}. {} {} {} -> {status} ({} ms) {}",
        if result.passed { "PASS" } else { "FAIL" },
        result.method,
        result.url,
        result.response_time_ms,
        result.name
    )
}
