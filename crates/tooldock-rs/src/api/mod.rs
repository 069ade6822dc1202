mod error;

use std::net::IpAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use ipnet::IpNet;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

pub use error::{ApiError, ApiErrorBody};

use crate::{
    jobs::{wait_for_completion, QueuedJob, WaitOutcome},
    models::{JobStatus, NewScanJob, ScanJob, SeveritySummary},
    runner::{options::normalize_options, ScanOptions},
    AppState,
};

const RAW_PREVIEW_CHARS: usize = 200;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/categories", get(list_categories))
        .route("/api/scans", post(create_scan))
        .route("/api/scans/:id", get(get_scan))
        .route("/api/scans/:id/findings", get(get_findings))
        .with_state(state)
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let running = state.runner_state.lock().await.running;
    Json(json!({"status": "ok", "service": "tooldock", "running_jobs": running}))
}

pub async fn list_tools(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let tools = state.store.list_tools().await?;
    Ok(Json(json!({"ok": true, "data": tools})))
}

pub async fn list_categories(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let categories = state.store.list_categories().await?;
    Ok(Json(json!({"ok": true, "data": categories})))
}

#[derive(Debug, Deserialize)]
pub struct CreateScanRequest {
    target: String,
    tool: String,
    input_type: String,
    #[serde(default)]
    consent: bool,
    #[serde(default)]
    options: Value,
}

pub async fn create_scan(
    State(state): State<AppState>,
    Json(payload): Json<CreateScanRequest>,
) -> Result<Response, ApiError> {
    if !payload.consent {
        return Err(ApiError::BadRequest(
            "consent must be true to start the scan".into(),
        ));
    }

    let tool = state
        .store
        .get_tool(&payload.tool)
        .await?
        .ok_or_else(|| ApiError::BadRequest(format!("unknown tool: {}", payload.tool)))?;
    if !tool.supported_input_types.contains(&payload.input_type) {
        return Err(ApiError::BadRequest(format!(
            "{} not supported by {}",
            payload.input_type, tool.name
        )));
    }
    validate_target(&payload.input_type, &payload.target).map_err(ApiError::BadRequest)?;

    if !state.rate_limiter.lock().await.allow() {
        return Err(ApiError::RateLimited);
    }

    let options = Value::Object(normalize_options(&payload.options));
    let quick = ScanOptions::from_value(&options).is_quick();
    let job = state
        .store
        .create_job(NewScanJob {
            tool: tool.name.clone(),
            target: payload.target,
            input_type: payload.input_type,
            options,
            consent: payload.consent,
        })
        .await?;
    info!(job_id = %job.id, tool = %job.tool, target = %job.target, quick, "scan queued");

    if state.queue.send(QueuedJob { id: job.id }).await.is_err() {
        return Err(ApiError::Internal(format!(
            "job queue closed, scan {} left queued",
            job.id
        )));
    }

    if !quick {
        let data = json!({
            "job_id": job.id,
            "target": job.target,
            "tool": job.tool,
            "status": job.status,
            "progress": job.progress,
            "created_at": utc_seconds(job.created_at),
            "estimated_duration": tool.estimated_duration,
        });
        return Ok((StatusCode::ACCEPTED, Json(json!({"ok": true, "data": data}))).into_response());
    }

    let outcome = wait_for_completion(
        state.store.as_ref(),
        job.id,
        state.config.quick_wait_timeout(),
        state.config.quick_poll_interval(),
    )
    .await?;

    match outcome {
        WaitOutcome::Finished(job) if job.status == JobStatus::Completed => {
            quick_result(&state, job).await
        }
        WaitOutcome::Finished(job) => {
            warn!(job_id = %job.id, reason = %job.current_step, "quick scan failed");
            let body = json!({
                "status": "failed",
                "message": "Quick scan task failed",
                "error": job.current_step,
                "job_id": job.id,
            });
            Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response())
        }
        WaitOutcome::StillRunning(job) => {
            let data = json!({
                "job_id": job.id,
                "status": job.status,
                "progress": job.progress,
                "message": "Quick scan still running; check status later.",
            });
            Ok((StatusCode::ACCEPTED, Json(json!({"ok": true, "data": data}))).into_response())
        }
    }
}

async fn quick_result(state: &AppState, job: ScanJob) -> Result<Response, ApiError> {
    let findings = state.store.list_findings(job.id).await?;
    let summary = SeveritySummary::from_findings(findings.iter().map(|f| &f.fields));
    let preview: String = job
        .raw_output
        .as_deref()
        .unwrap_or_default()
        .chars()
        .take(RAW_PREVIEW_CHARS)
        .collect();

    let data = json!({
        "job_id": job.id,
        "target": job.target,
        "tool": job.tool,
        "status": job.status,
        "progress": job.progress,
        "created_at": utc_seconds(job.created_at),
        "findings": findings,
        "summary": summary,
        "raw_output_preview": preview,
    });
    Ok((StatusCode::OK, Json(json!({"ok": true, "data": data}))).into_response())
}

pub async fn get_scan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let job = state.store.get(id).await?;
    Ok(Json(json!({"ok": true, "data": job})))
}

pub async fn get_findings(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let job = state.store.get(id).await?;
    let findings = state.store.list_findings(job.id).await?;
    let summary = SeveritySummary::from_findings(findings.iter().map(|f| &f.fields));
    Ok(Json(json!({
        "ok": true,
        "data": {"job_id": job.id, "status": job.status, "findings": findings, "summary": summary}
    })))
}

fn utc_seconds(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn validate_target(input_type: &str, target: &str) -> Result<(), String> {
    let target = target.trim();
    if target.is_empty() {
        return Err("target must not be empty".into());
    }
    if target.starts_with('-') {
        return Err("target must not start with '-'".into());
    }

    match input_type {
        "ip" => target
            .parse::<IpAddr>()
            .map(|_| ())
            .map_err(|_| format!("{target} is not an IP address")),
        "ip_range" => {
            if target.parse::<IpNet>().is_ok() || target.parse::<IpAddr>().is_ok() {
                Ok(())
            } else {
                Err(format!("{target} is not a CIDR range"))
            }
        }
        "url" => {
            let rest = target
                .strip_prefix("https://")
                .or_else(|| target.strip_prefix("http://"))
                .ok_or_else(|| format!("{target} is not an http(s) URL"))?;
            let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
            if host.is_empty() {
                Err(format!("{target} has no host"))
            } else {
                Ok(())
            }
        }
        "domain" | "host" => {
            let valid = target
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
            if valid {
                Ok(())
            } else {
                Err(format!("{target} is not a valid hostname"))
            }
        }
        _ => Ok(()),
    }
}
