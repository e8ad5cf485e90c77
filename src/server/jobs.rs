//! Sync job API for collaborating services.
//!
//! Both endpoints require `Authorization: Bearer <token>` matching the
//! configured API token. End-user authentication and ownership checks live
//! in the service that calls these.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use super::AppState;
use crate::store::StoreError;
use crate::store::jobs::RECENT_JOBS_LIMIT;
use crate::types::{JobId, JobKind, JobStatus, Project, ProjectId, SyncJob};

#[derive(Debug, Error)]
pub enum JobsApiError {
    #[error("API token not configured")]
    NotConfigured,

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("invalid project id: {0}")]
    InvalidProjectId(String),

    #[error("project not found: {0}")]
    ProjectNotFound(ProjectId),

    #[error("{context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },
}

impl JobsApiError {
    fn code(&self) -> &'static str {
        match self {
            JobsApiError::NotConfigured => "api_token_not_configured",
            JobsApiError::Unauthorized => "unauthorized",
            JobsApiError::InvalidProjectId(_) => "invalid_project_id",
            JobsApiError::ProjectNotFound(_) => "project_not_found",
            JobsApiError::Store { context, .. } => *context,
        }
    }
}

impl IntoResponse for JobsApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            JobsApiError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            JobsApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            JobsApiError::InvalidProjectId(_) => StatusCode::BAD_REQUEST,
            JobsApiError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            JobsApiError::Store { .. } => {
                warn!(error = %self, "jobs API store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.code() }))).into_response()
    }
}

/// One row of the job listing.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub job_type: JobKind,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SyncJob> for JobView {
    fn from(job: SyncJob) -> Self {
        JobView {
            id: job.id,
            job_type: job.kind,
            status: job.status,
            run_at: job.run_at,
            attempts: job.attempts,
            last_error: job.last_error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Compares without short-circuiting on the first differing byte.
fn tokens_match(given: &[u8], expected: &[u8]) -> bool {
    given.len() == expected.len()
        && given
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn authorize(app_state: &AppState, headers: &HeaderMap) -> Result<(), JobsApiError> {
    let expected = app_state.api_token().ok_or(JobsApiError::NotConfigured)?;
    let given = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(JobsApiError::Unauthorized)?;
    if tokens_match(given.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(JobsApiError::Unauthorized)
    }
}

async fn load_project(app_state: &AppState, raw_id: &str) -> Result<Project, JobsApiError> {
    let id: ProjectId = raw_id
        .parse()
        .map_err(|_| JobsApiError::InvalidProjectId(raw_id.to_string()))?;
    app_state
        .store()
        .get_project(id)
        .await
        .map_err(|source| JobsApiError::Store {
            context: "project_lookup_failed",
            source,
        })?
        .ok_or(JobsApiError::ProjectNotFound(id))
}

/// `POST /api/v1/projects/{id}/sync`: queues one job of each kind.
pub async fn sync_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<serde_json::Value>), JobsApiError> {
    authorize(&app_state, &headers)?;
    let project = load_project(&app_state, &id).await?;

    let jobs = app_state
        .store()
        .enqueue(project.id, &JobKind::ALL, Utc::now())
        .await
        .map_err(|source| JobsApiError::Store {
            context: "enqueue_failed",
            source,
        })?;
    info!(project_id = %project.id, jobs = jobs.len(), "full sync queued");

    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": true }))))
}

/// `GET /api/v1/projects/{id}/jobs`: the most recent jobs, newest first.
pub async fn jobs_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, JobsApiError> {
    authorize(&app_state, &headers)?;
    let project = load_project(&app_state, &id).await?;

    let jobs: Vec<JobView> = app_state
        .store()
        .recent_jobs(project.id, RECENT_JOBS_LIMIT)
        .await
        .map_err(|source| JobsApiError::Store {
            context: "jobs_list_failed",
            source,
        })?
        .into_iter()
        .map(JobView::from)
        .collect();

    Ok(Json(json!({ "jobs": jobs })))
}
