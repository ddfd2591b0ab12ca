use super::ApiResult;
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use conductor_core::events::Event;
use conductor_core::metrics::MetricsSnapshot;
use conductor_core::{
    Job, JobFilter, JobId, JobState, JobSummary, Page, Paginated, Workflow, WorkflowDefinition,
    WorkflowFilter, WorkflowId, WorkflowSummary,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Paging plus filters, flattened into the query string
#[derive(Debug, Default, Deserialize)]
pub struct ListWorkflowsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    /// Case-insensitive name substring
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub state: Option<JobState>,
    pub workflow_id: Option<Uuid>,
}

fn page(page: Option<u32>, limit: Option<u32>) -> Page {
    let default = Page::default();
    Page::new(page.unwrap_or(default.page), limit.unwrap_or(default.limit))
}

pub async fn create_workflow(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let workflow = state.orchestrator.create_workflow(definition).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListWorkflowsQuery>,
) -> Json<Paginated<WorkflowSummary>> {
    let filter = WorkflowFilter {
        name_contains: query.name,
    };
    Json(
        state
            .orchestrator
            .list_workflows(&filter, page(query.page, query.limit))
            .await,
    )
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    let workflow = state.orchestrator.get_workflow(WorkflowId(workflow_id)).await?;
    Ok(Json(workflow))
}

pub async fn update_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(definition): Json<WorkflowDefinition>,
) -> ApiResult<Json<Workflow>> {
    let workflow = state
        .orchestrator
        .update_workflow(WorkflowId(workflow_id), definition)
        .await?;
    Ok(Json(workflow))
}

pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_workflow(WorkflowId(workflow_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create a job from the workflow and start it right away
pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let job = state.orchestrator.create_job(WorkflowId(workflow_id)).await?;
    let job = state.orchestrator.start_job(job.id).await?;

    tracing::info!(job_id = %job.id, workflow_id = %workflow_id, "Started workflow execution");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub workflow_id: WorkflowId,
    /// Start the job immediately (default: false)
    #[serde(default)]
    pub start: bool,
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let mut job = state.orchestrator.create_job(req.workflow_id).await?;
    if req.start {
        job = state.orchestrator.start_job(job.id).await?;
    }
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Json<Paginated<JobSummary>> {
    let filter = JobFilter {
        state: query.state,
        workflow_id: query.workflow_id.map(WorkflowId),
    };
    Json(
        state
            .orchestrator
            .list_jobs(&filter, page(query.page, query.limit))
            .await,
    )
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.orchestrator.get_job(JobId(job_id)).await?))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_job(JobId(job_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.orchestrator.start_job(JobId(job_id)).await?))
}

pub async fn execute_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.orchestrator.execute_job(JobId(job_id)).await?))
}

pub async fn stop_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.orchestrator.stop_job(JobId(job_id)).await?))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.orchestrator.cancel_job(JobId(job_id)).await?))
}

/// Get events for a job
pub async fn get_job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Event>>> {
    Ok(Json(state.orchestrator.job_events(JobId(job_id)).await?))
}

pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.orchestrator.metrics())
}
