use axum::{
    extract::{Path, State},
    Json,
};
use data_model::{EdgeJob, EdgeJobId, EdgeJobLogsStatus, EndpointId};
use state_store::requests::{EdgeJobTaskRequest, RequestPayload, WriteOutcome};

use super::routes_state::RouteState;
use crate::http_objects::{
    CreateEdgeJob,
    CreatedResponse,
    EdgeAPIError,
    EdgeJobList,
    EdgeJobResponse,
};

fn get_job(state: &RouteState, id: EdgeJobId) -> Result<EdgeJob, EdgeAPIError> {
    state
        .edge_state
        .reader()
        .get_edge_job(id)?
        .ok_or_else(|| EdgeAPIError::not_found(&format!("edge job {} not found", id)))
}

/// Create an edge job
#[utoipa::path(
    post,
    path = "/edge_jobs",
    tag = "edge_jobs",
    request_body = CreateEdgeJob,
    responses(
        (status = 200, description = "job created", body = CreatedResponse),
        (status = NOT_FOUND, description = "edge group or endpoint not found")
    ),
)]
pub async fn create_edge_job(
    State(state): State<RouteState>,
    Json(body): Json<CreateEdgeJob>,
) -> Result<Json<CreatedResponse>, EdgeAPIError> {
    if body.edge_groups.is_empty() && body.endpoints.is_empty() {
        return Err(EdgeAPIError::bad_request("edge job has no target"));
    }
    let result = state
        .write(RequestPayload::CreateEdgeJob(body.into()))
        .await?;
    let WriteOutcome::Created(id) = result.outcome else {
        return Err(EdgeAPIError::internal_error(anyhow::anyhow!(
            "unexpected outcome for edge job creation"
        )));
    };
    Ok(Json(CreatedResponse { id }))
}

/// List edge jobs
#[utoipa::path(
    get,
    path = "/edge_jobs",
    tag = "edge_jobs",
    responses(
        (status = 200, description = "all edge jobs", body = EdgeJobList),
    ),
)]
pub async fn list_edge_jobs(
    State(state): State<RouteState>,
) -> Result<Json<EdgeJobList>, EdgeAPIError> {
    let edge_jobs = state
        .edge_state
        .reader()
        .list_edge_jobs()?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(EdgeJobList { edge_jobs }))
}

/// Get an edge job
#[utoipa::path(
    get,
    path = "/edge_jobs/{id}",
    tag = "edge_jobs",
    params(("id" = u64, Path, description = "edge job id")),
    responses(
        (status = 200, description = "the edge job", body = EdgeJobResponse),
        (status = NOT_FOUND, description = "job not found")
    ),
)]
pub async fn get_edge_job(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<Json<EdgeJobResponse>, EdgeAPIError> {
    Ok(Json(get_job(&state, EdgeJobId::new(id))?.into()))
}

/// Delete an edge job
#[utoipa::path(
    delete,
    path = "/edge_jobs/{id}",
    tag = "edge_jobs",
    params(("id" = u64, Path, description = "edge job id")),
    responses(
        (status = 200, description = "job deleted"),
        (status = NOT_FOUND, description = "job not found")
    ),
)]
pub async fn delete_edge_job(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<(), EdgeAPIError> {
    state
        .write(RequestPayload::DeleteEdgeJob(EdgeJobId::new(id)))
        .await?;
    Ok(())
}

/// Ask an endpoint to upload the job's log
#[utoipa::path(
    post,
    path = "/edge_jobs/{id}/tasks/{endpoint_id}/logs",
    tag = "edge_jobs",
    params(
        ("id" = u64, Path, description = "edge job id"),
        ("endpoint_id" = u64, Path, description = "endpoint id"),
    ),
    responses(
        (status = 200, description = "log collection requested"),
        (status = NOT_FOUND, description = "job does not target the endpoint")
    ),
)]
pub async fn request_job_logs(
    Path((id, endpoint_id)): Path<(u64, u64)>,
    State(state): State<RouteState>,
) -> Result<(), EdgeAPIError> {
    state
        .write(RequestPayload::RequestEdgeJobLogs(EdgeJobTaskRequest {
            job_id: EdgeJobId::new(id),
            endpoint_id: EndpointId::new(endpoint_id),
        }))
        .await?;
    Ok(())
}

/// Collected log of a job run on an endpoint
#[utoipa::path(
    get,
    path = "/edge_jobs/{id}/tasks/{endpoint_id}/logs",
    tag = "edge_jobs",
    params(
        ("id" = u64, Path, description = "edge job id"),
        ("endpoint_id" = u64, Path, description = "endpoint id"),
    ),
    responses(
        (status = 200, description = "the log", body = String, content_type = "text/plain"),
        (status = NOT_FOUND, description = "no log collected")
    ),
)]
pub async fn get_job_logs(
    Path((id, endpoint_id)): Path<(u64, u64)>,
    State(state): State<RouteState>,
) -> Result<String, EdgeAPIError> {
    let job = get_job(&state, EdgeJobId::new(id))?;
    let endpoint_id = EndpointId::new(endpoint_id);
    if job.endpoint_meta(endpoint_id).logs_status != EdgeJobLogsStatus::Collected {
        return Err(EdgeAPIError::not_found(&format!(
            "no log collected for edge job {} on endpoint {}",
            job.id, endpoint_id
        )));
    }
    let logs = state
        .blob_storage
        .read_optional(&EdgeJob::logs_key(job.id, endpoint_id))
        .await
        .map_err(EdgeAPIError::internal_error)?
        .ok_or_else(|| EdgeAPIError::not_found("collected log is missing"))?;
    Ok(String::from_utf8_lossy(&logs).into_owned())
}
