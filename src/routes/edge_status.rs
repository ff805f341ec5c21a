use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use data_model::{
    EdgeError,
    EdgeJob,
    EdgeJobId,
    EdgeStack,
    EdgeStackId,
    Endpoint,
    EndpointId,
    UpdateScheduleId,
};
use edge_utils::is_scheduled_time_due;
use metrics::Increment;
use state_store::requests::{
    EdgeJobTaskRequest,
    RemoteUpdateSuccessRequest,
    RequestPayload,
    StackStatusReport,
    StatusCheckInRequest,
    WriteOutcome,
};
use tracing::{debug, info, warn};

use super::routes_state::RouteState;
use crate::{
    http_objects::{
        EdgeAPIError,
        EdgeStackFileResponse,
        EdgeStatusResponse,
        EdgeStatusStack,
        StackFileParams,
        StackStatusUpdate,
    },
    middleware::EdgeHeaders,
};

/// Synchronous agent check-in
#[utoipa::path(
    get,
    path = "/endpoints/{id}/edge/status",
    tag = "edge",
    params(
        ("id" = u64, Path, description = "endpoint id"),
        ("X-Edge-Id" = String, Header, description = "edge identifier of the agent"),
        ("X-Edge-Update-Id" = Option<u64>, Header, description = "update schedule the agent just applied"),
    ),
    responses(
        (status = 200, description = "tunnel, jobs, stacks and configurations of the endpoint", body = EdgeStatusResponse),
        (status = FORBIDDEN, description = "edge id mismatch or untrusted endpoint"),
        (status = NOT_FOUND, description = "endpoint not found")
    ),
)]
pub async fn status_check_in(
    Path(endpoint_id): Path<u64>,
    State(state): State<RouteState>,
    headers: EdgeHeaders,
) -> Result<Json<EdgeStatusResponse>, EdgeAPIError> {
    let _inc = Increment::inc(&state.metrics.status_check_ins, &[]);
    let endpoint_id = EndpointId::new(endpoint_id);
    let edge_id = headers.require_edge_id()?;

    let result = state
        .write(RequestPayload::StatusCheckIn(StatusCheckInRequest {
            endpoint_id,
            edge_id: edge_id.to_string(),
            agent: headers.agent.clone(),
        }))
        .await
        .inspect_err(|_| state.metrics.rejected_check_ins.add(1, &[]))?;
    let WriteOutcome::StatusCheckIn(outcome) = result.outcome else {
        return Err(EdgeAPIError::internal_error(anyhow::anyhow!(
            "unexpected outcome for status check-in"
        )));
    };
    let endpoint = outcome.endpoint;
    if !endpoint.user_trusted {
        state.metrics.rejected_check_ins.add(1, &[]);
        return Err(EdgeAPIError::forbidden("endpoint is not trusted"));
    }

    if let Some(schedule_id) = headers.update_id {
        confirm_remote_update(&state, &endpoint, schedule_id).await;
    }

    let tunnel = state.tunnels.check_in(endpoint_id).await;
    let schedules = state.tunnels.jobs(endpoint_id).await;
    let view = state
        .edge_state
        .status_cache
        .get_or_build(&state.edge_state.reader(), endpoint_id)
        .await?;

    let time_zone = endpoint.local_time_zone.as_deref();
    let now = Utc::now();
    let stacks = view
        .stacks
        .into_iter()
        .filter(|stack| {
            stack
                .scheduled_time
                .as_deref()
                .map_or(true, |scheduled| is_scheduled_time_due(scheduled, time_zone, now))
        })
        .map(|stack| EdgeStatusStack {
            id: stack.id.get(),
            name: stack.name,
            version: stack.version,
        })
        .collect();

    Ok(Json(EdgeStatusResponse {
        status: tunnel.status.to_string(),
        port: tunnel.port,
        credentials: tunnel.credentials,
        checkin_interval: endpoint
            .checkin_interval
            .resolve(state.config.edge.checkin_interval_secs),
        schedules,
        stacks,
        edge_configurations: view
            .edge_configurations
            .into_iter()
            .map(|(id, kind)| (id.get(), kind))
            .collect(),
    }))
}

/// The agent came back after an update. Once it runs the target version the
/// update is confirmed and the endpoint leaves the schedule.
async fn confirm_remote_update(
    state: &RouteState,
    endpoint: &Endpoint,
    schedule_id: UpdateScheduleId,
) {
    let schedule = match state.edge_state.reader().get_update_schedule(schedule_id) {
        Ok(Some(schedule)) => schedule,
        Ok(None) => {
            debug!(update_schedule_id = %schedule_id, "agent reported an unknown update schedule");
            return;
        }
        Err(err) => {
            warn!(update_schedule_id = %schedule_id, "failed to read update schedule: {:?}", err);
            return;
        }
    };
    if endpoint.agent.version.trim_start_matches('v') != schedule.version.trim_start_matches('v') {
        debug!(
            endpoint_id = %endpoint.id,
            agent_version = endpoint.agent.version,
            target_version = schedule.version,
            "agent not on the target version yet"
        );
        return;
    }

    let request = RemoteUpdateSuccessRequest {
        endpoint_id: endpoint.id,
        schedule_id,
    };
    if let Err(err) = state
        .apply(RequestPayload::MarkRemoteUpdateSuccess(request))
        .await
    {
        warn!(
            endpoint_id = %endpoint.id,
            update_schedule_id = %schedule_id,
            "failed to record remote update success: {:?}", err
        );
    }
    match state
        .update_schedules
        .remove_active_schedule(endpoint.id, schedule_id)
        .await
    {
        Ok(()) => info!(
            endpoint_id = %endpoint.id,
            update_schedule_id = %schedule_id,
            version = schedule.version,
            "remote update confirmed"
        ),
        Err(err) => warn!(endpoint_id = %endpoint.id, "{}", err),
    }
}

/// Stack file for an agent
#[utoipa::path(
    get,
    path = "/endpoints/{id}/edge/stacks/{stack_id}",
    tag = "edge",
    params(
        ("id" = u64, Path, description = "endpoint id"),
        ("stack_id" = u64, Path, description = "edge stack id"),
        ("X-Edge-Id" = String, Header, description = "edge identifier of the agent"),
        StackFileParams,
    ),
    responses(
        (status = 200, description = "stack file content", body = EdgeStackFileResponse),
        (status = FORBIDDEN, description = "edge id mismatch or untrusted endpoint"),
        (status = NOT_FOUND, description = "stack or file version not found")
    ),
)]
pub async fn get_stack_file(
    Path((endpoint_id, stack_id)): Path<(u64, u64)>,
    Query(params): Query<StackFileParams>,
    State(state): State<RouteState>,
    headers: EdgeHeaders,
) -> Result<Json<EdgeStackFileResponse>, EdgeAPIError> {
    let endpoint = state.agent_endpoint(EndpointId::new(endpoint_id), &headers)?;
    let stack_id = EdgeStackId::new(stack_id);
    let stack = state
        .edge_state
        .reader()
        .get_edge_stack(stack_id)?
        .filter(|stack| stack.status.contains_key(&endpoint.id))
        .ok_or_else(|| {
            EdgeAPIError::not_found(&format!(
                "edge stack {} is not deployed to endpoint {}",
                stack_id, endpoint.id
            ))
        })?;

    let file_version = params.version.unwrap_or(stack.stack_file_version);
    let key = EdgeStack::file_key(stack.id, file_version, &stack.entry_point);
    let content = state
        .blob_storage
        .read_optional(&key)
        .await
        .map_err(EdgeAPIError::internal_error)?
        .ok_or_else(|| {
            EdgeAPIError::not_found(&format!(
                "file version {} of edge stack {} not found",
                file_version, stack.id
            ))
        })?;
    let stack_file_content = String::from_utf8(content.to_vec())
        .map_err(|e| EdgeAPIError::internal_error(anyhow::anyhow!(e)))?;

    Ok(Json(EdgeStackFileResponse {
        name: stack.name,
        stack_file_content,
        file_version,
        deployment_type: stack.deployment_type,
        rollback_to: stack.rollback_to,
        registry_credentials: vec![],
    }))
}

/// Stack status report from a synchronous agent
#[utoipa::path(
    put,
    path = "/endpoints/{id}/edge/stacks/{stack_id}/status",
    tag = "edge",
    request_body = StackStatusUpdate,
    params(
        ("id" = u64, Path, description = "endpoint id"),
        ("stack_id" = u64, Path, description = "edge stack id"),
        ("X-Edge-Id" = String, Header, description = "edge identifier of the agent"),
    ),
    responses(
        (status = 200, description = "status recorded"),
        (status = BAD_REQUEST, description = "status does not apply to the stack"),
        (status = FORBIDDEN, description = "edge id mismatch or untrusted endpoint")
    ),
)]
pub async fn update_stack_status(
    Path((endpoint_id, stack_id)): Path<(u64, u64)>,
    State(state): State<RouteState>,
    headers: EdgeHeaders,
    Json(update): Json<StackStatusUpdate>,
) -> Result<(), EdgeAPIError> {
    let endpoint = state.agent_endpoint(EndpointId::new(endpoint_id), &headers)?;
    let report = StackStatusReport {
        stack_id: EdgeStackId::new(stack_id),
        endpoint_id: endpoint.id,
        status: update.status,
        error: update.error,
        version: update.version,
    };
    let result = match state.apply(RequestPayload::UpdateEdgeStackStatus(report)).await {
        Ok(result) => result,
        Err(err) => {
            if err
                .downcast_ref::<EdgeError>()
                .is_some_and(EdgeError::is_stale_report)
            {
                debug!(endpoint_id = %endpoint.id, "skipping stale stack status: {}", err);
                return Ok(());
            }
            return Err(err.into());
        }
    };
    if let WriteOutcome::StackStatus(outcome) = result.outcome {
        if let Some(schedule_id) = outcome.deployed_update {
            state
                .update_schedules
                .edge_stack_deployed(endpoint.id, schedule_id)
                .await;
        }
    }
    Ok(())
}

/// Job log upload
#[utoipa::path(
    post,
    path = "/endpoints/{id}/edge/jobs/{job_id}/logs",
    tag = "edge",
    request_body(content = String, content_type = "text/plain"),
    params(
        ("id" = u64, Path, description = "endpoint id"),
        ("job_id" = u64, Path, description = "edge job id"),
        ("X-Edge-Id" = String, Header, description = "edge identifier of the agent"),
    ),
    responses(
        (status = 200, description = "log stored"),
        (status = NOT_FOUND, description = "job does not target the endpoint")
    ),
)]
pub async fn upload_job_logs(
    Path((endpoint_id, job_id)): Path<(u64, u64)>,
    State(state): State<RouteState>,
    headers: EdgeHeaders,
    body: Bytes,
) -> Result<(), EdgeAPIError> {
    let endpoint = state.agent_endpoint(EndpointId::new(endpoint_id), &headers)?;
    let job_id = EdgeJobId::new(job_id);
    state
        .edge_state
        .reader()
        .get_edge_job(job_id)?
        .filter(|job| job.endpoints.contains_key(&endpoint.id))
        .ok_or_else(|| {
            EdgeAPIError::not_found(&format!(
                "edge job {} does not target endpoint {}",
                job_id, endpoint.id
            ))
        })?;

    let size = body.len();
    state
        .blob_storage
        .put(&EdgeJob::logs_key(job_id, endpoint.id), body)
        .await
        .map_err(EdgeAPIError::internal_error)?;
    state
        .write(RequestPayload::EdgeJobLogsCollected(EdgeJobTaskRequest {
            job_id,
            endpoint_id: endpoint.id,
        }))
        .await?;
    info!(edge_job_id = %job_id, endpoint_id = %endpoint.id, size, "stored edge job logs");
    Ok(())
}
