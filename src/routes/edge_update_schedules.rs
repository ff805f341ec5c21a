use std::collections::BTreeSet;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use data_model::{
    related_endpoints,
    EdgeGroupId,
    EdgeStack,
    EdgeStackId,
    EndpointId,
    UpdateSchedule,
    UpdateScheduleId,
};
use state_store::{
    requests::{RequestPayload, UpdateScheduleRequest, WriteOutcome},
    state_machine::EdgeObjectsColumns,
    update_schedules::UPDATER_ENTRY_POINT,
};
use tracing::info;

use super::routes_state::RouteState;
use crate::http_objects::{
    CreatedResponse,
    EdgeAPIError,
    ScheduleStatusParams,
    UpdateScheduleBody,
    UpdateScheduleList,
    UpdateScheduleResponse,
    UpdateScheduleStatus,
};

/// Compose file of the stack that swaps the agent for `version`.
pub fn updater_compose(image: &str, version: &str, schedule_id: UpdateScheduleId) -> String {
    format!(
        r#"services:
  updater:
    image: {image}
    command: ["--update", "--version", "{version}"]
    environment:
      - EDGE_UPDATE_ID={schedule_id}
      - EDGE_TARGET_VERSION={version}
    volumes:
      - /var/run/docker.sock:/var/run/docker.sock
    restart: "no"
"#
    )
}

/// Endpoints the groups resolve to right now.
fn resolve_targets(
    state: &RouteState,
    group_ids: &BTreeSet<EdgeGroupId>,
) -> Result<BTreeSet<EndpointId>, EdgeAPIError> {
    let reader = state.edge_state.reader();
    let groups = reader.list_edge_groups()?;
    for group_id in group_ids {
        if !groups.iter().any(|group| group.id == *group_id) {
            return Err(EdgeAPIError::not_found(&format!("edge group {} not found", group_id)));
        }
    }
    let endpoints = reader.list_endpoints()?;
    let targets = related_endpoints(
        groups.iter().filter(|group| group_ids.contains(&group.id)),
        &endpoints,
    );
    if targets.is_empty() {
        return Err(EdgeAPIError::bad_request("update schedule targets no endpoint"));
    }
    Ok(targets)
}

async fn store_updater_file(
    state: &RouteState,
    stack_id: EdgeStackId,
    file_version: u32,
    schedule_id: UpdateScheduleId,
    version: &str,
) -> Result<(), EdgeAPIError> {
    let content = updater_compose(&state.config.edge.updater_image, version, schedule_id);
    state
        .blob_storage
        .put(
            &EdgeStack::file_key(stack_id, file_version, UPDATER_ENTRY_POINT),
            Bytes::from(content),
        )
        .await
        .map_err(EdgeAPIError::internal_error)?;
    Ok(())
}

fn get_schedule(state: &RouteState, id: UpdateScheduleId) -> Result<UpdateSchedule, EdgeAPIError> {
    state
        .edge_state
        .reader()
        .get_update_schedule(id)?
        .ok_or_else(|| EdgeAPIError::not_found(&format!("update schedule {} not found", id)))
}

fn schedule_response(
    state: &RouteState,
    schedule: UpdateSchedule,
    include_status: bool,
) -> Result<UpdateScheduleResponse, EdgeAPIError> {
    let status = if include_status {
        let stack = state
            .edge_state
            .reader()
            .get_edge_stack(schedule.edge_stack_id)?;
        Some(UpdateScheduleStatus::from_stack(&schedule, stack.as_ref()))
    } else {
        None
    };
    Ok(UpdateScheduleResponse::new(schedule, status))
}

/// Create an agent update schedule
#[utoipa::path(
    post,
    path = "/edge_update_schedules",
    tag = "edge_update_schedules",
    request_body = UpdateScheduleBody,
    responses(
        (status = 200, description = "schedule created", body = CreatedResponse),
        (status = BAD_REQUEST, description = "no targets, or an endpoint is in another active schedule"),
        (status = NOT_FOUND, description = "edge group not found")
    ),
)]
pub async fn create_update_schedule(
    State(state): State<RouteState>,
    Json(body): Json<UpdateScheduleBody>,
) -> Result<Json<CreatedResponse>, EdgeAPIError> {
    let group_ids = body.group_ids();
    let targets = resolve_targets(&state, &group_ids)?;
    let id = UpdateScheduleId::new(state.edge_state.allocate_id(EdgeObjectsColumns::UpdateSchedules)?);
    let stack_id = EdgeStackId::new(state.edge_state.allocate_id(EdgeObjectsColumns::EdgeStacks)?);

    let reserved = state.update_schedules.reserve(id, &targets).await?;
    let written = async {
        store_updater_file(&state, stack_id, 1, id, &body.version).await?;
        state
            .write(RequestPayload::CreateUpdateSchedule(UpdateScheduleRequest {
                id,
                name: body.name.clone(),
                version: body.version.clone(),
                schedule_type: body.schedule_type,
                edge_group_ids: group_ids,
                scheduled_time: body.scheduled_time.clone(),
                created_by: body.created_by.clone(),
                edge_stack_id: stack_id,
                file_version: None,
                reserved_endpoints: targets.clone(),
            }))
            .await
    }
    .await;
    match written {
        Ok(result) => {
            if let WriteOutcome::UpdateSchedule(outcome) = result.outcome {
                state.update_schedules.retain(id, &outcome.endpoints).await;
            }
            info!(update_schedule_id = %id, version = body.version, "update schedule created");
            Ok(Json(CreatedResponse { id: id.get() }))
        }
        Err(err) => {
            state.update_schedules.release(id, &reserved).await;
            state.delete_blobs(&EdgeStack::files_prefix(stack_id)).await;
            Err(err)
        }
    }
}

/// Change an agent update schedule
#[utoipa::path(
    put,
    path = "/edge_update_schedules/{id}",
    tag = "edge_update_schedules",
    request_body = UpdateScheduleBody,
    params(("id" = u64, Path, description = "update schedule id")),
    responses(
        (status = 200, description = "schedule updated"),
        (status = BAD_REQUEST, description = "no targets, or an endpoint is in another active schedule"),
        (status = NOT_FOUND, description = "schedule or edge group not found")
    ),
)]
pub async fn update_update_schedule(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
    Json(body): Json<UpdateScheduleBody>,
) -> Result<(), EdgeAPIError> {
    let id = UpdateScheduleId::new(id);
    let schedule = get_schedule(&state, id)?;
    let group_ids = body.group_ids();
    let targets = resolve_targets(&state, &group_ids)?;

    let reserved = state.update_schedules.reserve(id, &targets).await?;
    let written = async {
        let mut file_version = None;
        if body.version != schedule.version {
            let stack = state
                .edge_state
                .reader()
                .get_edge_stack(schedule.edge_stack_id)?
                .ok_or_else(|| {
                    EdgeAPIError::not_found(&format!(
                        "edge stack {} of update schedule {} not found",
                        schedule.edge_stack_id, id
                    ))
                })?;
            let next = stack.stack_file_version + 1;
            store_updater_file(&state, stack.id, next, id, &body.version).await?;
            file_version = Some(next);
        }
        state
            .write(RequestPayload::UpdateUpdateSchedule(UpdateScheduleRequest {
                id,
                name: body.name.clone(),
                version: body.version.clone(),
                schedule_type: body.schedule_type,
                edge_group_ids: group_ids,
                scheduled_time: body.scheduled_time.clone(),
                created_by: body.created_by.clone(),
                edge_stack_id: schedule.edge_stack_id,
                file_version,
                reserved_endpoints: targets.clone(),
            }))
            .await
    }
    .await;
    match written {
        Ok(result) => {
            if let WriteOutcome::UpdateSchedule(outcome) = result.outcome {
                state.update_schedules.retain(id, &outcome.endpoints).await;
            }
            Ok(())
        }
        Err(err) => {
            state.update_schedules.release(id, &reserved).await;
            Err(err)
        }
    }
}

/// Delete an agent update schedule
#[utoipa::path(
    delete,
    path = "/edge_update_schedules/{id}",
    tag = "edge_update_schedules",
    params(("id" = u64, Path, description = "update schedule id")),
    responses(
        (status = 200, description = "schedule and its updater stack deleted"),
        (status = NOT_FOUND, description = "schedule not found")
    ),
)]
pub async fn delete_update_schedule(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<(), EdgeAPIError> {
    let id = UpdateScheduleId::new(id);
    state
        .write(RequestPayload::DeleteUpdateSchedule(id))
        .await?;
    state.update_schedules.remove_schedule(id).await;
    Ok(())
}

/// List agent update schedules
#[utoipa::path(
    get,
    path = "/edge_update_schedules",
    tag = "edge_update_schedules",
    params(ScheduleStatusParams),
    responses(
        (status = 200, description = "all update schedules", body = UpdateScheduleList),
    ),
)]
pub async fn list_update_schedules(
    Query(params): Query<ScheduleStatusParams>,
    State(state): State<RouteState>,
) -> Result<Json<UpdateScheduleList>, EdgeAPIError> {
    let update_schedules = state
        .edge_state
        .reader()
        .list_update_schedules()?
        .into_iter()
        .map(|schedule| schedule_response(&state, schedule, params.include_status))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(UpdateScheduleList { update_schedules }))
}

/// Get an agent update schedule
#[utoipa::path(
    get,
    path = "/edge_update_schedules/{id}",
    tag = "edge_update_schedules",
    params(
        ("id" = u64, Path, description = "update schedule id"),
        ScheduleStatusParams,
    ),
    responses(
        (status = 200, description = "the update schedule", body = UpdateScheduleResponse),
        (status = NOT_FOUND, description = "schedule not found")
    ),
)]
pub async fn get_update_schedule(
    Path(id): Path<u64>,
    Query(params): Query<ScheduleStatusParams>,
    State(state): State<RouteState>,
) -> Result<Json<UpdateScheduleResponse>, EdgeAPIError> {
    let schedule = get_schedule(&state, UpdateScheduleId::new(id))?;
    Ok(Json(schedule_response(&state, schedule, params.include_status)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_updater_compose_carries_target_version() {
        let compose = updater_compose("edge/agent-updater:1.2", "2.19.0", UpdateScheduleId::new(4));
        assert!(compose.contains("image: edge/agent-updater:1.2"));
        assert!(compose.contains("\"--version\", \"2.19.0\""));
        assert!(compose.contains("EDGE_UPDATE_ID=4"));
    }
}
