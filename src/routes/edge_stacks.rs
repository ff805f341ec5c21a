use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use data_model::{EdgeStack, EdgeStackId, StackDeploymentType};
use state_store::{
    requests::{CreateEdgeStackRequest, RequestPayload, UpdateEdgeStackRequest},
    state_machine::EdgeObjectsColumns,
};
use tracing::error;

use super::routes_state::RouteState;
use crate::http_objects::{
    CreateEdgeStack,
    CreatedResponse,
    EdgeAPIError,
    EdgeStackList,
    EdgeStackResponse,
    UpdateEdgeStack,
};

fn default_entry_point(deployment_type: StackDeploymentType) -> &'static str {
    match deployment_type {
        StackDeploymentType::Compose => "docker-compose.yml",
        StackDeploymentType::Kubernetes => "manifest.yml",
    }
}

fn get_stack(state: &RouteState, id: EdgeStackId) -> Result<EdgeStack, EdgeAPIError> {
    state
        .edge_state
        .reader()
        .get_edge_stack(id)?
        .ok_or_else(|| EdgeAPIError::not_found(&format!("edge stack {} not found", id)))
}

async fn store_stack_file(
    state: &RouteState,
    id: EdgeStackId,
    file_version: u32,
    entry_point: &str,
    content: String,
) -> Result<(), EdgeAPIError> {
    state
        .blob_storage
        .put(
            &EdgeStack::file_key(id, file_version, entry_point),
            Bytes::from(content),
        )
        .await
        .map_err(EdgeAPIError::internal_error)?;
    Ok(())
}

/// Create an edge stack
#[utoipa::path(
    post,
    path = "/edge_stacks",
    tag = "edge_stacks",
    request_body = CreateEdgeStack,
    responses(
        (status = 200, description = "stack created and deployed to its groups", body = CreatedResponse),
        (status = NOT_FOUND, description = "edge group not found")
    ),
)]
pub async fn create_edge_stack(
    State(state): State<RouteState>,
    Json(body): Json<CreateEdgeStack>,
) -> Result<Json<CreatedResponse>, EdgeAPIError> {
    if body.stack_file_content.trim().is_empty() {
        return Err(EdgeAPIError::bad_request("stack file content is empty"));
    }
    let entry_point = body
        .entry_point
        .clone()
        .filter(|entry_point| !entry_point.is_empty())
        .unwrap_or_else(|| default_entry_point(body.deployment_type).to_string());
    let id = EdgeStackId::new(state.edge_state.allocate_id(EdgeObjectsColumns::EdgeStacks)?);
    store_stack_file(&state, id, 1, &entry_point, body.stack_file_content).await?;

    let request = CreateEdgeStackRequest {
        id,
        name: body.name,
        edge_groups: body.edge_groups.into_iter().map(Into::into).collect(),
        deployment_type: body.deployment_type,
        entry_point,
        scheduled_time: body.scheduled_time.filter(|time| !time.is_empty()),
        update_schedule_id: None,
    };
    if let Err(err) = state.write(RequestPayload::CreateEdgeStack(request)).await {
        state.delete_blobs(&EdgeStack::files_prefix(id)).await;
        return Err(err);
    }
    Ok(Json(CreatedResponse { id: id.get() }))
}

/// Change an edge stack
#[utoipa::path(
    put,
    path = "/edge_stacks/{id}",
    tag = "edge_stacks",
    request_body = UpdateEdgeStack,
    params(("id" = u64, Path, description = "edge stack id")),
    responses(
        (status = 200, description = "stack updated"),
        (status = NOT_FOUND, description = "stack or edge group not found")
    ),
)]
pub async fn update_edge_stack(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
    Json(body): Json<UpdateEdgeStack>,
) -> Result<(), EdgeAPIError> {
    let stack = get_stack(&state, EdgeStackId::new(id))?;
    if stack.update_schedule_id.is_some() {
        return Err(EdgeAPIError::bad_request(
            "stack belongs to an update schedule, change the schedule instead",
        ));
    }
    if let Some(rollback_to) = body.rollback_to {
        if rollback_to == 0 || rollback_to > stack.stack_file_version {
            return Err(EdgeAPIError::bad_request(&format!(
                "no file version {} to roll back to",
                rollback_to
            )));
        }
    }

    let mut file_version = None;
    if let Some(content) = body.stack_file_content {
        let next = stack.stack_file_version + 1;
        store_stack_file(&state, stack.id, next, &stack.entry_point, content).await?;
        file_version = Some(next);
    }
    let request = UpdateEdgeStackRequest {
        id: stack.id,
        edge_groups: body
            .edge_groups
            .map(|groups| groups.into_iter().map(Into::into).collect()),
        file_version,
        redeploy: body.redeploy,
        rollback_to: body.rollback_to,
        scheduled_time: body
            .scheduled_time
            .map(|time| Some(time).filter(|time| !time.is_empty())),
    };
    if let Err(err) = state.write(RequestPayload::UpdateEdgeStack(request)).await {
        if let Some(file_version) = file_version {
            let key = EdgeStack::file_key(stack.id, file_version, &stack.entry_point);
            if let Err(del_err) = state.blob_storage.delete(&key).await {
                error!(key, "failed to remove stack file: {:?}", del_err);
            }
        }
        return Err(err);
    }
    Ok(())
}

/// Delete an edge stack
#[utoipa::path(
    delete,
    path = "/edge_stacks/{id}",
    tag = "edge_stacks",
    params(("id" = u64, Path, description = "edge stack id")),
    responses(
        (status = 200, description = "stack deleted and removed from its endpoints"),
        (status = NOT_FOUND, description = "stack not found")
    ),
)]
pub async fn delete_edge_stack(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<(), EdgeAPIError> {
    let stack = get_stack(&state, EdgeStackId::new(id))?;
    if stack.update_schedule_id.is_some() {
        return Err(EdgeAPIError::bad_request(
            "stack belongs to an update schedule, delete the schedule instead",
        ));
    }
    state
        .write(RequestPayload::DeleteEdgeStack(stack.id))
        .await?;
    Ok(())
}

/// List edge stacks
#[utoipa::path(
    get,
    path = "/edge_stacks",
    tag = "edge_stacks",
    responses(
        (status = 200, description = "all edge stacks", body = EdgeStackList),
    ),
)]
pub async fn list_edge_stacks(
    State(state): State<RouteState>,
) -> Result<Json<EdgeStackList>, EdgeAPIError> {
    let edge_stacks = state
        .edge_state
        .reader()
        .list_edge_stacks()?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(EdgeStackList { edge_stacks }))
}

/// Get an edge stack with its per-endpoint status
#[utoipa::path(
    get,
    path = "/edge_stacks/{id}",
    tag = "edge_stacks",
    params(("id" = u64, Path, description = "edge stack id")),
    responses(
        (status = 200, description = "the edge stack", body = EdgeStackResponse),
        (status = NOT_FOUND, description = "stack not found")
    ),
)]
pub async fn get_edge_stack(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<Json<EdgeStackResponse>, EdgeAPIError> {
    Ok(Json(get_stack(&state, EdgeStackId::new(id))?.into()))
}
