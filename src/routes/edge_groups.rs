use axum::{
    extract::{Path, State},
    Json,
};
use data_model::EdgeGroupId;
use state_store::requests::{RequestPayload, WriteOutcome};

use super::routes_state::RouteState;
use crate::http_objects::{
    CreatedResponse,
    EdgeAPIError,
    EdgeGroupBody,
    EdgeGroupList,
    EdgeGroupResponse,
};

/// Create an edge group
#[utoipa::path(
    post,
    path = "/edge_groups",
    tag = "edge_groups",
    request_body = EdgeGroupBody,
    responses(
        (status = 200, description = "group created", body = CreatedResponse),
    ),
)]
pub async fn create_edge_group(
    State(state): State<RouteState>,
    Json(body): Json<EdgeGroupBody>,
) -> Result<Json<CreatedResponse>, EdgeAPIError> {
    let result = state
        .write(RequestPayload::CreateEdgeGroup(body.into()))
        .await?;
    let WriteOutcome::Created(id) = result.outcome else {
        return Err(EdgeAPIError::internal_error(anyhow::anyhow!(
            "unexpected outcome for edge group creation"
        )));
    };
    Ok(Json(CreatedResponse { id }))
}

/// List edge groups
#[utoipa::path(
    get,
    path = "/edge_groups",
    tag = "edge_groups",
    responses(
        (status = 200, description = "all edge groups", body = EdgeGroupList),
    ),
)]
pub async fn list_edge_groups(
    State(state): State<RouteState>,
) -> Result<Json<EdgeGroupList>, EdgeAPIError> {
    let edge_groups = state
        .edge_state
        .reader()
        .list_edge_groups()?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(EdgeGroupList { edge_groups }))
}

/// Get an edge group
#[utoipa::path(
    get,
    path = "/edge_groups/{id}",
    tag = "edge_groups",
    params(("id" = u64, Path, description = "edge group id")),
    responses(
        (status = 200, description = "the edge group", body = EdgeGroupResponse),
        (status = NOT_FOUND, description = "group not found")
    ),
)]
pub async fn get_edge_group(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<Json<EdgeGroupResponse>, EdgeAPIError> {
    let id = EdgeGroupId::new(id);
    let group = state
        .edge_state
        .reader()
        .get_edge_group(id)?
        .ok_or_else(|| EdgeAPIError::not_found(&format!("edge group {} not found", id)))?;
    Ok(Json(group.into()))
}

/// Change an edge group's name or membership
#[utoipa::path(
    put,
    path = "/edge_groups/{id}",
    tag = "edge_groups",
    request_body = EdgeGroupBody,
    params(("id" = u64, Path, description = "edge group id")),
    responses(
        (status = 200, description = "group updated"),
        (status = NOT_FOUND, description = "group not found")
    ),
)]
pub async fn update_edge_group(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
    Json(body): Json<EdgeGroupBody>,
) -> Result<(), EdgeAPIError> {
    state
        .write(RequestPayload::UpdateEdgeGroup((
            EdgeGroupId::new(id),
            body.into(),
        )))
        .await?;
    Ok(())
}

/// Delete an unused edge group
#[utoipa::path(
    delete,
    path = "/edge_groups/{id}",
    tag = "edge_groups",
    params(("id" = u64, Path, description = "edge group id")),
    responses(
        (status = 200, description = "group deleted"),
        (status = BAD_REQUEST, description = "group is still referenced"),
        (status = NOT_FOUND, description = "group not found")
    ),
)]
pub async fn delete_edge_group(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<(), EdgeAPIError> {
    state
        .write(RequestPayload::DeleteEdgeGroup(EdgeGroupId::new(id)))
        .await?;
    Ok(())
}
