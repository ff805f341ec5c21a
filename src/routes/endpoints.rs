use axum::{
    extract::{Path, State},
    Json,
};
use data_model::{CommandOperation, CommandPayload, EndpointId, NewEdgeCommand};
use state_store::requests::{AppendEdgeCommandRequest, RequestPayload, WriteOutcome};
use tracing::info;

use super::routes_state::RouteState;
use crate::http_objects::{
    AppendCommand,
    CreateEndpoint,
    EdgeAPIError,
    EndpointBody,
    EndpointList,
    EndpointSnapshot,
    TunnelDetails,
    UpdateEndpoint,
};

async fn endpoint_body(state: &RouteState, endpoint: data_model::Endpoint) -> EndpointBody {
    let last_check_in = state.edge_state.directory.last_check_in(endpoint.id).await;
    EndpointBody::new(endpoint, last_check_in)
}

/// Create an endpoint
#[utoipa::path(
    post,
    path = "/endpoints",
    tag = "endpoints",
    request_body = CreateEndpoint,
    responses(
        (status = 200, description = "endpoint created", body = EndpointBody),
        (status = BAD_REQUEST, description = "edge id already in use")
    ),
)]
pub async fn create_endpoint(
    State(state): State<RouteState>,
    Json(body): Json<CreateEndpoint>,
) -> Result<Json<EndpointBody>, EdgeAPIError> {
    let result = state
        .write(RequestPayload::CreateEndpoint(body.into()))
        .await?;
    let WriteOutcome::Endpoint(endpoint) = result.outcome else {
        return Err(EdgeAPIError::internal_error(anyhow::anyhow!(
            "unexpected outcome for endpoint creation"
        )));
    };
    Ok(Json(endpoint_body(&state, *endpoint).await))
}

/// List endpoints
#[utoipa::path(
    get,
    path = "/endpoints",
    tag = "endpoints",
    responses(
        (status = 200, description = "all endpoints", body = EndpointList),
    ),
)]
pub async fn list_endpoints(
    State(state): State<RouteState>,
) -> Result<Json<EndpointList>, EdgeAPIError> {
    let check_ins = state.edge_state.directory.check_ins().await;
    let endpoints = state
        .edge_state
        .reader()
        .list_endpoints()?
        .into_iter()
        .map(|endpoint| {
            let last_check_in = check_ins.get(&endpoint.id).copied();
            EndpointBody::new(endpoint, last_check_in)
        })
        .collect();
    Ok(Json(EndpointList { endpoints }))
}

/// Get an endpoint
#[utoipa::path(
    get,
    path = "/endpoints/{id}",
    tag = "endpoints",
    params(("id" = u64, Path, description = "endpoint id")),
    responses(
        (status = 200, description = "the endpoint", body = EndpointBody),
        (status = NOT_FOUND, description = "endpoint not found")
    ),
)]
pub async fn get_endpoint(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<Json<EndpointBody>, EdgeAPIError> {
    let endpoint = state.endpoint(EndpointId::new(id))?;
    Ok(Json(endpoint_body(&state, endpoint).await))
}

/// Update an endpoint
#[utoipa::path(
    put,
    path = "/endpoints/{id}",
    tag = "endpoints",
    request_body = UpdateEndpoint,
    params(("id" = u64, Path, description = "endpoint id")),
    responses(
        (status = 200, description = "endpoint updated", body = EndpointBody),
        (status = NOT_FOUND, description = "endpoint not found")
    ),
)]
pub async fn update_endpoint(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
    Json(body): Json<UpdateEndpoint>,
) -> Result<Json<EndpointBody>, EdgeAPIError> {
    let current = state.endpoint(EndpointId::new(id))?;
    let result = state
        .write(RequestPayload::UpdateEndpoint(body.into_request(&current)))
        .await?;
    let WriteOutcome::Endpoint(endpoint) = result.outcome else {
        return Err(EdgeAPIError::internal_error(anyhow::anyhow!(
            "unexpected outcome for endpoint update"
        )));
    };
    Ok(Json(endpoint_body(&state, *endpoint).await))
}

/// Delete an endpoint and everything tied to it
#[utoipa::path(
    delete,
    path = "/endpoints/{id}",
    tag = "endpoints",
    params(("id" = u64, Path, description = "endpoint id")),
    responses(
        (status = 200, description = "endpoint deleted"),
        (status = NOT_FOUND, description = "endpoint not found")
    ),
)]
pub async fn delete_endpoint(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<(), EdgeAPIError> {
    state
        .write(RequestPayload::DeleteEndpoint(EndpointId::new(id)))
        .await?;
    Ok(())
}

/// Last reconciled snapshot of an endpoint
#[utoipa::path(
    get,
    path = "/endpoints/{id}/snapshot",
    tag = "endpoints",
    params(("id" = u64, Path, description = "endpoint id")),
    responses(
        (status = 200, description = "the endpoint snapshot", body = EndpointSnapshot),
        (status = NOT_FOUND, description = "no snapshot recorded")
    ),
)]
pub async fn get_snapshot(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<Json<EndpointSnapshot>, EdgeAPIError> {
    let endpoint_id = EndpointId::new(id);
    let snapshot = state
        .edge_state
        .reader()
        .get_snapshot(endpoint_id)?
        .ok_or_else(|| {
            EdgeAPIError::not_found(&format!("no snapshot for endpoint {}", endpoint_id))
        })?;
    Ok(Json(EndpointSnapshot::new(&snapshot)?))
}

/// Queue an imperative command for an async endpoint
#[utoipa::path(
    post,
    path = "/endpoints/{id}/edge/commands",
    tag = "endpoints",
    request_body = AppendCommand,
    params(("id" = u64, Path, description = "endpoint id")),
    responses(
        (status = 200, description = "command queued"),
        (status = BAD_REQUEST, description = "command kind is managed by the server, or the endpoint is not async")
    ),
)]
pub async fn append_command(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
    Json(body): Json<AppendCommand>,
) -> Result<(), EdgeAPIError> {
    let payload: CommandPayload = serde_json::from_value(body.command)?;
    if matches!(
        payload,
        CommandPayload::EdgeStack(_) | CommandPayload::EdgeJob(_) | CommandPayload::EdgeConfig(_)
    ) {
        return Err(EdgeAPIError::bad_request(&format!(
            "{} commands are issued by the server",
            payload
        )));
    }
    let endpoint_id = EndpointId::new(id);
    let command = NewEdgeCommand::new(payload, body.operation.unwrap_or(CommandOperation::Add))
        .scheduled(body.scheduled_time);
    info!(endpoint_id = %endpoint_id, kind = %command.payload, "queueing edge command");
    state
        .write(RequestPayload::AppendEdgeCommand(AppendEdgeCommandRequest {
            endpoint_id,
            command,
        }))
        .await?;
    Ok(())
}

/// Open a reverse tunnel to an endpoint
#[utoipa::path(
    post,
    path = "/endpoints/{id}/edge/tunnel",
    tag = "endpoints",
    params(("id" = u64, Path, description = "endpoint id")),
    responses(
        (status = 200, description = "tunnel requested", body = TunnelDetails),
        (status = BAD_REQUEST, description = "no tunnel port left"),
        (status = NOT_FOUND, description = "endpoint not found")
    ),
)]
pub async fn open_tunnel(
    Path(id): Path<u64>,
    State(state): State<RouteState>,
) -> Result<Json<TunnelDetails>, EdgeAPIError> {
    let endpoint = state.endpoint(EndpointId::new(id))?;
    let tunnel = state.tunnels.open_tunnel(endpoint.id).await?;
    Ok(Json(TunnelDetails {
        status: tunnel.status.to_string(),
        port: tunnel.port,
        credentials: tunnel.credentials,
    }))
}
