use axum::{extract::State, Json};
use data_model::{EdgeConfigId, EdgeJobId, EdgeStackId, EndpointId};
use metrics::Increment;
use state_store::requests::{
    AsyncCheckInRequest,
    AutoCreatePolicy,
    JobStatusReport,
    RequestPayload,
    StackStatusReport,
    WriteOutcome,
};
use tracing::{info, warn};

use super::routes_state::RouteState;
use crate::{
    http_objects::{
        parse_config_state,
        AgentCommand,
        AsyncCheckInBody,
        AsyncCheckInResponse,
        EdgeAPIError,
    },
    middleware::EdgeHeaders,
};

fn check_in_request(
    state: &RouteState,
    headers: &EdgeHeaders,
    edge_id: &str,
    body: AsyncCheckInBody,
) -> Result<AsyncCheckInRequest, EdgeAPIError> {
    let edge_config_states = body
        .edge_config_states
        .iter()
        .map(|(id, value)| Ok((EdgeConfigId::new(*id), parse_config_state(value)?)))
        .collect::<Result<_, EdgeAPIError>>()?;
    let settings = &state.config.edge;
    Ok(AsyncCheckInRequest {
        edge_id: edge_id.to_string(),
        agent: headers.agent.clone(),
        auto_create: AutoCreatePolicy {
            enabled: settings.auto_create_endpoints,
            trust_on_first_connect: settings.trust_on_first_connect,
        },
        command_timestamp: body.command_timestamp,
        snapshot: body.snapshot.map(Into::into),
        // The store stamps the endpoint once it resolved the edge id.
        stack_statuses: body
            .stack_statuses
            .into_iter()
            .map(|status| StackStatusReport {
                stack_id: EdgeStackId::new(status.stack_id),
                endpoint_id: EndpointId::default(),
                status: status.status,
                error: status.error,
                version: status.version,
            })
            .collect(),
        job_statuses: body
            .job_statuses
            .into_iter()
            .map(|status| JobStatusReport {
                job_id: EdgeJobId::new(status.job_id),
                logs_collected: status.logs_collected,
            })
            .collect(),
        edge_config_states,
        full_snapshot_min_agent_version: settings.full_snapshot_min_agent_version(),
    })
}

/// Asynchronous agent check-in
#[utoipa::path(
    post,
    path = "/endpoints/edge/async",
    tag = "edge",
    request_body = AsyncCheckInBody,
    params(
        ("X-Edge-Id" = String, Header, description = "edge identifier of the agent"),
    ),
    responses(
        (status = 200, description = "commands due for the endpoint", body = AsyncCheckInResponse),
        (status = FORBIDDEN, description = "unknown or untrusted edge id"),
        (status = BAD_REQUEST, description = "malformed check-in")
    ),
)]
pub async fn async_check_in(
    State(state): State<RouteState>,
    headers: EdgeHeaders,
    Json(body): Json<AsyncCheckInBody>,
) -> Result<Json<AsyncCheckInResponse>, EdgeAPIError> {
    let _inc = Increment::inc(&state.metrics.async_check_ins, &[]);
    let edge_id = headers.require_edge_id()?;
    let request = check_in_request(&state, &headers, edge_id, body)?;

    let result = match state
        .write(RequestPayload::AsyncCheckIn(Box::new(request)))
        .await
    {
        Ok(result) => result,
        Err(err) => {
            state.metrics.rejected_check_ins.add(1, &[]);
            return Err(err);
        }
    };
    let WriteOutcome::AsyncCheckIn(outcome) = result.outcome else {
        return Err(EdgeAPIError::internal_error(anyhow::anyhow!(
            "unexpected outcome for async check-in"
        )));
    };
    let outcome = *outcome;
    if outcome.created {
        info!(endpoint_id = %outcome.endpoint.id, edge_id, "endpoint registered by check-in");
    }
    if !outcome.endpoint.user_trusted {
        state.metrics.rejected_check_ins.add(1, &[]);
        return Err(EdgeAPIError::forbidden("endpoint is not trusted"));
    }

    for schedule_id in &outcome.deployed_updates {
        state
            .update_schedules
            .edge_stack_deployed(outcome.endpoint.id, *schedule_id)
            .await;
    }
    if outcome.need_full_snapshot {
        state.metrics.full_snapshot_requests.add(1, &[]);
    }
    state
        .metrics
        .delivered_commands
        .add(outcome.commands.len() as u64, &[]);

    let mut commands = Vec::with_capacity(outcome.commands.len());
    for command in outcome.commands {
        match AgentCommand::try_from(command) {
            Ok(command) => commands.push(command),
            Err(err) => warn!(
                endpoint_id = %outcome.endpoint.id,
                "dropping command that cannot be encoded: {}", err
            ),
        }
    }
    let settings = &state.config.edge;
    let endpoint = &outcome.endpoint;
    Ok(Json(AsyncCheckInResponse {
        endpoint_id: endpoint.id.get(),
        ping_interval: endpoint.edge.ping_interval.resolve(settings.ping_interval_secs),
        snapshot_interval: endpoint
            .edge
            .snapshot_interval
            .resolve(settings.snapshot_interval_secs),
        command_interval: endpoint
            .edge
            .command_interval
            .resolve(settings.command_interval_secs),
        need_full_snapshot: outcome.need_full_snapshot,
        commands,
    }))
}
