//! Agent check-ins. An async check-in carries everything the agent has to
//! report since its last one, and is answered with the commands that became
//! due, all inside one transaction.

use anyhow::Result;
use data_model::{EdgeError, Endpoint, EndpointBuilder, EndpointEdgeSettings, EndpointType};
use edge_utils::get_epoch_time_in_ms;
use tracing::{debug, info, warn};

use crate::{
    async_commands,
    driver::Transaction,
    edge_configs,
    edge_jobs,
    edge_stacks,
    requests::{
        AsyncCheckInOutcome,
        AsyncCheckInRequest,
        EdgeConfigTransitionRequest,
        EdgeJobTaskRequest,
        StackStatusReport,
        StatusCheckInOutcome,
        StatusCheckInRequest,
    },
    snapshots,
    state_machine::{
        get_config_states,
        insert_endpoint,
        lookup_edge_id,
        next_id,
        record_agent_report,
        require_object,
        EdgeObjectsColumns,
        WriteEffects,
    },
};

/// Runs `op` and turns errors caused by a report that was already applied
/// into a skipped item. Anything else aborts the check-in.
fn skip_stale<T>(op: Result<T>, endpoint_id: data_model::EndpointId, item: &str) -> Result<Option<T>> {
    match op {
        Ok(value) => Ok(Some(value)),
        Err(err) => match err.downcast_ref::<EdgeError>() {
            Some(edge_err) if edge_err.is_stale_report() => {
                debug!(
                    endpoint_id = %endpoint_id,
                    item,
                    "skipping stale report: {}",
                    edge_err
                );
                Ok(None)
            }
            _ => Err(err),
        },
    }
}

fn resolve_endpoint(
    txn: &Transaction,
    req: &AsyncCheckInRequest,
    effects: &mut WriteEffects,
) -> Result<(Endpoint, bool)> {
    if let Some(id) = lookup_edge_id(txn, &req.edge_id)? {
        let endpoint = require_object(txn, EdgeObjectsColumns::Endpoints, id.key(), "endpoint", id)?;
        return Ok((endpoint, false));
    }
    if !req.auto_create.enabled {
        return Err(EdgeError::Forbidden(format!("unknown edge id {}", req.edge_id)).into());
    }

    let id = next_id(txn, EdgeObjectsColumns::Endpoints)?;
    let endpoint = EndpointBuilder::default()
        .id(id.into())
        .name(req.edge_id.clone())
        .endpoint_type(req.agent.platform.unwrap_or(EndpointType::EdgeAgentOnDocker))
        .edge_id(Some(req.edge_id.clone()))
        .edge(EndpointEdgeSettings {
            async_mode: true,
            ..Default::default()
        })
        .local_time_zone(req.agent.time_zone.clone())
        .user_trusted(req.auto_create.trust_on_first_connect)
        .created_at(get_epoch_time_in_ms())
        .build()?;
    insert_endpoint(txn, &endpoint, effects)?;
    info!(
        endpoint_id = %endpoint.id,
        trusted = endpoint.user_trusted,
        "registered endpoint on first check-in"
    );
    Ok((endpoint, true))
}

/// Agents older than `threshold` cannot send a full snapshot while they still
/// have commands to process.
fn below_version(agent_version: &str, threshold: Option<&semver::Version>) -> bool {
    let Some(threshold) = threshold else {
        return false;
    };
    match semver::Version::parse(agent_version.trim_start_matches('v')) {
        Ok(version) => version < *threshold,
        Err(_) => false,
    }
}

pub(crate) fn async_check_in(
    txn: &Transaction,
    req: &AsyncCheckInRequest,
    effects: &mut WriteEffects,
) -> Result<AsyncCheckInOutcome> {
    let (mut endpoint, created) = resolve_endpoint(txn, req, effects)?;
    record_agent_report(txn, &mut endpoint, &req.edge_id, &req.agent, effects)?;

    let mut outcome = AsyncCheckInOutcome {
        endpoint: endpoint.clone(),
        created,
        need_full_snapshot: false,
        commands: Vec::new(),
        deployed_updates: Vec::new(),
    };
    if !endpoint.user_trusted {
        return Ok(outcome);
    }

    if let Some(payload) = &req.snapshot {
        outcome.need_full_snapshot = snapshots::reconcile(txn, endpoint.id, payload)?;
    }

    for report in &req.stack_statuses {
        let report = StackStatusReport {
            endpoint_id: endpoint.id,
            ..report.clone()
        };
        let applied = skip_stale(
            edge_stacks::update_status(txn, &report),
            endpoint.id,
            "stack status",
        )?;
        if let Some(Some(schedule_id)) = applied {
            outcome.deployed_updates.push(schedule_id);
        }
        effects.touch([endpoint.id]);
    }

    for job in req.job_statuses.iter().filter(|job| job.logs_collected) {
        let task = EdgeJobTaskRequest {
            job_id: job.job_id,
            endpoint_id: endpoint.id,
        };
        skip_stale(
            edge_jobs::logs_collected(txn, &task, effects),
            endpoint.id,
            "job status",
        )?;
    }

    if !req.edge_config_states.is_empty() {
        let stored = get_config_states(txn, endpoint.id)?;
        for (config_id, state) in &req.edge_config_states {
            if stored.states.get(config_id) == Some(state) {
                continue;
            }
            let transition = EdgeConfigTransitionRequest {
                config_id: *config_id,
                endpoint_id: endpoint.id,
                state: *state,
            };
            skip_stale(
                edge_configs::transition(txn, &transition, effects),
                endpoint.id,
                "edge configuration state",
            )?;
        }
    }

    outcome.commands = async_commands::deliver_since(txn, &endpoint, req.command_timestamp)?;

    if outcome.need_full_snapshot &&
        below_version(
            &endpoint.agent.version,
            req.full_snapshot_min_agent_version.as_ref(),
        ) &&
        (!outcome.commands.is_empty() || async_commands::has_pending(txn, endpoint.id)?)
    {
        warn!(
            endpoint_id = %endpoint.id,
            agent_version = endpoint.agent.version,
            "agent too old to send a full snapshot with pending commands"
        );
        outcome.need_full_snapshot = false;
    }
    outcome.endpoint = endpoint;
    Ok(outcome)
}

pub(crate) fn status_check_in(
    txn: &Transaction,
    req: &StatusCheckInRequest,
    effects: &mut WriteEffects,
) -> Result<StatusCheckInOutcome> {
    let mut endpoint: Endpoint = require_object(
        txn,
        EdgeObjectsColumns::Endpoints,
        req.endpoint_id.key(),
        "endpoint",
        req.endpoint_id,
    )?;
    record_agent_report(txn, &mut endpoint, &req.edge_id, &req.agent, effects)?;
    Ok(StatusCheckInOutcome { endpoint })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_version() {
        let threshold = semver::Version::new(2, 19, 0);
        assert!(below_version("2.18.3", Some(&threshold)));
        assert!(below_version("v2.18.3", Some(&threshold)));
        assert!(!below_version("2.19.0", Some(&threshold)));
        assert!(!below_version("not-a-version", Some(&threshold)));
        assert!(!below_version("1.0.0", None));
    }
}
