use std::collections::BTreeSet;

use anyhow::Result;
use data_model::{
    CommandOperation,
    CommandPayload,
    EdgeError,
    EdgeStack,
    EdgeStackBuilder,
    EdgeStackCommandData,
    EdgeStackEndpointStatus,
    EdgeStackStatusKind,
    EndpointId,
    NewEdgeCommand,
    UpdateScheduleId,
};
use edge_utils::get_epoch_time_in_ms;
use tracing::{debug, info};

use crate::{
    async_commands,
    driver::Transaction,
    requests::{CreateEdgeStackRequest, StackStatusReport, UpdateEdgeStackRequest},
    state_machine::{
        delete_object,
        get_object,
        get_relation,
        put_object,
        put_relation,
        require_object,
        scan_objects,
        EdgeObjectsColumns,
        Fleet,
        WriteEffects,
    },
};

fn stack_command(stack: &EdgeStack, operation: CommandOperation) -> NewEdgeCommand {
    NewEdgeCommand::new(
        CommandPayload::EdgeStack(EdgeStackCommandData {
            id: stack.id,
            name: stack.name.clone(),
            version: stack.version,
            file_version: stack.stack_file_version,
            deployment_type: stack.deployment_type,
            rollback_to: stack.rollback_to,
            edge_update_id: stack.update_schedule_id,
        }),
        operation,
    )
    .scheduled(stack.scheduled_time.clone())
}

fn put_stack(txn: &Transaction, stack: &EdgeStack) -> Result<()> {
    put_object(txn, EdgeObjectsColumns::EdgeStacks, stack.key(), stack)
}

pub(crate) fn create(
    txn: &Transaction,
    req: &CreateEdgeStackRequest,
    effects: &mut WriteEffects,
) -> Result<EdgeStack> {
    if get_object::<EdgeStack>(txn, EdgeObjectsColumns::EdgeStacks, req.id.key())?.is_some() {
        return Err(EdgeError::BadRequest(format!("edge stack {} already exists", req.id)).into());
    }
    let fleet = Fleet::load(txn)?;
    fleet.validate_groups(&req.edge_groups)?;

    let mut stack = EdgeStackBuilder::default()
        .id(req.id)
        .name(req.name.clone())
        .edge_groups(req.edge_groups.clone())
        .deployment_type(req.deployment_type)
        .entry_point(req.entry_point.clone())
        .scheduled_time(req.scheduled_time.clone())
        .update_schedule_id(req.update_schedule_id)
        .created_at(get_epoch_time_in_ms())
        .build()?;
    reconcile_targets(txn, &fleet, &mut stack, effects)?;
    put_stack(txn, &stack)?;
    info!(
        edge_stack_id = %stack.id,
        num_deployments = stack.num_deployments,
        "created edge stack"
    );
    Ok(stack)
}

pub(crate) fn update(
    txn: &Transaction,
    req: &UpdateEdgeStackRequest,
    effects: &mut WriteEffects,
) -> Result<EdgeStack> {
    let mut stack: EdgeStack =
        require_object(txn, EdgeObjectsColumns::EdgeStacks, req.id.key(), "edge stack", req.id)?;
    let fleet = Fleet::load(txn)?;

    if let Some(groups) = &req.edge_groups {
        fleet.validate_groups(groups)?;
        stack.edge_groups = groups.clone();
    }
    if let Some(scheduled_time) = &req.scheduled_time {
        stack.scheduled_time = scheduled_time.clone();
    }

    let previous_targets: BTreeSet<EndpointId> = stack.status.keys().copied().collect();
    let redeploy = req.redeploy || req.file_version.is_some() || req.rollback_to.is_some();
    if redeploy {
        stack.previous_deployment_info = Some(stack.deployment_info());
        if let Some(file_version) = req.file_version {
            stack.stack_file_version = file_version;
        }
        stack.rollback_to = req.rollback_to;
        stack.version += 1;
        let info = stack.deployment_info();
        for status in stack.status.values_mut() {
            *status = EdgeStackEndpointStatus::pending(info);
        }
    }

    reconcile_targets(txn, &fleet, &mut stack, effects)?;

    if redeploy {
        let retained: Vec<EndpointId> = previous_targets
            .into_iter()
            .filter(|id| stack.status.contains_key(id))
            .collect();
        for endpoint_id in &retained {
            async_commands::append_for(
                txn,
                &fleet,
                *endpoint_id,
                stack_command(&stack, CommandOperation::Replace),
            )?;
        }
        effects.touch(retained);
    }
    put_stack(txn, &stack)?;
    info!(edge_stack_id = %stack.id, version = stack.version, "updated edge stack");
    Ok(stack)
}

pub(crate) fn delete(
    txn: &Transaction,
    id: data_model::EdgeStackId,
    effects: &mut WriteEffects,
) -> Result<EdgeStack> {
    let stack: EdgeStack =
        require_object(txn, EdgeObjectsColumns::EdgeStacks, id.key(), "edge stack", id)?;
    let fleet = Fleet::load(txn)?;
    for endpoint_id in stack.status.keys() {
        detach(txn, &fleet, &stack, *endpoint_id)?;
    }
    effects.touch(stack.status.keys().copied());
    delete_object(txn, EdgeObjectsColumns::EdgeStacks, id.key())?;
    effects
        .removed_blob_prefixes
        .push(EdgeStack::files_prefix(id));
    info!(edge_stack_id = %id, "deleted edge stack");
    Ok(stack)
}

fn attach(txn: &Transaction, fleet: &Fleet, stack: &EdgeStack, endpoint_id: EndpointId) -> Result<()> {
    let mut relation = get_relation(txn, endpoint_id)?;
    relation.edge_stacks.insert(stack.id, true);
    put_relation(txn, &relation)?;
    async_commands::append_for(
        txn,
        fleet,
        endpoint_id,
        stack_command(stack, CommandOperation::Add),
    )?;
    Ok(())
}

fn detach(txn: &Transaction, fleet: &Fleet, stack: &EdgeStack, endpoint_id: EndpointId) -> Result<()> {
    let mut relation = get_relation(txn, endpoint_id)?;
    if relation.edge_stacks.remove(&stack.id).is_some() {
        put_relation(txn, &relation)?;
    }
    async_commands::append_for(
        txn,
        fleet,
        endpoint_id,
        stack_command(stack, CommandOperation::Remove),
    )?;
    Ok(())
}

/// Aligns the stack's relations and statuses with the current members of
/// its edge groups.
pub(crate) fn reconcile_targets(
    txn: &Transaction,
    fleet: &Fleet,
    stack: &mut EdgeStack,
    effects: &mut WriteEffects,
) -> Result<()> {
    let desired = fleet.targets(&stack.edge_groups);
    let current: BTreeSet<EndpointId> = stack.status.keys().copied().collect();
    let added: Vec<EndpointId> = desired.difference(&current).copied().collect();
    let removed: Vec<EndpointId> = current.difference(&desired).copied().collect();
    if added.is_empty() && removed.is_empty() {
        return Ok(());
    }

    let info = stack.deployment_info();
    for endpoint_id in &added {
        stack
            .status
            .insert(*endpoint_id, EdgeStackEndpointStatus::pending(info));
        attach(txn, fleet, stack, *endpoint_id)?;
    }
    for endpoint_id in &removed {
        stack.status.remove(endpoint_id);
        detach(txn, fleet, stack, *endpoint_id)?;
    }
    stack.num_deployments = stack.status.len() as u32;
    debug!(
        edge_stack_id = %stack.id,
        added = added.len(),
        removed = removed.len(),
        "reconciled edge stack targets"
    );
    effects.touch(added);
    effects.touch(removed);
    put_stack(txn, stack)
}

/// Records a status reported by an agent. Returns the update schedule whose
/// stack just reached Running on the endpoint, if any.
pub(crate) fn update_status(
    txn: &Transaction,
    report: &StackStatusReport,
) -> Result<Option<UpdateScheduleId>> {
    let mut stack: EdgeStack = require_object(
        txn,
        EdgeObjectsColumns::EdgeStacks,
        report.stack_id.key(),
        "edge stack",
        report.stack_id,
    )?;
    if let Some(version) = report.version {
        if version != stack.version {
            debug!(
                edge_stack_id = %stack.id,
                endpoint_id = %report.endpoint_id,
                reported = version,
                current = stack.version,
                "ignoring status for an outdated stack version"
            );
            return Ok(None);
        }
    }
    let info = stack.deployment_info();
    let status = stack.status.get_mut(&report.endpoint_id).ok_or_else(|| {
        EdgeError::InvalidState(format!(
            "edge stack {} is not deployed to endpoint {}",
            report.stack_id, report.endpoint_id
        ))
    })?;
    status.push(report.status, report.error.clone());
    if matches!(
        report.status,
        EdgeStackStatusKind::Running | EdgeStackStatusKind::RemoteUpdateSuccess
    ) {
        status.deployment_info = Some(info);
    }
    put_stack(txn, &stack)?;

    let deployed_update = match report.status {
        EdgeStackStatusKind::Running => stack.update_schedule_id,
        _ => None,
    };
    Ok(deployed_update)
}

/// Drops an endpoint's status from every stack. Relations are removed by the
/// caller together with the endpoint.
pub(crate) fn remove_endpoint(txn: &Transaction, endpoint_id: EndpointId) -> Result<()> {
    for mut stack in scan_objects::<EdgeStack>(txn, EdgeObjectsColumns::EdgeStacks, &[])? {
        if stack.status.remove(&endpoint_id).is_some() {
            stack.num_deployments = stack.status.len() as u32;
            put_stack(txn, &stack)?;
        }
    }
    Ok(())
}
