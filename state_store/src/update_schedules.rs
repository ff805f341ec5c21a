use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use data_model::{
    EdgeError,
    EdgeStack,
    EdgeStackStatusKind,
    EndpointId,
    StackDeploymentType,
    UpdateSchedule,
    UpdateScheduleBuilder,
    UpdateScheduleId,
};
use edge_utils::get_epoch_time_in_ms;
use tracing::info;

use crate::{
    driver::Transaction,
    edge_stacks,
    requests::{
        CreateEdgeStackRequest,
        RemoteUpdateSuccessRequest,
        StackStatusReport,
        UpdateEdgeStackRequest,
        UpdateScheduleOutcome,
        UpdateScheduleRequest,
    },
    state_machine::{
        delete_object,
        get_object,
        put_object,
        require_object,
        EdgeObjectsColumns,
        Fleet,
        WriteEffects,
    },
};

pub const UPDATER_ENTRY_POINT: &str = "docker-compose.yml";

fn require_schedule(txn: &Transaction, id: UpdateScheduleId) -> Result<UpdateSchedule> {
    require_object(
        txn,
        EdgeObjectsColumns::UpdateSchedules,
        id.key(),
        "update schedule",
        id,
    )
}

/// Endpoints that joined a targeted group after the caller reserved its
/// targets were never checked against other active schedules.
fn check_reserved(req: &UpdateScheduleRequest, targets: &BTreeSet<EndpointId>) -> Result<()> {
    if let Some(endpoint_id) = targets.difference(&req.reserved_endpoints).next() {
        return Err(EdgeError::InvalidState(format!(
            "endpoint {} joined the groups of update schedule {} while it was saved",
            endpoint_id, req.id
        ))
        .into());
    }
    Ok(())
}

/// Creates the schedule together with the stack that runs the updater on
/// every targeted endpoint. The updater file is stored by the caller under
/// the stack id carried in the request.
pub(crate) fn create(
    txn: &Transaction,
    req: &UpdateScheduleRequest,
    effects: &mut WriteEffects,
) -> Result<UpdateScheduleOutcome> {
    if get_object::<UpdateSchedule>(txn, EdgeObjectsColumns::UpdateSchedules, req.id.key())?
        .is_some()
    {
        return Err(EdgeError::BadRequest(format!("update schedule {} already exists", req.id)).into());
    }
    let fleet = Fleet::load(txn)?;
    fleet.validate_groups(&req.edge_group_ids)?;
    let targets = fleet.targets(&req.edge_group_ids);
    if targets.is_empty() {
        return Err(EdgeError::BadRequest("update schedule targets no endpoint".to_string()).into());
    }
    check_reserved(req, &targets)?;
    let previous_versions: BTreeMap<_, _> = targets
        .iter()
        .filter_map(|id| fleet.endpoint(*id))
        .map(|endpoint| (endpoint.id, endpoint.agent.version.clone()))
        .collect();

    edge_stacks::create(
        txn,
        &CreateEdgeStackRequest {
            id: req.edge_stack_id,
            name: format!("edge-update-schedule-{}", req.id),
            edge_groups: req.edge_group_ids.clone(),
            deployment_type: StackDeploymentType::Compose,
            entry_point: UPDATER_ENTRY_POINT.to_string(),
            scheduled_time: req.scheduled_time.clone(),
            update_schedule_id: Some(req.id),
        },
        effects,
    )?;

    let schedule = UpdateScheduleBuilder::default()
        .id(req.id)
        .name(req.name.clone())
        .version(req.version.clone())
        .schedule_type(req.schedule_type)
        .edge_group_ids(req.edge_group_ids.clone())
        .edge_stack_id(req.edge_stack_id)
        .previous_versions(previous_versions)
        .scheduled_time(req.scheduled_time.clone())
        .created_at(get_epoch_time_in_ms())
        .created_by(req.created_by.clone())
        .build()?;
    put_object(txn, EdgeObjectsColumns::UpdateSchedules, schedule.key(), &schedule)?;
    info!(
        update_schedule_id = %schedule.id,
        version = schedule.version,
        targets = targets.len(),
        "created update schedule"
    );
    Ok(UpdateScheduleOutcome { endpoints: targets })
}

/// Retargets the schedule. Endpoints that stay targeted keep the version they
/// had when they were first targeted.
pub(crate) fn update(
    txn: &Transaction,
    req: &UpdateScheduleRequest,
    effects: &mut WriteEffects,
) -> Result<UpdateScheduleOutcome> {
    let mut schedule = require_schedule(txn, req.id)?;
    let fleet = Fleet::load(txn)?;
    fleet.validate_groups(&req.edge_group_ids)?;
    let targets = fleet.targets(&req.edge_group_ids);
    if targets.is_empty() {
        return Err(EdgeError::BadRequest("update schedule targets no endpoint".to_string()).into());
    }
    check_reserved(req, &targets)?;

    let mut previous_versions = BTreeMap::new();
    for endpoint in targets.iter().filter_map(|id| fleet.endpoint(*id)) {
        let version = schedule
            .previous_versions
            .get(&endpoint.id)
            .cloned()
            .unwrap_or_else(|| endpoint.agent.version.clone());
        previous_versions.insert(endpoint.id, version);
    }
    schedule.name = req.name.clone();
    schedule.version = req.version.clone();
    schedule.schedule_type = req.schedule_type;
    schedule.edge_group_ids = req.edge_group_ids.clone();
    schedule.scheduled_time = req.scheduled_time.clone();
    schedule.previous_versions = previous_versions;

    edge_stacks::update(
        txn,
        &UpdateEdgeStackRequest {
            id: schedule.edge_stack_id,
            edge_groups: Some(req.edge_group_ids.clone()),
            file_version: req.file_version,
            redeploy: false,
            rollback_to: None,
            scheduled_time: Some(req.scheduled_time.clone()),
        },
        effects,
    )?;
    put_object(txn, EdgeObjectsColumns::UpdateSchedules, schedule.key(), &schedule)?;
    info!(update_schedule_id = %schedule.id, version = schedule.version, "updated update schedule");
    Ok(UpdateScheduleOutcome { endpoints: targets })
}

pub(crate) fn delete(
    txn: &Transaction,
    id: UpdateScheduleId,
    effects: &mut WriteEffects,
) -> Result<UpdateScheduleOutcome> {
    let schedule = require_schedule(txn, id)?;
    if get_object::<EdgeStack>(txn, EdgeObjectsColumns::EdgeStacks, schedule.edge_stack_id.key())?
        .is_some()
    {
        edge_stacks::delete(txn, schedule.edge_stack_id, effects)?;
    }
    delete_object(txn, EdgeObjectsColumns::UpdateSchedules, id.key())?;
    info!(update_schedule_id = %id, "deleted update schedule");
    Ok(UpdateScheduleOutcome {
        endpoints: schedule.endpoints().collect(),
    })
}

/// The agent came back on the new version after the updater stack ran.
pub(crate) fn mark_remote_update_success(
    txn: &Transaction,
    req: &RemoteUpdateSuccessRequest,
    effects: &mut WriteEffects,
) -> Result<()> {
    let schedule = require_schedule(txn, req.schedule_id)?;
    edge_stacks::update_status(
        txn,
        &StackStatusReport {
            stack_id: schedule.edge_stack_id,
            endpoint_id: req.endpoint_id,
            status: EdgeStackStatusKind::RemoteUpdateSuccess,
            error: None,
            version: None,
        },
    )?;
    effects.touch([req.endpoint_id]);
    Ok(())
}
