use std::collections::BTreeSet;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use data_model::{
    CommandOperation,
    CommandPayload,
    EdgeError,
    EdgeJob,
    EdgeJobBuilder,
    EdgeJobCommandData,
    EdgeJobEndpointMeta,
    EdgeJobId,
    EdgeJobLogsStatus,
    EdgeLogCommandData,
    EndpointId,
    NewEdgeCommand,
};
use edge_utils::get_epoch_time_in_ms;
use tracing::info;

use crate::{
    async_commands,
    driver::Transaction,
    requests::{CreateEdgeJobRequest, EdgeJobTaskRequest},
    state_machine::{
        delete_object,
        next_id,
        put_object,
        require_object,
        scan_objects,
        EdgeObjectsColumns,
        Fleet,
        WriteEffects,
    },
};

pub(crate) fn job_command(
    job: &EdgeJob,
    endpoint_id: EndpointId,
    operation: CommandOperation,
) -> NewEdgeCommand {
    NewEdgeCommand::new(
        CommandPayload::EdgeJob(EdgeJobCommandData {
            id: job.id,
            cron_expression: job.cron_expression.clone(),
            script_file_content: STANDARD.encode(&job.script),
            version: job.version,
            collect_logs: job.endpoint_meta(endpoint_id).collect_logs,
        }),
        operation,
    )
}

fn put_job(txn: &Transaction, job: &EdgeJob) -> Result<()> {
    put_object(txn, EdgeObjectsColumns::EdgeJobs, job.key(), job)
}

fn require_job(txn: &Transaction, id: EdgeJobId) -> Result<EdgeJob> {
    require_object(txn, EdgeObjectsColumns::EdgeJobs, id.key(), "edge job", id)
}

pub(crate) fn create(
    txn: &Transaction,
    req: &CreateEdgeJobRequest,
    effects: &mut WriteEffects,
) -> Result<EdgeJob> {
    let fleet = Fleet::load(txn)?;
    fleet.validate_groups(&req.edge_groups)?;
    if let Some(missing) = req.endpoints.iter().find(|id| fleet.endpoint(**id).is_none()) {
        return Err(EdgeError::not_found("endpoint", missing).into());
    }

    let id = EdgeJobId::new(next_id(txn, EdgeObjectsColumns::EdgeJobs)?);
    let mut job = EdgeJobBuilder::default()
        .id(id)
        .name(req.name.clone())
        .cron_expression(req.cron_expression.clone())
        .script(req.script.clone())
        .recurring(req.recurring)
        .edge_groups(req.edge_groups.clone())
        .explicit_endpoints(req.endpoints.clone())
        .created_at(get_epoch_time_in_ms())
        .build()?;
    reconcile_targets(txn, &fleet, &mut job, effects)?;
    put_job(txn, &job)?;
    effects.jobs_changed = true;
    info!(edge_job_id = %id, targets = job.endpoints.len(), "created edge job");
    Ok(job)
}

pub(crate) fn delete(txn: &Transaction, id: EdgeJobId, effects: &mut WriteEffects) -> Result<()> {
    let job = require_job(txn, id)?;
    let fleet = Fleet::load(txn)?;
    for endpoint_id in job.endpoints.keys() {
        async_commands::append_for(
            txn,
            &fleet,
            *endpoint_id,
            job_command(&job, *endpoint_id, CommandOperation::Remove),
        )?;
    }
    delete_object(txn, EdgeObjectsColumns::EdgeJobs, id.key())?;
    effects.jobs_changed = true;
    effects.removed_blob_prefixes.push(EdgeJob::files_prefix(id));
    info!(edge_job_id = %id, "deleted edge job");
    Ok(())
}

fn target_meta(job: &mut EdgeJob, endpoint_id: EndpointId) -> Result<&mut EdgeJobEndpointMeta> {
    let job_id = job.id;
    job.endpoints.get_mut(&endpoint_id).ok_or_else(|| {
        EdgeError::InvalidState(format!(
            "edge job {} does not target endpoint {}",
            job_id, endpoint_id
        ))
        .into()
    })
}

/// Asks the endpoint to upload the job's log on its next run.
pub(crate) fn request_logs(
    txn: &Transaction,
    req: &EdgeJobTaskRequest,
    effects: &mut WriteEffects,
) -> Result<()> {
    let mut job = require_job(txn, req.job_id)?;
    let meta = target_meta(&mut job, req.endpoint_id)?;
    meta.collect_logs = true;
    meta.logs_status = EdgeJobLogsStatus::Pending;
    put_job(txn, &job)?;

    let fleet = Fleet::load(txn)?;
    async_commands::append_for(
        txn,
        &fleet,
        req.endpoint_id,
        NewEdgeCommand::new(
            CommandPayload::EdgeLog(EdgeLogCommandData {
                edge_job_id: job.id,
                tail: None,
            }),
            CommandOperation::Add,
        ),
    )?;
    effects.jobs_changed = true;
    Ok(())
}

/// The endpoint uploaded the log requested earlier.
pub(crate) fn logs_collected(
    txn: &Transaction,
    req: &EdgeJobTaskRequest,
    effects: &mut WriteEffects,
) -> Result<()> {
    let mut job = require_job(txn, req.job_id)?;
    let meta = target_meta(&mut job, req.endpoint_id)?;
    meta.collect_logs = false;
    meta.logs_status = EdgeJobLogsStatus::Collected;
    put_job(txn, &job)?;
    effects.jobs_changed = true;
    Ok(())
}

/// Aligns the resolved targets with the explicit endpoints plus the members
/// of the job's edge groups.
pub(crate) fn reconcile_targets(
    txn: &Transaction,
    fleet: &Fleet,
    job: &mut EdgeJob,
    effects: &mut WriteEffects,
) -> Result<()> {
    let mut desired = fleet.targets(&job.edge_groups);
    desired.extend(
        job.explicit_endpoints
            .iter()
            .filter(|id| fleet.endpoint(**id).is_some()),
    );
    let current: BTreeSet<EndpointId> = job.endpoints.keys().copied().collect();
    let added: Vec<EndpointId> = desired.difference(&current).copied().collect();
    let removed: Vec<EndpointId> = current.difference(&desired).copied().collect();
    if added.is_empty() && removed.is_empty() {
        return Ok(());
    }

    for endpoint_id in &added {
        job.endpoints
            .insert(*endpoint_id, EdgeJobEndpointMeta::default());
        async_commands::append_for(
            txn,
            fleet,
            *endpoint_id,
            job_command(job, *endpoint_id, CommandOperation::Add),
        )?;
    }
    for endpoint_id in &removed {
        async_commands::append_for(
            txn,
            fleet,
            *endpoint_id,
            job_command(job, *endpoint_id, CommandOperation::Remove),
        )?;
        job.endpoints.remove(endpoint_id);
    }
    put_job(txn, job)?;
    effects.jobs_changed = true;
    Ok(())
}

pub(crate) fn remove_endpoint(
    txn: &Transaction,
    endpoint_id: EndpointId,
    effects: &mut WriteEffects,
) -> Result<()> {
    for mut job in scan_objects::<EdgeJob>(txn, EdgeObjectsColumns::EdgeJobs, &[])? {
        let explicit = job.explicit_endpoints.remove(&endpoint_id);
        let targeted = job.endpoints.remove(&endpoint_id).is_some();
        if explicit || targeted {
            put_job(txn, &job)?;
            effects.jobs_changed = true;
            effects
                .removed_blob_prefixes
                .push(EdgeJob::logs_key(job.id, endpoint_id));
        }
    }
    Ok(())
}
