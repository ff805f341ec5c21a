//! Storage side of the edge configuration lifecycle. The transition table
//! and the counter arithmetic live in `data_model::edge_config`; this module
//! keeps the per-endpoint entries, the aggregate record and the command log
//! in step inside one transaction.

use std::collections::BTreeSet;

use anyhow::Result;
use data_model::{
    CommandOperation,
    CommandPayload,
    EdgeConfigCommandData,
    EdgeConfigId,
    EdgeConfigPrev,
    EdgeConfigStateKind,
    EdgeConfiguration,
    EdgeConfigurationBuilder,
    EdgeError,
    EndpointId,
    NewEdgeCommand,
    TransitionEffect,
};
use edge_utils::get_epoch_time_in_ms;
use tracing::{debug, info};

use crate::{
    async_commands,
    driver::Transaction,
    requests::{
        CreateEdgeConfigurationRequest,
        EdgeConfigTransitionRequest,
        UpdateEdgeConfigurationRequest,
    },
    state_machine::{
        all_config_states,
        config_entries,
        delete_object,
        get_config_states,
        get_object,
        put_config_states,
        put_object,
        require_object,
        EdgeObjectsColumns,
        Fleet,
        WriteEffects,
    },
};

fn config_command(
    config: &EdgeConfiguration,
    operation: CommandOperation,
    state: EdgeConfigStateKind,
) -> NewEdgeCommand {
    NewEdgeCommand::new(
        CommandPayload::EdgeConfig(EdgeConfigCommandData {
            id: config.id,
            name: config.name.clone(),
            base_dir: config.base_dir.clone(),
            category: config.category,
            version: config.version,
            state,
        }),
        operation,
    )
}

fn put_config(txn: &Transaction, config: &EdgeConfiguration) -> Result<()> {
    put_object(txn, EdgeObjectsColumns::EdgeConfigurations, config.key(), config)
}

fn require_config(txn: &Transaction, id: EdgeConfigId) -> Result<EdgeConfiguration> {
    require_object(
        txn,
        EdgeObjectsColumns::EdgeConfigurations,
        id.key(),
        "edge configuration",
        id,
    )
}

/// Sets the entry of `config_id` for one endpoint.
fn set_entry(
    txn: &Transaction,
    endpoint_id: EndpointId,
    config_id: EdgeConfigId,
    state: EdgeConfigStateKind,
) -> Result<()> {
    let mut states = get_config_states(txn, endpoint_id)?;
    states.states.insert(config_id, state);
    put_config_states(txn, &states)
}

fn notify(
    txn: &Transaction,
    fleet: &Fleet,
    config: &EdgeConfiguration,
    endpoint_id: EndpointId,
    state: EdgeConfigStateKind,
) -> Result<()> {
    let operation = match state {
        EdgeConfigStateKind::Saving => CommandOperation::Add,
        EdgeConfigStateKind::Deleting => CommandOperation::Remove,
        _ => CommandOperation::Replace,
    };
    async_commands::append_for(
        txn,
        fleet,
        endpoint_id,
        config_command(config, operation, state),
    )?;
    Ok(())
}

pub(crate) fn create(
    txn: &Transaction,
    req: &CreateEdgeConfigurationRequest,
    effects: &mut WriteEffects,
) -> Result<EdgeConfiguration> {
    if get_object::<EdgeConfiguration>(txn, EdgeObjectsColumns::EdgeConfigurations, req.id.key())?
        .is_some()
    {
        return Err(
            EdgeError::BadRequest(format!("edge configuration {} already exists", req.id)).into(),
        );
    }
    let fleet = Fleet::load(txn)?;
    fleet.validate_groups(&req.edge_group_ids)?;
    let targets = fleet.targets(&req.edge_group_ids);

    let mut config = EdgeConfigurationBuilder::default()
        .id(req.id)
        .name(req.name.clone())
        .base_dir(req.base_dir.clone())
        .category(req.category)
        .edge_group_ids(req.edge_group_ids.clone())
        .files(req.files.clone())
        .files_dir(Some(req.files_dir.clone()))
        .created_by(req.created_by.clone())
        .created_at(get_epoch_time_in_ms())
        .build()?;
    config.start_rollout(EdgeConfigStateKind::Saving, targets.len() as u32);

    for endpoint_id in &targets {
        set_entry(txn, *endpoint_id, config.id, EdgeConfigStateKind::Saving)?;
        notify(txn, &fleet, &config, *endpoint_id, EdgeConfigStateKind::Saving)?;
    }
    put_config(txn, &config)?;
    effects.touch(targets);
    info!(
        edge_config_id = %config.id,
        total = config.progress.total,
        "created edge configuration"
    );
    Ok(config)
}

pub(crate) fn update(
    txn: &Transaction,
    req: &UpdateEdgeConfigurationRequest,
    effects: &mut WriteEffects,
) -> Result<EdgeConfiguration> {
    let mut config = require_config(txn, req.id)?;
    if config.state != EdgeConfigStateKind::Idle {
        return Err(EdgeError::InvalidState(format!(
            "edge configuration {} is {}, updates require idle",
            config.id, config.state
        ))
        .into());
    }
    // Another update may have gone through and settled since the files were
    // uploaded.
    if req.version != config.version + 1 {
        return Err(EdgeError::InvalidState(format!(
            "edge configuration {} is at version {}, version {} was uploaded",
            config.id, config.version, req.version
        ))
        .into());
    }
    let fleet = Fleet::load(txn)?;
    fleet.validate_groups(&req.edge_group_ids)?;

    let states = all_config_states(txn)?;
    let old_targets: BTreeSet<EndpointId> = config_entries(&states, &config).into_keys().collect();
    let new_targets = fleet.targets(&req.edge_group_ids);

    config.prev = Some(EdgeConfigPrev {
        category: config.category,
        edge_group_ids: config.edge_group_ids.clone(),
    });
    config.category = req.category;
    config.edge_group_ids = req.edge_group_ids.clone();
    // Only the replaced version is still served, anything older goes.
    if let Some(stale) = config.previous_files_dir() {
        effects.removed_blob_prefixes.push(stale);
    }
    config.prev_files_dir = Some(config.current_files_dir());
    config.files_dir = Some(req.files_dir.clone());
    config.version = req.version;
    config.files = req.files.clone();
    config.updated_at = Some(get_epoch_time_in_ms());
    config.updated_by = Some(req.updated_by.clone());

    let all: BTreeSet<EndpointId> = old_targets.union(&new_targets).copied().collect();
    config.start_rollout(EdgeConfigStateKind::Updating, all.len() as u32);
    for endpoint_id in &all {
        let state = match (old_targets.contains(endpoint_id), new_targets.contains(endpoint_id)) {
            (true, true) => EdgeConfigStateKind::Updating,
            (false, true) => EdgeConfigStateKind::Saving,
            _ => EdgeConfigStateKind::Deleting,
        };
        set_entry(txn, *endpoint_id, config.id, state)?;
        notify(txn, &fleet, &config, *endpoint_id, state)?;
    }
    put_config(txn, &config)?;
    effects.touch(all);
    info!(
        edge_config_id = %config.id,
        version = config.version,
        total = config.progress.total,
        "updated edge configuration"
    );
    Ok(config)
}

/// Starts deleting a configuration. It is removed once every endpoint
/// acknowledged, or right away when no endpoint holds it.
pub(crate) fn delete(txn: &Transaction, id: EdgeConfigId, effects: &mut WriteEffects) -> Result<()> {
    let mut config = require_config(txn, id)?;
    if config.state == EdgeConfigStateKind::Deleting {
        return Err(
            EdgeError::InvalidState(format!("edge configuration {} is already deleting", id))
                .into(),
        );
    }
    let states = all_config_states(txn)?;
    let entries = config_entries(&states, &config);
    if entries.is_empty() {
        return purge(txn, &config, effects);
    }

    let fleet = Fleet::load(txn)?;
    config.start_rollout(EdgeConfigStateKind::Deleting, entries.len() as u32);
    for endpoint_id in entries.keys() {
        set_entry(txn, *endpoint_id, config.id, EdgeConfigStateKind::Deleting)?;
        notify(txn, &fleet, &config, *endpoint_id, EdgeConfigStateKind::Deleting)?;
    }
    put_config(txn, &config)?;
    effects.touch(entries.into_keys());
    info!(edge_config_id = %id, "deleting edge configuration");
    Ok(())
}

/// Removes the configuration, every per-endpoint entry and its files.
fn purge(txn: &Transaction, config: &EdgeConfiguration, effects: &mut WriteEffects) -> Result<()> {
    for mut states in all_config_states(txn)? {
        if states.states.remove(&config.id).is_some() {
            effects.touch([states.endpoint_id]);
            put_config_states(txn, &states)?;
        }
    }
    delete_object(txn, EdgeObjectsColumns::EdgeConfigurations, config.key())?;
    effects
        .removed_blob_prefixes
        .push(EdgeConfiguration::files_prefix(config.id));
    info!(edge_config_id = %config.id, "deleted edge configuration");
    Ok(())
}

/// Applies one endpoint's acknowledgement.
pub(crate) fn transition(
    txn: &Transaction,
    req: &EdgeConfigTransitionRequest,
    effects: &mut WriteEffects,
) -> Result<()> {
    let mut config = require_config(txn, req.config_id)?;
    let mut states = get_config_states(txn, req.endpoint_id)?;
    let previous = *states.states.get(&req.config_id).ok_or_else(|| {
        EdgeError::InvalidState(format!(
            "endpoint {} holds no state for edge configuration {}",
            req.endpoint_id, req.config_id
        ))
    })?;
    previous.validate_transition(req.state)?;

    let effect = config.apply_transition(req.endpoint_id, previous, req.state);
    debug!(
        edge_config_id = %config.id,
        endpoint_id = %req.endpoint_id,
        from = %previous,
        to = %req.state,
        success = config.progress.success,
        total = config.progress.total,
        aggregate = %config.state,
        "edge configuration transition"
    );
    effects.touch([req.endpoint_id]);
    match effect {
        TransitionEffect::KeepEntry => {
            states.states.insert(config.id, req.state);
            put_config_states(txn, &states)?;
        }
        TransitionEffect::DropEntry => {
            states.states.remove(&config.id);
            put_config_states(txn, &states)?;
        }
        TransitionEffect::DeleteConfiguration => return purge(txn, &config, effects),
    }
    put_config(txn, &config)
}

/// Aligns per-endpoint entries with the current members of the
/// configuration's groups. A configuration being deleted is left alone.
pub(crate) fn reconcile_targets(
    txn: &Transaction,
    fleet: &Fleet,
    config: &mut EdgeConfiguration,
    effects: &mut WriteEffects,
) -> Result<()> {
    if config.state == EdgeConfigStateKind::Deleting {
        return Ok(());
    }
    let desired = fleet.targets(&config.edge_group_ids);
    let entries = config_entries(&all_config_states(txn)?, config);
    let mut changed = Vec::new();

    for endpoint_id in &desired {
        match entries.get(endpoint_id) {
            None => config.endpoint_added(),
            Some(EdgeConfigStateKind::Deleting) => config.endpoint_readded(*endpoint_id),
            Some(_) => continue,
        }
        set_entry(txn, *endpoint_id, config.id, EdgeConfigStateKind::Saving)?;
        notify(txn, fleet, config, *endpoint_id, EdgeConfigStateKind::Saving)?;
        changed.push(*endpoint_id);
    }
    for (endpoint_id, current) in &entries {
        if desired.contains(endpoint_id) || *current == EdgeConfigStateKind::Deleting {
            continue;
        }
        config.endpoint_removed(*endpoint_id, *current);
        set_entry(txn, *endpoint_id, config.id, EdgeConfigStateKind::Deleting)?;
        notify(txn, fleet, config, *endpoint_id, EdgeConfigStateKind::Deleting)?;
        changed.push(*endpoint_id);
    }
    if changed.is_empty() {
        return Ok(());
    }
    debug!(
        edge_config_id = %config.id,
        changed = changed.len(),
        success = config.progress.success,
        total = config.progress.total,
        "reconciled edge configuration targets"
    );
    effects.touch(changed);
    put_config(txn, config)
}

/// Folds a deleted endpoint out of every configuration it held.
pub(crate) fn remove_endpoint(
    txn: &Transaction,
    endpoint_id: EndpointId,
    effects: &mut WriteEffects,
) -> Result<()> {
    let states = get_config_states(txn, endpoint_id)?;
    delete_object(txn, EdgeObjectsColumns::EdgeConfigurationStates, endpoint_id.key())?;
    for (config_id, current) in &states.states {
        let Some(mut config) = get_object::<EdgeConfiguration>(
            txn,
            EdgeObjectsColumns::EdgeConfigurations,
            config_id.key(),
        )?
        else {
            continue;
        };
        if config.endpoint_deleted(endpoint_id, *current) {
            purge(txn, &config, effects)?;
        } else {
            put_config(txn, &config)?;
        }
    }
    Ok(())
}
