use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
};

use anyhow::Result;
use data_model::{
    related_endpoints,
    EdgeConfigStateKind,
    EdgeConfiguration,
    EdgeConfigurationState,
    EdgeError,
    EdgeGroup,
    EdgeGroupBuilder,
    EdgeGroupId,
    EdgeJob,
    EdgeStack,
    Endpoint,
    EndpointBuilder,
    EndpointId,
    EndpointRelation,
    Snapshot,
    StateMachineMetadata,
    UpdateSchedule,
};
use edge_utils::get_epoch_time_in_ms;
use serde::{de::DeserializeOwned, Serialize};
use strum::AsRefStr;
use tracing::{debug, info};

use crate::{
    async_commands,
    driver::Transaction,
    edge_configs,
    edge_jobs,
    edge_stacks,
    requests::{CreateEndpointRequest, EdgeGroupRequest, UpdateEndpointRequest},
    serializer::{JsonEncode, JsonEncoder},
};

#[derive(AsRefStr, strum::Display, strum::EnumIter, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeObjectsColumns {
    StateMachineMetadata, //  "sm_meta" -> StateMachineMetadata
    Sequences,            //  Column name -> last allocated id

    Endpoints,         //  EndpointId -> Endpoint
    EndpointEdgeIds,   //  Edge id -> EndpointId
    EndpointRelations, //  EndpointId -> EndpointRelation

    EdgeGroups, //  EdgeGroupId -> EdgeGroup
    EdgeStacks, //  EdgeStackId -> EdgeStack
    EdgeJobs,   //  EdgeJobId -> EdgeJob

    EdgeAsyncCommands, //  EndpointId_EdgeCommandId -> EdgeAsyncCommand

    EdgeConfigurations,      //  EdgeConfigId -> EdgeConfiguration
    EdgeConfigurationStates, //  EndpointId -> EdgeConfigurationState

    Snapshots,       //  EndpointId -> Snapshot
    UpdateSchedules, //  UpdateScheduleId -> UpdateSchedule
}

pub(crate) const SM_META_KEY: &[u8] = b"sm_meta";

/// Side effects of a write that are applied once its transaction committed.
#[derive(Debug, Default)]
pub(crate) struct WriteEffects {
    /// Endpoints whose derived status response changed.
    pub touched_endpoints: BTreeSet<EndpointId>,
    pub edge_id_upserts: Vec<(String, EndpointId)>,
    pub edge_id_removals: Vec<String>,
    pub removed_endpoints: Vec<EndpointId>,
    pub check_ins: Vec<EndpointId>,
    /// Blob prefixes that became unreachable.
    pub removed_blob_prefixes: Vec<String>,
    pub jobs_changed: bool,
}

impl WriteEffects {
    pub fn touch(&mut self, endpoints: impl IntoIterator<Item = EndpointId>) {
        self.touched_endpoints.extend(endpoints);
    }
}

pub(crate) fn get_object<T: DeserializeOwned>(
    txn: &Transaction,
    column: EdgeObjectsColumns,
    key: impl AsRef<[u8]>,
) -> Result<Option<T>> {
    txn.get(column, key)?
        .map(|bytes| JsonEncoder::decode(&bytes))
        .transpose()
}

pub(crate) fn require_object<T: DeserializeOwned>(
    txn: &Transaction,
    column: EdgeObjectsColumns,
    key: impl AsRef<[u8]>,
    kind: &'static str,
    id: impl std::fmt::Display,
) -> Result<T> {
    get_object(txn, column, key)?.ok_or_else(|| EdgeError::not_found(kind, id).into())
}

pub(crate) fn put_object<T: Serialize + Debug>(
    txn: &Transaction,
    column: EdgeObjectsColumns,
    key: impl AsRef<[u8]>,
    value: &T,
) -> Result<()> {
    let serialized = JsonEncoder::encode(value)?;
    txn.put(column, key, serialized)?;
    Ok(())
}

pub(crate) fn delete_object(
    txn: &Transaction,
    column: EdgeObjectsColumns,
    key: impl AsRef<[u8]>,
) -> Result<()> {
    txn.delete(column, key)?;
    Ok(())
}

pub(crate) fn scan_objects<T: DeserializeOwned>(
    txn: &Transaction,
    column: EdgeObjectsColumns,
    prefix: &[u8],
) -> Result<Vec<T>> {
    txn.scan_prefix(column, prefix)?
        .iter()
        .map(|(_, value)| JsonEncoder::decode(value))
        .collect()
}

/// Allocates the next id of `column`. The counter key is locked until the
/// transaction ends, so concurrent writers never hand out the same id.
pub(crate) fn next_id(txn: &Transaction, column: EdgeObjectsColumns) -> Result<u64> {
    let key = column.as_ref();
    let current: u64 = get_object(txn, EdgeObjectsColumns::Sequences, key)?.unwrap_or_default();
    let next = current + 1;
    put_object(txn, EdgeObjectsColumns::Sequences, key, &next)?;
    Ok(next)
}

pub(crate) fn write_sm_meta(txn: &Transaction, sm_meta: &StateMachineMetadata) -> Result<()> {
    put_object(txn, EdgeObjectsColumns::StateMachineMetadata, SM_META_KEY, sm_meta)
}

/// Endpoints and groups loaded once per write, used to resolve group
/// membership.
pub(crate) struct Fleet {
    pub endpoints: Vec<Endpoint>,
    pub groups: BTreeMap<EdgeGroupId, EdgeGroup>,
}

impl Fleet {
    pub fn load(txn: &Transaction) -> Result<Self> {
        let endpoints = scan_objects(txn, EdgeObjectsColumns::Endpoints, &[])?;
        let groups = scan_objects::<EdgeGroup>(txn, EdgeObjectsColumns::EdgeGroups, &[])?
            .into_iter()
            .map(|group| (group.id, group))
            .collect();
        Ok(Self { endpoints, groups })
    }

    pub fn targets(&self, group_ids: &BTreeSet<EdgeGroupId>) -> BTreeSet<EndpointId> {
        related_endpoints(
            group_ids.iter().filter_map(|id| self.groups.get(id)),
            &self.endpoints,
        )
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|endpoint| endpoint.id == id)
    }

    pub fn is_async(&self, id: EndpointId) -> bool {
        self.endpoint(id).is_some_and(Endpoint::is_async)
    }

    pub fn validate_groups(&self, group_ids: &BTreeSet<EdgeGroupId>) -> Result<()> {
        if let Some(missing) = group_ids.iter().find(|id| !self.groups.contains_key(id)) {
            return Err(EdgeError::not_found("edge group", missing).into());
        }
        Ok(())
    }
}

pub(crate) fn lookup_edge_id(txn: &Transaction, edge_id: &str) -> Result<Option<EndpointId>> {
    get_object(txn, EdgeObjectsColumns::EndpointEdgeIds, edge_id.as_bytes())
}

fn bind_edge_id(
    txn: &Transaction,
    edge_id: &str,
    endpoint_id: EndpointId,
    effects: &mut WriteEffects,
) -> Result<()> {
    if let Some(owner) = lookup_edge_id(txn, edge_id)? {
        if owner != endpoint_id {
            return Err(EdgeError::BadRequest(format!(
                "edge id {} is already registered to endpoint {}",
                edge_id, owner
            ))
            .into());
        }
    }
    put_object(
        txn,
        EdgeObjectsColumns::EndpointEdgeIds,
        edge_id.as_bytes(),
        &endpoint_id,
    )?;
    effects
        .edge_id_upserts
        .push((edge_id.to_string(), endpoint_id));
    Ok(())
}

pub(crate) fn create_endpoint(
    txn: &Transaction,
    req: &CreateEndpointRequest,
    effects: &mut WriteEffects,
) -> Result<Endpoint> {
    let id = EndpointId::new(next_id(txn, EdgeObjectsColumns::Endpoints)?);
    let endpoint = EndpointBuilder::default()
        .id(id)
        .name(req.name.clone())
        .endpoint_type(req.endpoint_type)
        .edge_id(req.edge_id.clone())
        .edge(req.edge.clone())
        .checkin_interval(req.checkin_interval)
        .local_time_zone(req.local_time_zone.clone())
        .user_trusted(req.user_trusted)
        .tag_ids(req.tag_ids.clone())
        .created_at(get_epoch_time_in_ms())
        .build()?;
    insert_endpoint(txn, &endpoint, effects)?;
    info!(endpoint_id = %id, name = endpoint.name, "created endpoint");
    Ok(endpoint)
}

pub(crate) fn insert_endpoint(
    txn: &Transaction,
    endpoint: &Endpoint,
    effects: &mut WriteEffects,
) -> Result<()> {
    if let Some(edge_id) = &endpoint.edge_id {
        bind_edge_id(txn, edge_id, endpoint.id, effects)?;
    }
    put_object(txn, EdgeObjectsColumns::Endpoints, endpoint.key(), endpoint)?;
    put_object(
        txn,
        EdgeObjectsColumns::EndpointRelations,
        endpoint.key(),
        &EndpointRelation::new(endpoint.id),
    )?;
    effects.touch([endpoint.id]);
    reconcile_memberships(txn, effects)
}

pub(crate) fn update_endpoint(
    txn: &Transaction,
    req: &UpdateEndpointRequest,
    effects: &mut WriteEffects,
) -> Result<Endpoint> {
    let mut endpoint: Endpoint = require_object(
        txn,
        EdgeObjectsColumns::Endpoints,
        req.id.key(),
        "endpoint",
        req.id,
    )?;
    if let Some(name) = &req.name {
        endpoint.name = name.clone();
    }
    if let Some(edge) = &req.edge {
        endpoint.edge = edge.clone();
    }
    if let Some(interval) = req.checkin_interval {
        endpoint.checkin_interval = interval;
    }
    if let Some(trusted) = req.user_trusted {
        endpoint.user_trusted = trusted;
    }
    if let Some(tz) = &req.local_time_zone {
        endpoint.local_time_zone = Some(tz.clone());
    }
    let tags_changed = match &req.tag_ids {
        Some(tags) if *tags != endpoint.tag_ids => {
            endpoint.tag_ids = tags.clone();
            true
        }
        _ => false,
    };
    put_object(txn, EdgeObjectsColumns::Endpoints, endpoint.key(), &endpoint)?;
    effects.touch([endpoint.id]);
    if tags_changed {
        debug!(endpoint_id = %endpoint.id, "endpoint tags changed, recomputing memberships");
        reconcile_memberships(txn, effects)?;
    }
    Ok(endpoint)
}

/// Persists agent-reported metadata. Binds the edge id when the endpoint
/// has none yet.
pub(crate) fn record_agent_report(
    txn: &Transaction,
    endpoint: &mut Endpoint,
    edge_id: &str,
    report: &data_model::AgentReport,
    effects: &mut WriteEffects,
) -> Result<()> {
    let mut changed = endpoint.apply_agent_report(report);
    match endpoint.edge_id.as_deref() {
        None => {
            bind_edge_id(txn, edge_id, endpoint.id, effects)?;
            endpoint.edge_id = Some(edge_id.to_string());
            changed = true;
        }
        Some(bound) if bound != edge_id => {
            return Err(EdgeError::Forbidden(format!(
                "edge id does not match endpoint {}",
                endpoint.id
            ))
            .into());
        }
        Some(_) => {}
    }
    if changed {
        put_object(txn, EdgeObjectsColumns::Endpoints, endpoint.key(), endpoint)?;
        effects.touch([endpoint.id]);
    }
    effects.check_ins.push(endpoint.id);
    Ok(())
}

pub(crate) fn delete_endpoint(
    txn: &Transaction,
    endpoint_id: EndpointId,
    effects: &mut WriteEffects,
) -> Result<()> {
    let endpoint: Endpoint = require_object(
        txn,
        EdgeObjectsColumns::Endpoints,
        endpoint_id.key(),
        "endpoint",
        endpoint_id,
    )?;
    let key = endpoint.key();
    if let Some(edge_id) = &endpoint.edge_id {
        delete_object(txn, EdgeObjectsColumns::EndpointEdgeIds, edge_id.as_bytes())?;
        effects.edge_id_removals.push(edge_id.clone());
    }
    delete_object(txn, EdgeObjectsColumns::Endpoints, key)?;
    delete_object(txn, EdgeObjectsColumns::EndpointRelations, key)?;
    delete_object(txn, EdgeObjectsColumns::Snapshots, key)?;

    for mut group in scan_objects::<EdgeGroup>(txn, EdgeObjectsColumns::EdgeGroups, &[])? {
        if group.endpoints.remove(&endpoint_id) {
            put_object(txn, EdgeObjectsColumns::EdgeGroups, group.id.key(), &group)?;
        }
    }
    edge_stacks::remove_endpoint(txn, endpoint_id)?;
    edge_jobs::remove_endpoint(txn, endpoint_id, effects)?;
    edge_configs::remove_endpoint(txn, endpoint_id, effects)?;
    async_commands::remove_for_endpoint(txn, endpoint_id)?;

    effects.removed_endpoints.push(endpoint_id);
    effects.touch([endpoint_id]);
    info!(endpoint_id = %endpoint_id, "deleted endpoint");
    Ok(())
}

pub(crate) fn create_edge_group(txn: &Transaction, req: &EdgeGroupRequest) -> Result<EdgeGroup> {
    let id = EdgeGroupId::new(next_id(txn, EdgeObjectsColumns::EdgeGroups)?);
    let group = EdgeGroupBuilder::default()
        .id(id)
        .name(req.name.clone())
        .dynamic(req.dynamic)
        .tag_ids(req.tag_ids.clone())
        .partial_match(req.partial_match)
        .endpoints(req.endpoints.clone())
        .created_at(get_epoch_time_in_ms())
        .build()?;
    // A new group has no dependents yet, so there is nothing to reconcile.
    put_object(txn, EdgeObjectsColumns::EdgeGroups, group.id.key(), &group)?;
    Ok(group)
}

pub(crate) fn update_edge_group(
    txn: &Transaction,
    id: EdgeGroupId,
    req: &EdgeGroupRequest,
    effects: &mut WriteEffects,
) -> Result<EdgeGroup> {
    let mut group: EdgeGroup =
        require_object(txn, EdgeObjectsColumns::EdgeGroups, id.key(), "edge group", id)?;
    group.name = req.name.clone();
    group.dynamic = req.dynamic;
    group.tag_ids = req.tag_ids.clone();
    group.partial_match = req.partial_match;
    group.endpoints = req.endpoints.clone();
    put_object(txn, EdgeObjectsColumns::EdgeGroups, group.id.key(), &group)?;
    reconcile_memberships(txn, effects)?;
    Ok(group)
}

pub(crate) fn delete_edge_group(txn: &Transaction, id: EdgeGroupId) -> Result<()> {
    let _: EdgeGroup =
        require_object(txn, EdgeObjectsColumns::EdgeGroups, id.key(), "edge group", id)?;

    let in_use = |what: &str| -> anyhow::Error {
        EdgeError::InvalidState(format!("edge group {} is used by {}", id, what)).into()
    };
    let stacks: Vec<EdgeStack> = scan_objects(txn, EdgeObjectsColumns::EdgeStacks, &[])?;
    if let Some(stack) = stacks.iter().find(|s| s.edge_groups.contains(&id)) {
        return Err(in_use(&format!("edge stack {}", stack.id)));
    }
    let configs: Vec<EdgeConfiguration> =
        scan_objects(txn, EdgeObjectsColumns::EdgeConfigurations, &[])?;
    if let Some(config) = configs.iter().find(|c| c.edge_group_ids.contains(&id)) {
        return Err(in_use(&format!("edge configuration {}", config.id)));
    }
    let jobs: Vec<EdgeJob> = scan_objects(txn, EdgeObjectsColumns::EdgeJobs, &[])?;
    if let Some(job) = jobs.iter().find(|j| j.edge_groups.contains(&id)) {
        return Err(in_use(&format!("edge job {}", job.id)));
    }
    let schedules: Vec<UpdateSchedule> =
        scan_objects(txn, EdgeObjectsColumns::UpdateSchedules, &[])?;
    if let Some(schedule) = schedules.iter().find(|s| s.edge_group_ids.contains(&id)) {
        return Err(in_use(&format!("update schedule {}", schedule.id)));
    }
    delete_object(txn, EdgeObjectsColumns::EdgeGroups, id.key())
}

/// Brings stack relations, configuration states and job targets in line with
/// the current group membership of every endpoint.
pub(crate) fn reconcile_memberships(txn: &Transaction, effects: &mut WriteEffects) -> Result<()> {
    let fleet = Fleet::load(txn)?;
    for mut stack in scan_objects::<EdgeStack>(txn, EdgeObjectsColumns::EdgeStacks, &[])? {
        edge_stacks::reconcile_targets(txn, &fleet, &mut stack, effects)?;
    }
    for mut config in
        scan_objects::<EdgeConfiguration>(txn, EdgeObjectsColumns::EdgeConfigurations, &[])?
    {
        edge_configs::reconcile_targets(txn, &fleet, &mut config, effects)?;
    }
    for mut job in scan_objects::<EdgeJob>(txn, EdgeObjectsColumns::EdgeJobs, &[])? {
        edge_jobs::reconcile_targets(txn, &fleet, &mut job, effects)?;
    }
    Ok(())
}

pub(crate) fn get_relation(txn: &Transaction, endpoint_id: EndpointId) -> Result<EndpointRelation> {
    Ok(
        get_object(txn, EdgeObjectsColumns::EndpointRelations, endpoint_id.key())?
            .unwrap_or_else(|| EndpointRelation::new(endpoint_id)),
    )
}

pub(crate) fn put_relation(txn: &Transaction, relation: &EndpointRelation) -> Result<()> {
    put_object(
        txn,
        EdgeObjectsColumns::EndpointRelations,
        relation.endpoint_id.key(),
        relation,
    )
}

pub(crate) fn get_config_states(
    txn: &Transaction,
    endpoint_id: EndpointId,
) -> Result<EdgeConfigurationState> {
    Ok(
        get_object(txn, EdgeObjectsColumns::EdgeConfigurationStates, endpoint_id.key())?
            .unwrap_or_else(|| EdgeConfigurationState::new(endpoint_id)),
    )
}

pub(crate) fn put_config_states(txn: &Transaction, states: &EdgeConfigurationState) -> Result<()> {
    if states.states.is_empty() {
        return delete_object(txn, EdgeObjectsColumns::EdgeConfigurationStates, states.key());
    }
    put_object(
        txn,
        EdgeObjectsColumns::EdgeConfigurationStates,
        states.key(),
        states,
    )
}

pub(crate) fn all_config_states(txn: &Transaction) -> Result<Vec<EdgeConfigurationState>> {
    scan_objects(txn, EdgeObjectsColumns::EdgeConfigurationStates, &[])
}

pub(crate) fn get_snapshot(txn: &Transaction, endpoint_id: EndpointId) -> Result<Snapshot> {
    Ok(get_object(txn, EdgeObjectsColumns::Snapshots, endpoint_id.key())?
        .unwrap_or_else(|| Snapshot::new(endpoint_id)))
}

/// Current per-endpoint state of `config` for every endpoint that has one.
pub(crate) fn config_entries(
    states: &[EdgeConfigurationState],
    config: &EdgeConfiguration,
) -> BTreeMap<EndpointId, EdgeConfigStateKind> {
    states
        .iter()
        .filter_map(|s| s.states.get(&config.id).map(|state| (s.endpoint_id, *state)))
        .collect()
}
