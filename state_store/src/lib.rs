use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use data_model::{EdgeError, Endpoint, EndpointId, StateMachineMetadata};
use edge_utils::get_epoch_time_in_ms;
use in_memory_state::EndpointDirectory;
use metrics::{StateStoreMetrics, Timer};
use opentelemetry::KeyValue;
use requests::{
    RequestPayload,
    StackStatusOutcome,
    StateMachineUpdateRequest,
    WriteOutcome,
};
use rocksdb::{ColumnFamilyDescriptor, Options};
use serde::{Deserialize, Serialize};
use state_machine::{EdgeObjectsColumns, WriteEffects};
use status_cache::StatusCache;
use strum::IntoEnumIterator;
use tracing::{debug, info};

use crate::driver::{RocksDBConfig, RocksDBDriver, Transaction, Writer};

pub mod async_commands;
pub mod checkins;
pub mod driver;
pub mod edge_configs;
pub mod edge_jobs;
pub mod edge_stacks;
pub mod in_memory_state;
pub mod requests;
pub mod scanner;
pub mod serializer;
pub mod snapshots;
pub mod state_machine;
pub mod status_cache;
pub mod update_schedules;

#[cfg(test)]
pub mod test_state_store;

const CURRENT_DB_VERSION: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusCacheConfig {
    pub ttl_secs: u64,
    pub max_capacity: u64,
}

impl Default for StatusCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10,
            max_capacity: 10_000,
        }
    }
}

/// What a committed write changed, for the services that keep derived state
/// outside the store.
#[derive(Debug, Default)]
pub struct WriteResult {
    pub outcome: WriteOutcome,
    /// Blob prefixes nothing references anymore.
    pub removed_blob_prefixes: Vec<String>,
    pub removed_endpoints: Vec<EndpointId>,
    pub jobs_changed: bool,
}

pub struct EdgeState {
    pub db: Arc<RocksDBDriver>,
    pub db_version: u64,
    pub metrics: Arc<StateStoreMetrics>,
    pub directory: EndpointDirectory,
    pub status_cache: StatusCache,
}

pub(crate) fn open_database<I>(
    path: PathBuf,
    config: RocksDBConfig,
    column_families: I,
) -> Result<RocksDBDriver>
where
    I: Iterator<Item = ColumnFamilyDescriptor>,
{
    info!(
        "opening state store database at {} with config {}",
        path.display(),
        config
    );
    let options = driver::rocksdb::Options {
        path,
        config,
        column_families: column_families.collect::<Vec<_>>(),
    };
    RocksDBDriver::open(options).map_err(Into::into)
}

impl EdgeState {
    pub async fn new(
        path: PathBuf,
        config: RocksDBConfig,
        cache_config: StatusCacheConfig,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(path.clone())
            .map_err(|e| anyhow!("failed to create state store dir: {}", e))?;

        let sm_column_families = EdgeObjectsColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        let db = Arc::new(open_database(path, config, sm_column_families)?);
        let sm_meta = read_sm_meta(&db)?;

        let metrics = Arc::new(StateStoreMetrics::new());
        let reader = scanner::StateReader::new(db.clone(), metrics.clone());
        let directory = EndpointDirectory::new(&reader)?;
        let status_cache = StatusCache::new(
            Duration::from_secs(cache_config.ttl_secs),
            cache_config.max_capacity,
            metrics.clone(),
        );

        info!(db_version = sm_meta.db_version, "db version discovered");
        Ok(Arc::new(Self {
            db,
            db_version: sm_meta.db_version,
            metrics,
            directory,
            status_cache,
        }))
    }

    #[tracing::instrument(
        skip(self, request),
        fields(
            request_type = request.payload.to_string(),
        )
    )]
    pub async fn write(&self, request: StateMachineUpdateRequest) -> Result<WriteResult> {
        let timer_kv = &[KeyValue::new("request", request.payload.to_string())];
        debug!("writing state machine update request: {:?}", request);
        let _timer = Timer::start_with_labels(&self.metrics.state_write, timer_kv);

        // The transaction is not Send, so it never lives across an await.
        let (outcome, effects) = self.apply(&request.payload)?;

        self.directory.apply(&effects, get_epoch_time_in_ms()).await;
        self.status_cache
            .invalidate(effects.touched_endpoints.iter().copied())
            .await;

        Ok(WriteResult {
            outcome,
            removed_blob_prefixes: effects.removed_blob_prefixes,
            removed_endpoints: effects.removed_endpoints,
            jobs_changed: effects.jobs_changed,
        })
    }

    fn apply(&self, payload: &RequestPayload) -> Result<(WriteOutcome, WriteEffects)> {
        let txn = self.db.transaction();
        let mut effects = WriteEffects::default();
        let outcome = apply_payload(&txn, payload, &mut effects)?;
        txn.commit()?;
        Ok((outcome, effects))
    }

    pub fn reader(&self) -> scanner::StateReader {
        scanner::StateReader::new(self.db.clone(), self.metrics.clone())
    }

    /// Allocates an id ahead of a create, so files can be stored under it
    /// before the record exists.
    pub fn allocate_id(&self, column: EdgeObjectsColumns) -> Result<u64> {
        let txn = self.db.transaction();
        let id = state_machine::next_id(&txn, column)?;
        txn.commit()?;
        Ok(id)
    }
}

fn apply_payload(
    txn: &Transaction,
    payload: &RequestPayload,
    effects: &mut WriteEffects,
) -> Result<WriteOutcome> {
    let outcome = match payload {
        RequestPayload::CreateEndpoint(req) => {
            let endpoint = state_machine::create_endpoint(txn, req, effects)?;
            WriteOutcome::Endpoint(Box::new(endpoint))
        }
        RequestPayload::UpdateEndpoint(req) => {
            let endpoint = state_machine::update_endpoint(txn, req, effects)?;
            WriteOutcome::Endpoint(Box::new(endpoint))
        }
        RequestPayload::DeleteEndpoint(id) => {
            state_machine::delete_endpoint(txn, *id, effects)?;
            WriteOutcome::Done
        }
        RequestPayload::CreateEdgeGroup(req) => {
            let group = state_machine::create_edge_group(txn, req)?;
            WriteOutcome::Created(group.id.get())
        }
        RequestPayload::UpdateEdgeGroup((id, req)) => {
            state_machine::update_edge_group(txn, *id, req, effects)?;
            WriteOutcome::Done
        }
        RequestPayload::DeleteEdgeGroup(id) => {
            state_machine::delete_edge_group(txn, *id)?;
            WriteOutcome::Done
        }
        RequestPayload::CreateEdgeStack(req) => {
            let stack = edge_stacks::create(txn, req, effects)?;
            WriteOutcome::Created(stack.id.get())
        }
        RequestPayload::UpdateEdgeStack(req) => {
            edge_stacks::update(txn, req, effects)?;
            WriteOutcome::Done
        }
        RequestPayload::DeleteEdgeStack(id) => {
            edge_stacks::delete(txn, *id, effects)?;
            WriteOutcome::Done
        }
        RequestPayload::UpdateEdgeStackStatus(report) => {
            let deployed_update = edge_stacks::update_status(txn, report)?;
            effects.touch([report.endpoint_id]);
            WriteOutcome::StackStatus(StackStatusOutcome { deployed_update })
        }
        RequestPayload::CreateEdgeJob(req) => {
            let job = edge_jobs::create(txn, req, effects)?;
            WriteOutcome::Created(job.id.get())
        }
        RequestPayload::DeleteEdgeJob(id) => {
            edge_jobs::delete(txn, *id, effects)?;
            WriteOutcome::Done
        }
        RequestPayload::RequestEdgeJobLogs(req) => {
            edge_jobs::request_logs(txn, req, effects)?;
            WriteOutcome::Done
        }
        RequestPayload::EdgeJobLogsCollected(req) => {
            edge_jobs::logs_collected(txn, req, effects)?;
            WriteOutcome::Done
        }
        RequestPayload::CreateEdgeConfiguration(req) => {
            let config = edge_configs::create(txn, req, effects)?;
            WriteOutcome::Created(config.id.get())
        }
        RequestPayload::UpdateEdgeConfiguration(req) => {
            edge_configs::update(txn, req, effects)?;
            WriteOutcome::Done
        }
        RequestPayload::DeleteEdgeConfiguration(id) => {
            edge_configs::delete(txn, *id, effects)?;
            WriteOutcome::Done
        }
        RequestPayload::EdgeConfigurationTransition(req) => {
            edge_configs::transition(txn, req, effects)?;
            WriteOutcome::Done
        }
        RequestPayload::AppendEdgeCommand(req) => {
            let endpoint: Endpoint = state_machine::require_object(
                txn,
                EdgeObjectsColumns::Endpoints,
                req.endpoint_id.key(),
                "endpoint",
                req.endpoint_id,
            )?;
            if !async_commands::append(txn, &endpoint, req.command.clone())? {
                return Err(EdgeError::InvalidState(format!(
                    "endpoint {} is not in async mode",
                    endpoint.id
                ))
                .into());
            }
            WriteOutcome::Done
        }
        RequestPayload::AsyncCheckIn(req) => {
            let outcome = checkins::async_check_in(txn, req, effects)?;
            WriteOutcome::AsyncCheckIn(Box::new(outcome))
        }
        RequestPayload::StatusCheckIn(req) => {
            let outcome = checkins::status_check_in(txn, req, effects)?;
            WriteOutcome::StatusCheckIn(Box::new(outcome))
        }
        RequestPayload::CreateUpdateSchedule(req) => {
            WriteOutcome::UpdateSchedule(update_schedules::create(txn, req, effects)?)
        }
        RequestPayload::UpdateUpdateSchedule(req) => {
            WriteOutcome::UpdateSchedule(update_schedules::update(txn, req, effects)?)
        }
        RequestPayload::DeleteUpdateSchedule(id) => {
            WriteOutcome::UpdateSchedule(update_schedules::delete(txn, *id, effects)?)
        }
        RequestPayload::MarkRemoteUpdateSuccess(req) => {
            update_schedules::mark_remote_update_success(txn, req, effects)?;
            WriteOutcome::Done
        }
    };
    Ok(outcome)
}

/// Reads the metadata record, writing the current version on a fresh
/// database.
fn read_sm_meta(db: &RocksDBDriver) -> Result<StateMachineMetadata> {
    let txn = db.transaction();
    let existing: Option<StateMachineMetadata> = state_machine::get_object(
        &txn,
        EdgeObjectsColumns::StateMachineMetadata,
        state_machine::SM_META_KEY,
    )?;
    let sm_meta = match existing {
        Some(sm_meta) => sm_meta,
        None => {
            let sm_meta = StateMachineMetadata {
                db_version: CURRENT_DB_VERSION,
            };
            state_machine::write_sm_meta(&txn, &sm_meta)?;
            sm_meta
        }
    };
    txn.commit()?;
    Ok(sm_meta)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use data_model::{
        AgentReport,
        EdgeConfigCategory,
        EdgeConfigId,
        EdgeConfigStateKind,
        EdgeGroupId,
        EdgeStackId,
        EdgeStackStatusKind,
        EndpointEdgeSettings,
        StackDeploymentType,
        TagId,
    };
    use requests::{
        AsyncCheckInRequest,
        AutoCreatePolicy,
        CreateEdgeConfigurationRequest,
        CreateEdgeStackRequest,
        CreateEndpointRequest,
        EdgeConfigTransitionRequest,
        EdgeGroupRequest,
        StackStatusReport,
        UpdateEdgeConfigurationRequest,
        UpdateEdgeStackRequest,
        UpdateEndpointRequest,
    };

    use data_model::snapshot_hash;
    use serde_json::{json, Value};
    use snapshots::{SnapshotPart, SnapshotPayload};

    use super::*;
    use crate::test_state_store::TestStateStore;

    async fn write(state: &EdgeState, payload: RequestPayload) -> Result<WriteResult> {
        state.write(StateMachineUpdateRequest { payload }).await
    }

    async fn create_endpoint(state: &EdgeState, edge_id: &str, tags: &[u64]) -> Result<EndpointId> {
        let result = write(
            state,
            RequestPayload::CreateEndpoint(CreateEndpointRequest {
                name: edge_id.to_string(),
                edge_id: Some(edge_id.to_string()),
                edge: EndpointEdgeSettings {
                    async_mode: true,
                    ..Default::default()
                },
                user_trusted: true,
                tag_ids: tags.iter().copied().map(TagId::new).collect(),
                ..Default::default()
            }),
        )
        .await?;
        match result.outcome {
            WriteOutcome::Endpoint(endpoint) => Ok(endpoint.id),
            other => Err(anyhow!("unexpected outcome {:?}", other)),
        }
    }

    async fn create_group(state: &EdgeState, endpoints: &[EndpointId]) -> Result<EdgeGroupId> {
        let result = write(
            state,
            RequestPayload::CreateEdgeGroup(EdgeGroupRequest {
                name: "group".to_string(),
                endpoints: endpoints.iter().copied().collect(),
                ..Default::default()
            }),
        )
        .await?;
        match result.outcome {
            WriteOutcome::Created(id) => Ok(EdgeGroupId::new(id)),
            other => Err(anyhow!("unexpected outcome {:?}", other)),
        }
    }

    async fn set_group_members(
        state: &EdgeState,
        group: EdgeGroupId,
        endpoints: &[EndpointId],
    ) -> Result<()> {
        write(
            state,
            RequestPayload::UpdateEdgeGroup((
                group,
                EdgeGroupRequest {
                    name: "group".to_string(),
                    endpoints: endpoints.iter().copied().collect(),
                    ..Default::default()
                },
            )),
        )
        .await?;
        Ok(())
    }

    async fn ack(
        state: &EdgeState,
        config_id: EdgeConfigId,
        endpoint_id: EndpointId,
        next: EdgeConfigStateKind,
    ) -> Result<()> {
        write(
            state,
            RequestPayload::EdgeConfigurationTransition(EdgeConfigTransitionRequest {
                config_id,
                endpoint_id,
                state: next,
            }),
        )
        .await?;
        Ok(())
    }

    fn config_request(id: u64, group: EdgeGroupId) -> CreateEdgeConfigurationRequest {
        CreateEdgeConfigurationRequest {
            id: EdgeConfigId::new(id),
            name: format!("config-{}", id),
            base_dir: "/etc/edge".to_string(),
            category: EdgeConfigCategory::General,
            edge_group_ids: BTreeSet::from([group]),
            files: vec!["app.conf".to_string()],
            files_dir: format!("edge_configs/{}/v1-first", id),
            created_by: "admin".to_string(),
        }
    }

    fn config_update(id: u64, version: u32, nonce: &str) -> UpdateEdgeConfigurationRequest {
        UpdateEdgeConfigurationRequest {
            id: EdgeConfigId::new(id),
            category: EdgeConfigCategory::General,
            edge_group_ids: BTreeSet::new(),
            version,
            files: vec!["app.conf".to_string()],
            files_dir: format!("edge_configs/{}/v{}-{}", id, version, nonce),
            updated_by: "admin".to_string(),
        }
    }

    fn stack_request(id: u64, group: EdgeGroupId) -> CreateEdgeStackRequest {
        CreateEdgeStackRequest {
            id: EdgeStackId::new(id),
            name: format!("stack-{}", id),
            edge_groups: BTreeSet::from([group]),
            deployment_type: StackDeploymentType::Compose,
            entry_point: "docker-compose.yml".to_string(),
            scheduled_time: None,
            update_schedule_id: None,
        }
    }

    #[tokio::test]
    async fn test_configuration_rollout_scenario() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let first = create_endpoint(&state, "edge-1", &[]).await?;
        let second = create_endpoint(&state, "edge-2", &[]).await?;
        let group = create_group(&state, &[first, second]).await?;

        write(
            &state,
            RequestPayload::CreateEdgeConfiguration(config_request(1, group)),
        )
        .await?;
        let config_id = EdgeConfigId::new(1);
        let reader = state.reader();
        let config = reader.get_edge_configuration(config_id)?.unwrap();
        assert_eq!(config.state, EdgeConfigStateKind::Saving);
        assert_eq!((config.progress.success, config.progress.total), (0, 2));

        ack(&state, config_id, first, EdgeConfigStateKind::Idle).await?;
        ack(&state, config_id, second, EdgeConfigStateKind::Idle).await?;
        let config = reader.get_edge_configuration(config_id)?.unwrap();
        assert_eq!(config.state, EdgeConfigStateKind::Idle);
        assert_eq!((config.progress.success, config.progress.total), (2, 2));

        set_group_members(&state, group, &[first]).await?;
        let config = reader.get_edge_configuration(config_id)?.unwrap();
        assert_eq!((config.progress.success, config.progress.total), (2, 2));
        assert_eq!(
            reader.get_config_states(second)?.states.get(&config_id),
            Some(&EdgeConfigStateKind::Deleting)
        );

        ack(&state, config_id, second, EdgeConfigStateKind::Idle).await?;
        let config = reader.get_edge_configuration(config_id)?.unwrap();
        assert_eq!(config.state, EdgeConfigStateKind::Idle);
        assert_eq!((config.progress.success, config.progress.total), (1, 1));
        assert!(reader.get_config_states(second)?.states.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_configuration_update_is_rejected() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        // No members, so every rollout settles right away.
        let group = create_group(&state, &[]).await?;
        let config_id = EdgeConfigId::new(1);
        write(
            &state,
            RequestPayload::CreateEdgeConfiguration(config_request(1, group)),
        )
        .await?;

        let result = write(
            &state,
            RequestPayload::UpdateEdgeConfiguration(config_update(1, 2, "a")),
        )
        .await?;
        assert!(result.removed_blob_prefixes.is_empty());

        // A second upload prepared against version 1 lost the race.
        let err = write(
            &state,
            RequestPayload::UpdateEdgeConfiguration(config_update(1, 2, "b")),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EdgeError>(),
            Some(EdgeError::InvalidState(_))
        ));
        let config = state.reader().get_edge_configuration(config_id)?.unwrap();
        assert_eq!(config.version, 2);
        assert_eq!(config.current_files_dir(), "edge_configs/1/v2-a");
        assert_eq!(config.previous_files_dir().as_deref(), Some("edge_configs/1/v1-first"));

        let result = write(
            &state,
            RequestPayload::UpdateEdgeConfiguration(config_update(1, 3, "c")),
        )
        .await?;
        assert_eq!(
            result.removed_blob_prefixes,
            vec!["edge_configs/1/v1-first".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let endpoint = create_endpoint(&state, "edge-1", &[]).await?;
        let group = create_group(&state, &[endpoint]).await?;
        write(
            &state,
            RequestPayload::CreateEdgeConfiguration(config_request(1, group)),
        )
        .await?;

        let err = ack(&state, EdgeConfigId::new(1), endpoint, EdgeConfigStateKind::Updating)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EdgeError>(),
            Some(EdgeError::InvalidTransition { .. })
        ));
        let states = state.reader().get_config_states(endpoint)?;
        assert_eq!(
            states.states.get(&EdgeConfigId::new(1)),
            Some(&EdgeConfigStateKind::Saving)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_deleting_configuration_purges_after_last_ack() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let endpoint = create_endpoint(&state, "edge-1", &[]).await?;
        let group = create_group(&state, &[endpoint]).await?;
        let config_id = EdgeConfigId::new(1);
        write(
            &state,
            RequestPayload::CreateEdgeConfiguration(config_request(1, group)),
        )
        .await?;
        ack(&state, config_id, endpoint, EdgeConfigStateKind::Idle).await?;

        write(&state, RequestPayload::DeleteEdgeConfiguration(config_id)).await?;
        let err = write(&state, RequestPayload::DeleteEdgeConfiguration(config_id))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EdgeError>(),
            Some(EdgeError::InvalidState(_))
        ));

        let result = write(
            &state,
            RequestPayload::EdgeConfigurationTransition(EdgeConfigTransitionRequest {
                config_id,
                endpoint_id: endpoint,
                state: EdgeConfigStateKind::Idle,
            }),
        )
        .await?;
        assert_eq!(result.removed_blob_prefixes, vec!["edge_configs/1".to_string()]);
        assert!(state.reader().get_edge_configuration(config_id)?.is_none());
        assert!(state.reader().get_config_states(endpoint)?.states.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_dynamic_group_follows_tags() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let tagged = create_endpoint(&state, "edge-1", &[7]).await?;
        let untagged = create_endpoint(&state, "edge-2", &[]).await?;
        let result = write(
            &state,
            RequestPayload::CreateEdgeGroup(EdgeGroupRequest {
                name: "tagged".to_string(),
                dynamic: true,
                tag_ids: BTreeSet::from([TagId::new(7)]),
                ..Default::default()
            }),
        )
        .await?;
        let WriteOutcome::Created(group) = result.outcome else {
            panic!("group not created");
        };
        let group = EdgeGroupId::new(group);
        write(&state, RequestPayload::CreateEdgeStack(stack_request(1, group))).await?;

        let reader = state.reader();
        let stack = reader.get_edge_stack(EdgeStackId::new(1))?.unwrap();
        assert_eq!(stack.status.keys().copied().collect::<Vec<_>>(), vec![tagged]);
        assert_eq!(stack.num_deployments, 1);

        write(
            &state,
            RequestPayload::UpdateEndpoint(UpdateEndpointRequest {
                id: untagged,
                tag_ids: Some(BTreeSet::from([TagId::new(7)])),
                ..Default::default()
            }),
        )
        .await?;
        let stack = reader.get_edge_stack(EdgeStackId::new(1))?.unwrap();
        assert_eq!(stack.num_deployments, 2);
        let relation = reader.get_relation(untagged)?.unwrap();
        assert_eq!(
            relation.enabled_stacks().collect::<Vec<_>>(),
            vec![EdgeStackId::new(1)]
        );

        // The newly targeted async endpoint got an add command.
        let commands = reader.list_async_commands(untagged)?;
        assert_eq!(commands.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_stack_redeploy_resets_statuses() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let endpoint = create_endpoint(&state, "edge-1", &[]).await?;
        let group = create_group(&state, &[endpoint]).await?;
        let stack_id = EdgeStackId::new(1);
        write(&state, RequestPayload::CreateEdgeStack(stack_request(1, group))).await?;
        write(
            &state,
            RequestPayload::UpdateEdgeStackStatus(StackStatusReport {
                stack_id,
                endpoint_id: endpoint,
                status: EdgeStackStatusKind::Running,
                error: None,
                version: Some(1),
            }),
        )
        .await?;

        write(
            &state,
            RequestPayload::UpdateEdgeStack(UpdateEdgeStackRequest {
                id: stack_id,
                file_version: Some(2),
                ..Default::default()
            }),
        )
        .await?;
        let stack = state.reader().get_edge_stack(stack_id)?.unwrap();
        assert_eq!(stack.version, 2);
        assert_eq!(stack.stack_file_version, 2);
        assert_eq!(stack.previous_deployment_info.map(|info| info.version), Some(1));
        assert_eq!(
            stack.status[&endpoint].latest(),
            Some(EdgeStackStatusKind::Pending)
        );

        // A late report for the old version is ignored.
        write(
            &state,
            RequestPayload::UpdateEdgeStackStatus(StackStatusReport {
                stack_id,
                endpoint_id: endpoint,
                status: EdgeStackStatusKind::Error,
                error: Some("boom".to_string()),
                version: Some(1),
            }),
        )
        .await?;
        let stack = state.reader().get_edge_stack(stack_id)?.unwrap();
        assert_eq!(
            stack.status[&endpoint].latest(),
            Some(EdgeStackStatusKind::Pending)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_endpoint_delete_cascades() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let endpoint = create_endpoint(&state, "edge-1", &[]).await?;
        let group = create_group(&state, &[endpoint]).await?;
        write(&state, RequestPayload::CreateEdgeStack(stack_request(1, group))).await?;
        write(
            &state,
            RequestPayload::CreateEdgeConfiguration(config_request(1, group)),
        )
        .await?;
        assert_eq!(
            state.directory.endpoint_for_edge_id("edge-1").await,
            Some(endpoint)
        );

        let result = write(&state, RequestPayload::DeleteEndpoint(endpoint)).await?;
        assert_eq!(result.removed_endpoints, vec![endpoint]);

        let reader = state.reader();
        assert!(reader.get_endpoint(endpoint)?.is_none());
        assert!(reader.get_relation(endpoint)?.is_none());
        assert!(reader.list_async_commands(endpoint)?.is_empty());
        assert!(reader.get_config_states(endpoint)?.states.is_empty());
        assert!(reader.get_edge_group(group)?.unwrap().endpoints.is_empty());
        let stack = reader.get_edge_stack(EdgeStackId::new(1))?.unwrap();
        assert!(stack.status.is_empty());
        assert_eq!(stack.num_deployments, 0);
        let config = reader.get_edge_configuration(EdgeConfigId::new(1))?.unwrap();
        assert_eq!((config.progress.success, config.progress.total), (0, 0));
        assert_eq!(config.state, EdgeConfigStateKind::Idle);
        assert_eq!(state.directory.endpoint_for_edge_id("edge-1").await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_group_in_use_cannot_be_deleted() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let endpoint = create_endpoint(&state, "edge-1", &[]).await?;
        let group = create_group(&state, &[endpoint]).await?;
        write(&state, RequestPayload::CreateEdgeStack(stack_request(1, group))).await?;

        let err = write(&state, RequestPayload::DeleteEdgeGroup(group))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EdgeError>(),
            Some(EdgeError::InvalidState(_))
        ));

        write(&state, RequestPayload::DeleteEdgeStack(EdgeStackId::new(1))).await?;
        write(&state, RequestPayload::DeleteEdgeGroup(group)).await?;
        assert!(state.reader().get_edge_group(group)?.is_none());
        Ok(())
    }

    fn check_in(edge_id: &str, auto_create: AutoCreatePolicy) -> AsyncCheckInRequest {
        AsyncCheckInRequest {
            edge_id: edge_id.to_string(),
            agent: AgentReport {
                version: Some("2.19.0".to_string()),
                ..Default::default()
            },
            auto_create,
            command_timestamp: None,
            snapshot: None,
            stack_statuses: vec![],
            job_statuses: vec![],
            edge_config_states: Default::default(),
            full_snapshot_min_agent_version: None,
        }
    }

    #[tokio::test]
    async fn test_async_check_in_registers_untrusted_endpoint() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();

        let err = write(
            &state,
            RequestPayload::AsyncCheckIn(Box::new(check_in("new-edge", AutoCreatePolicy::default()))),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EdgeError>(),
            Some(EdgeError::Forbidden(_))
        ));

        let policy = AutoCreatePolicy {
            enabled: true,
            trust_on_first_connect: false,
        };
        let result = write(
            &state,
            RequestPayload::AsyncCheckIn(Box::new(check_in("new-edge", policy))),
        )
        .await?;
        let WriteOutcome::AsyncCheckIn(outcome) = result.outcome else {
            panic!("expected a check-in outcome");
        };
        assert!(outcome.created);
        assert!(!outcome.endpoint.user_trusted);
        assert_eq!(outcome.endpoint.agent.version, "2.19.0");

        // The second contact resolves to the same endpoint.
        let result = write(
            &state,
            RequestPayload::AsyncCheckIn(Box::new(check_in("new-edge", policy))),
        )
        .await?;
        let WriteOutcome::AsyncCheckIn(again) = result.outcome else {
            panic!("expected a check-in outcome");
        };
        assert!(!again.created);
        assert_eq!(again.endpoint.id, outcome.endpoint.id);
        assert!(state
            .directory
            .last_check_in(outcome.endpoint.id)
            .await
            .is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_async_check_in_applies_reports_and_delivers() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let endpoint = create_endpoint(&state, "edge-1", &[]).await?;
        let group = create_group(&state, &[endpoint]).await?;
        write(&state, RequestPayload::CreateEdgeStack(stack_request(1, group))).await?;
        write(
            &state,
            RequestPayload::CreateEdgeConfiguration(config_request(1, group)),
        )
        .await?;

        let mut req = check_in("edge-1", AutoCreatePolicy::default());
        req.stack_statuses.push(StackStatusReport {
            stack_id: EdgeStackId::new(1),
            endpoint_id: endpoint,
            status: EdgeStackStatusKind::Running,
            error: None,
            version: Some(1),
        });
        // Unknown stacks are stale reports and do not fail the batch.
        req.stack_statuses.push(StackStatusReport {
            stack_id: EdgeStackId::new(99),
            endpoint_id: endpoint,
            status: EdgeStackStatusKind::Running,
            error: None,
            version: None,
        });
        req.edge_config_states
            .insert(EdgeConfigId::new(1), EdgeConfigStateKind::Idle);

        let result = write(&state, RequestPayload::AsyncCheckIn(Box::new(req))).await?;
        let WriteOutcome::AsyncCheckIn(outcome) = result.outcome else {
            panic!("expected a check-in outcome");
        };
        // Stack add and config add.
        assert_eq!(outcome.commands.len(), 2);
        assert!(!outcome.need_full_snapshot);

        let reader = state.reader();
        let stack = reader.get_edge_stack(EdgeStackId::new(1))?.unwrap();
        assert_eq!(
            stack.status[&endpoint].latest(),
            Some(EdgeStackStatusKind::Running)
        );
        let config = reader.get_edge_configuration(EdgeConfigId::new(1))?.unwrap();
        assert_eq!(config.state, EdgeConfigStateKind::Idle);

        let result = write(
            &state,
            RequestPayload::AsyncCheckIn(Box::new(check_in("edge-1", AutoCreatePolicy::default()))),
        )
        .await?;
        let WriteOutcome::AsyncCheckIn(outcome) = result.outcome else {
            panic!("expected a check-in outcome");
        };
        assert!(outcome.commands.is_empty());
        Ok(())
    }

    async fn async_check_in(
        state: &EdgeState,
        req: AsyncCheckInRequest,
    ) -> Result<requests::AsyncCheckInOutcome> {
        let result = write(state, RequestPayload::AsyncCheckIn(Box::new(req))).await?;
        match result.outcome {
            WriteOutcome::AsyncCheckIn(outcome) => Ok(*outcome),
            other => Err(anyhow!("unexpected outcome {:?}", other)),
        }
    }

    fn docker_part(
        full: Option<Value>,
        patch: Option<Value>,
        previous_hash: Option<u32>,
    ) -> SnapshotPayload {
        SnapshotPayload {
            docker: Some(SnapshotPart {
                full,
                patch,
                previous_hash,
            }),
            kubernetes: None,
        }
    }

    #[tokio::test]
    async fn test_patch_applies_to_partial_full_snapshot() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let endpoint = create_endpoint(&state, "edge-1", &[]).await?;

        // The agent omits most typed fields and sends one the server does not model.
        let sent = json!({
            "docker_version": "24.0.5",
            "running_container_count": 2,
            "agent_extra": {"labels": ["edge"]}
        });
        let mut req = check_in("edge-1", AutoCreatePolicy::default());
        req.snapshot = Some(docker_part(Some(sent.clone()), None, None));
        assert!(!async_check_in(&state, req).await?.need_full_snapshot);

        let patch = json!([
            {"op": "replace", "path": "/running_container_count", "value": 3},
            {"op": "add", "path": "/agent_extra/labels/-", "value": "gpu"}
        ]);
        let mut req = check_in("edge-1", AutoCreatePolicy::default());
        req.snapshot = Some(docker_part(None, Some(patch), Some(snapshot_hash(&sent))));
        assert!(!async_check_in(&state, req).await?.need_full_snapshot);

        let snapshot = state.reader().get_snapshot(endpoint)?.unwrap();
        let expected = json!({
            "docker_version": "24.0.5",
            "running_container_count": 3,
            "agent_extra": {"labels": ["edge", "gpu"]}
        });
        assert_eq!(snapshot.docker_reported, Some(expected.clone()));
        assert_eq!(snapshot.docker.as_ref().unwrap().running_container_count, 3);

        // The next patch chains off the hash of the patched part.
        let patch = json!([{"op": "replace", "path": "/running_container_count", "value": 4}]);
        let mut req = check_in("edge-1", AutoCreatePolicy::default());
        let previous_hash = snapshot_hash(&expected);
        req.snapshot = Some(docker_part(None, Some(patch.clone()), Some(previous_hash)));
        assert!(!async_check_in(&state, req).await?.need_full_snapshot);

        // A patch against a part the server never saw asks for a full snapshot.
        let mut req = check_in("edge-1", AutoCreatePolicy::default());
        req.snapshot = Some(docker_part(None, Some(patch), Some(snapshot_hash(&sent))));
        assert!(async_check_in(&state, req).await?.need_full_snapshot);
        let snapshot = state.reader().get_snapshot(endpoint)?.unwrap();
        assert_eq!(snapshot.docker.unwrap().running_container_count, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_old_agent_with_pending_commands_skips_full_snapshot() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let endpoint = create_endpoint(&state, "edge-1", &[]).await?;
        let group = create_group(&state, &[endpoint]).await?;
        write(&state, RequestPayload::CreateEdgeStack(stack_request(1, group))).await?;

        let threshold = semver::Version::new(2, 19, 0);
        let drifted = |version: &str| {
            let mut req = check_in("edge-1", AutoCreatePolicy::default());
            req.agent.version = Some(version.to_string());
            req.full_snapshot_min_agent_version = Some(threshold.clone());
            // No stored part to patch against.
            req.snapshot = Some(docker_part(None, Some(json!([])), Some(1)));
            req
        };

        let outcome = async_check_in(&state, drifted("2.18.3")).await?;
        assert_eq!(outcome.commands.len(), 1);
        assert!(!outcome.need_full_snapshot);

        // Nothing left to deliver, so the old agent is asked again.
        let outcome = async_check_in(&state, drifted("2.18.3")).await?;
        assert!(outcome.commands.is_empty());
        assert!(outcome.need_full_snapshot);

        // Agents at the threshold always get the request.
        write(&state, RequestPayload::CreateEdgeStack(stack_request(2, group))).await?;
        let outcome = async_check_in(&state, drifted("2.19.0")).await?;
        assert_eq!(outcome.commands.len(), 1);
        assert!(outcome.need_full_snapshot);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_view_is_invalidated_by_writes() -> Result<()> {
        let store = TestStateStore::new().await?;
        let state = store.edge_state.clone();
        let endpoint = create_endpoint(&state, "edge-1", &[]).await?;
        let group = create_group(&state, &[endpoint]).await?;

        let reader = state.reader();
        let view = state.status_cache.get_or_build(&reader, endpoint).await?;
        assert!(view.stacks.is_empty());

        write(&state, RequestPayload::CreateEdgeStack(stack_request(1, group))).await?;
        let view = state.status_cache.get_or_build(&reader, endpoint).await?;
        assert_eq!(view.stacks.len(), 1);
        assert_eq!(view.stacks[0].version, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_state_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state");
        let endpoint = {
            let state =
                EdgeState::new(path.clone(), RocksDBConfig::default(), Default::default()).await?;
            create_endpoint(&state, "edge-1", &[]).await?
        };
        let state = EdgeState::new(path, RocksDBConfig::default(), Default::default()).await?;
        assert_eq!(state.db_version, CURRENT_DB_VERSION);
        assert_eq!(
            state.directory.endpoint_for_edge_id("edge-1").await,
            Some(endpoint)
        );
        Ok(())
    }
}
