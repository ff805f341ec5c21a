use std::sync::Arc;

use anyhow::Result;
use data_model::{
    EdgeAsyncCommand,
    EdgeConfigId,
    EdgeConfiguration,
    EdgeConfigurationState,
    EdgeGroup,
    EdgeGroupId,
    EdgeJob,
    EdgeJobId,
    EdgeStack,
    EdgeStackId,
    Endpoint,
    EndpointId,
    EndpointRelation,
    Snapshot,
    StateMachineMetadata,
    UpdateSchedule,
    UpdateScheduleId,
};
use metrics::{StateStoreMetrics, Timer};
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;

use crate::{
    driver::{IterOptions, Reader, RocksDBDriver},
    serializer::{JsonEncode, JsonEncoder},
    state_machine::{EdgeObjectsColumns, SM_META_KEY},
};

pub struct StateReader {
    db: Arc<RocksDBDriver>,
    metrics: Arc<StateStoreMetrics>,
}

impl StateReader {
    pub fn new(db: Arc<RocksDBDriver>, metrics: Arc<StateStoreMetrics>) -> Self {
        Self { db, metrics }
    }

    /// This method fetches a key from a specific column family
    pub fn get_from_cf<T, K>(&self, column: &EdgeObjectsColumns, key: K) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        K: AsRef<[u8]>,
    {
        let kvs = &[KeyValue::new("op", "get_from_cf")];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);

        let result_bytes = match self.db.get(column.as_ref(), key)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let result = JsonEncoder::decode::<T>(&result_bytes)?;
        Ok(Some(result))
    }

    /// Every row whose key starts with `key_prefix`, in key order.
    pub fn get_rows_with_prefix<V>(&self, key_prefix: &[u8], column: EdgeObjectsColumns) -> Result<Vec<V>>
    where
        V: DeserializeOwned,
    {
        let kvs = &[KeyValue::new("op", "get_rows_with_prefix")];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);

        let iter = self
            .db
            .iter(column.as_ref(), IterOptions::default().starting_at(key_prefix))?;
        let mut items = Vec::new();
        for kv in iter {
            let (key, value) = kv?;
            if !key.starts_with(key_prefix) {
                break;
            }
            items.push(JsonEncoder::decode(&value)?);
        }
        Ok(items)
    }

    pub fn get_all_rows_from_cf<V>(&self, column: EdgeObjectsColumns) -> Result<Vec<(Box<[u8]>, V)>>
    where
        V: DeserializeOwned,
    {
        let kvs = &[KeyValue::new("op", "get_all_rows_from_cf")];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);

        self.db
            .iter(column.as_ref(), IterOptions::default())?
            .map(|item| {
                let (key, value) = item?;
                let value = JsonEncoder::decode(&value)?;
                Ok((key, value))
            })
            .collect()
    }

    fn all_values<V: DeserializeOwned>(&self, column: EdgeObjectsColumns) -> Result<Vec<V>> {
        Ok(self
            .get_all_rows_from_cf(column)?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    pub fn sm_meta(&self) -> Result<Option<StateMachineMetadata>> {
        self.get_from_cf(&EdgeObjectsColumns::StateMachineMetadata, SM_META_KEY)
    }

    pub fn get_endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        self.get_from_cf(&EdgeObjectsColumns::Endpoints, id.key())
    }

    pub fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.all_values(EdgeObjectsColumns::Endpoints)
    }

    /// The persisted edge id index, used to rebuild the in-memory copy.
    pub fn edge_id_index(&self) -> Result<Vec<(String, EndpointId)>> {
        self.get_all_rows_from_cf::<EndpointId>(EdgeObjectsColumns::EndpointEdgeIds)?
            .into_iter()
            .map(|(key, id)| Ok((String::from_utf8(key.into_vec())?, id)))
            .collect()
    }

    pub fn get_relation(&self, id: EndpointId) -> Result<Option<EndpointRelation>> {
        self.get_from_cf(&EdgeObjectsColumns::EndpointRelations, id.key())
    }

    pub fn get_snapshot(&self, id: EndpointId) -> Result<Option<Snapshot>> {
        self.get_from_cf(&EdgeObjectsColumns::Snapshots, id.key())
    }

    pub fn get_edge_group(&self, id: EdgeGroupId) -> Result<Option<EdgeGroup>> {
        self.get_from_cf(&EdgeObjectsColumns::EdgeGroups, id.key())
    }

    pub fn list_edge_groups(&self) -> Result<Vec<EdgeGroup>> {
        self.all_values(EdgeObjectsColumns::EdgeGroups)
    }

    pub fn get_edge_stack(&self, id: EdgeStackId) -> Result<Option<EdgeStack>> {
        self.get_from_cf(&EdgeObjectsColumns::EdgeStacks, id.key())
    }

    pub fn list_edge_stacks(&self) -> Result<Vec<EdgeStack>> {
        self.all_values(EdgeObjectsColumns::EdgeStacks)
    }

    pub fn get_edge_job(&self, id: EdgeJobId) -> Result<Option<EdgeJob>> {
        self.get_from_cf(&EdgeObjectsColumns::EdgeJobs, id.key())
    }

    pub fn list_edge_jobs(&self) -> Result<Vec<EdgeJob>> {
        self.all_values(EdgeObjectsColumns::EdgeJobs)
    }

    pub fn get_edge_configuration(&self, id: EdgeConfigId) -> Result<Option<EdgeConfiguration>> {
        self.get_from_cf(&EdgeObjectsColumns::EdgeConfigurations, id.key())
    }

    pub fn list_edge_configurations(&self) -> Result<Vec<EdgeConfiguration>> {
        self.all_values(EdgeObjectsColumns::EdgeConfigurations)
    }

    pub fn get_config_states(&self, id: EndpointId) -> Result<EdgeConfigurationState> {
        Ok(self
            .get_from_cf(&EdgeObjectsColumns::EdgeConfigurationStates, id.key())?
            .unwrap_or_else(|| EdgeConfigurationState::new(id)))
    }

    pub fn get_update_schedule(&self, id: UpdateScheduleId) -> Result<Option<UpdateSchedule>> {
        self.get_from_cf(&EdgeObjectsColumns::UpdateSchedules, id.key())
    }

    pub fn list_update_schedules(&self) -> Result<Vec<UpdateSchedule>> {
        self.all_values(EdgeObjectsColumns::UpdateSchedules)
    }

    pub fn list_async_commands(&self, endpoint_id: EndpointId) -> Result<Vec<EdgeAsyncCommand>> {
        self.get_rows_with_prefix(
            &EdgeAsyncCommand::key_prefix(endpoint_id),
            EdgeObjectsColumns::EdgeAsyncCommands,
        )
    }
}
