use std::sync::Arc;

use anyhow::Result;
use blob_store::BlobStorage;
use data_model::{Endpoint, EndpointId};
use metrics::api_io_stats;
use state_store::{
    requests::{RequestPayload, StateMachineUpdateRequest},
    EdgeState,
    WriteResult,
};
use tracing::{error, info};

use crate::{
    config::ServerConfig,
    http_objects::EdgeAPIError,
    middleware::EdgeHeaders,
    tunnels::TunnelService,
    update_schedules::UpdateScheduleTracker,
};

#[derive(Clone)]
pub struct RouteState {
    pub edge_state: Arc<EdgeState>,
    pub blob_storage: Arc<BlobStorage>,
    pub tunnels: Arc<TunnelService>,
    pub update_schedules: Arc<UpdateScheduleTracker>,
    pub metrics: Arc<api_io_stats::Metrics>,
    pub config: Arc<ServerConfig>,
}

impl RouteState {
    /// Commits `payload` and then brings the in-memory services and the blob
    /// store in line with what the write changed.
    pub async fn apply(&self, payload: RequestPayload) -> Result<WriteResult> {
        let result = self
            .edge_state
            .write(StateMachineUpdateRequest { payload })
            .await?;

        for endpoint_id in &result.removed_endpoints {
            self.tunnels.remove_endpoint(*endpoint_id).await;
            self.update_schedules.remove_endpoint(*endpoint_id).await;
        }
        if result.jobs_changed || !result.removed_endpoints.is_empty() {
            if let Err(err) = self.tunnels.rebuild_jobs(&self.edge_state.reader()).await {
                error!("failed to rebuild edge job queues: {:?}", err);
            }
        }
        for prefix in &result.removed_blob_prefixes {
            self.delete_blobs(prefix).await;
        }
        Ok(result)
    }

    pub async fn write(&self, payload: RequestPayload) -> Result<WriteResult, EdgeAPIError> {
        Ok(self.apply(payload).await?)
    }

    /// Best effort, files nothing references anymore only cost space.
    pub async fn delete_blobs(&self, prefix: &str) {
        match self.blob_storage.delete_prefix(prefix).await {
            Ok(deleted) => info!(prefix, deleted, "removed unreferenced files"),
            Err(err) => error!(prefix, "failed to remove unreferenced files: {:?}", err),
        }
    }

    pub fn endpoint(&self, endpoint_id: EndpointId) -> Result<Endpoint, EdgeAPIError> {
        self.edge_state
            .reader()
            .get_endpoint(endpoint_id)?
            .ok_or_else(|| EdgeAPIError::not_found(&format!("endpoint {} not found", endpoint_id)))
    }

    /// The endpoint an agent addresses by id. Its edge id, when bound, must
    /// match the request's.
    pub fn agent_endpoint(
        &self,
        endpoint_id: EndpointId,
        headers: &EdgeHeaders,
    ) -> Result<Endpoint, EdgeAPIError> {
        let edge_id = headers.require_edge_id()?;
        let endpoint = self.endpoint(endpoint_id)?;
        if endpoint
            .edge_id
            .as_deref()
            .is_some_and(|bound| bound != edge_id)
        {
            return Err(EdgeAPIError::forbidden("edge id does not match the endpoint"));
        }
        if !endpoint.user_trusted {
            return Err(EdgeAPIError::forbidden("endpoint is not trusted"));
        }
        Ok(endpoint)
    }

    /// The endpoint an agent addresses by its `X-Edge-Id` header alone.
    pub async fn agent_endpoint_by_edge_id(
        &self,
        headers: &EdgeHeaders,
    ) -> Result<Endpoint, EdgeAPIError> {
        let edge_id = headers.require_edge_id()?;
        let endpoint_id = self
            .edge_state
            .directory
            .endpoint_for_edge_id(edge_id)
            .await
            .ok_or_else(|| EdgeAPIError::forbidden(&format!("unknown edge id {}", edge_id)))?;
        self.agent_endpoint(endpoint_id, headers)
    }
}
