use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use data_model::{EdgeConfigId, EdgeConfigStateKind, EdgeStackId, EndpointId};
use metrics::StateStoreMetrics;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    scanner::StateReader,
    serializer::{JsonEncode, JsonEncoder},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSummary {
    pub id: EdgeStackId,
    pub name: String,
    pub version: u32,
    pub scheduled_time: Option<String>,
}

/// The relation-derived part of an endpoint's status response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointStatusView {
    pub stacks: Vec<StackSummary>,
    pub edge_configurations: BTreeMap<EdgeConfigId, EdgeConfigStateKind>,
}

impl EndpointStatusView {
    fn build(reader: &StateReader, endpoint_id: EndpointId) -> Result<Self> {
        let mut stacks = Vec::new();
        if let Some(relation) = reader.get_relation(endpoint_id)? {
            for stack_id in relation.enabled_stacks() {
                let Some(stack) = reader.get_edge_stack(stack_id)? else {
                    warn!(
                        endpoint_id = %endpoint_id,
                        edge_stack_id = %stack_id,
                        "relation references a missing edge stack"
                    );
                    continue;
                };
                stacks.push(StackSummary {
                    id: stack.id,
                    name: stack.name,
                    version: stack.version,
                    scheduled_time: stack.scheduled_time,
                });
            }
        }
        let edge_configurations = reader.get_config_states(endpoint_id)?.states;
        Ok(Self {
            stacks,
            edge_configurations,
        })
    }
}

/// Short-lived cache of encoded status views, invalidated by every write that
/// touches an endpoint's relations or configuration states.
pub struct StatusCache {
    cache: moka::future::Cache<EndpointId, Vec<u8>>,
    /// Bumped by every invalidation. A view built across a bump may predate
    /// the write that caused it.
    generation: AtomicU64,
    metrics: Arc<StateStoreMetrics>,
}

impl StatusCache {
    pub fn new(ttl: Duration, max_capacity: u64, metrics: Arc<StateStoreMetrics>) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self {
            cache,
            generation: AtomicU64::new(0),
            metrics,
        }
    }

    pub async fn get_or_build(
        &self,
        reader: &StateReader,
        endpoint_id: EndpointId,
    ) -> Result<EndpointStatusView> {
        if let Some(bytes) = self.cache.get(&endpoint_id).await {
            match JsonEncoder::decode(&bytes) {
                Ok(view) => {
                    self.metrics.status_cache_hits.add(1, &[]);
                    return Ok(view);
                }
                Err(err) => warn!(endpoint_id = %endpoint_id, "dropping undecodable status view: {:?}", err),
            }
        }
        self.metrics.status_cache_misses.add(1, &[]);
        let generation = self.generation.load(Ordering::SeqCst);
        let view = EndpointStatusView::build(reader, endpoint_id)?;
        self.store(endpoint_id, &view, generation).await;
        Ok(view)
    }

    /// Caches a view built at `generation`. When an invalidation ran in the
    /// meantime the entry is dropped again, the next read rebuilds it.
    async fn store(&self, endpoint_id: EndpointId, view: &EndpointStatusView, generation: u64) {
        match JsonEncoder::encode(view) {
            Ok(bytes) => self.cache.insert(endpoint_id, bytes).await,
            Err(err) => {
                warn!(endpoint_id = %endpoint_id, "failed to cache status view: {:?}", err);
                return;
            }
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            self.cache.invalidate(&endpoint_id).await;
        }
    }

    pub async fn invalidate(&self, endpoints: impl IntoIterator<Item = EndpointId>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        for endpoint_id in endpoints {
            self.cache.invalidate(&endpoint_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> StatusCache {
        StatusCache::new(
            Duration::from_secs(60),
            16,
            Arc::new(StateStoreMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_view_built_before_invalidation_is_not_kept() {
        let cache = cache();
        let endpoint_id = EndpointId::new(1);
        let stale = EndpointStatusView::default();

        let generation = cache.generation.load(Ordering::SeqCst);
        // A write lands while the view is being built.
        cache.invalidate([endpoint_id]).await;
        cache.store(endpoint_id, &stale, generation).await;
        assert!(cache.cache.get(&endpoint_id).await.is_none());

        let generation = cache.generation.load(Ordering::SeqCst);
        cache.store(endpoint_id, &stale, generation).await;
        assert!(cache.cache.get(&endpoint_id).await.is_some());
    }
}
