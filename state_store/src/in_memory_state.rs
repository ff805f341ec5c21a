use std::collections::HashMap;

use anyhow::Result;
use data_model::EndpointId;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{scanner::StateReader, state_machine::WriteEffects};

/// In-memory part of the endpoint directory.
///
/// The edge id index mirrors the persisted `EndpointEdgeIds` family and is
/// only a fast path for reads; writes resolve edge ids inside their
/// transaction. Check-in times are never persisted.
pub struct EndpointDirectory {
    // Edge id -> EndpointId
    edge_ids: RwLock<HashMap<String, EndpointId>>,

    // EndpointId -> last check-in (epoch ms)
    check_ins: RwLock<HashMap<EndpointId, u64>>,
}

impl EndpointDirectory {
    pub fn new(reader: &StateReader) -> Result<Self> {
        let edge_ids: HashMap<String, EndpointId> = reader.edge_id_index()?.into_iter().collect();
        debug!(edge_ids = edge_ids.len(), "rebuilt edge id index");
        Ok(Self {
            edge_ids: RwLock::new(edge_ids),
            check_ins: RwLock::new(HashMap::new()),
        })
    }

    pub async fn endpoint_for_edge_id(&self, edge_id: &str) -> Option<EndpointId> {
        self.edge_ids.read().await.get(edge_id).copied()
    }

    pub async fn last_check_in(&self, endpoint_id: EndpointId) -> Option<u64> {
        self.check_ins.read().await.get(&endpoint_id).copied()
    }

    pub async fn check_ins(&self) -> HashMap<EndpointId, u64> {
        self.check_ins.read().await.clone()
    }

    pub(crate) async fn apply(&self, effects: &WriteEffects, now: u64) {
        if !effects.edge_id_upserts.is_empty() || !effects.edge_id_removals.is_empty() {
            let mut edge_ids = self.edge_ids.write().await;
            for edge_id in &effects.edge_id_removals {
                edge_ids.remove(edge_id);
            }
            for (edge_id, endpoint_id) in &effects.edge_id_upserts {
                edge_ids.insert(edge_id.clone(), *endpoint_id);
            }
        }
        if !effects.check_ins.is_empty() || !effects.removed_endpoints.is_empty() {
            let mut check_ins = self.check_ins.write().await;
            for endpoint_id in &effects.check_ins {
                check_ins.insert(*endpoint_id, now);
            }
            for endpoint_id in &effects.removed_endpoints {
                check_ins.remove(endpoint_id);
            }
        }
    }
}
