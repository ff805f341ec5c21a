use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use data_model::{EdgeError, EdgeStackStatusKind, EndpointId, UpdateScheduleId};
use edge_utils::OptionInspectNone;
use state_store::EdgeState;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handles of one delayed reconciliation.
struct PendingReconcile {
    cancel: CancellationToken,
    trigger: CancellationToken,
}

/// Tracks the update schedule each endpoint is currently going through. An
/// endpoint can only be the target of one active schedule.
pub struct UpdateScheduleTracker {
    edge_state: Arc<EdgeState>,
    active: Mutex<HashMap<EndpointId, UpdateScheduleId>>,
    pending: Mutex<HashMap<(EndpointId, UpdateScheduleId), PendingReconcile>>,
    reconcile_delay: Duration,
    shutdown_rx: watch::Receiver<()>,
}

impl UpdateScheduleTracker {
    pub fn new(
        edge_state: Arc<EdgeState>,
        reconcile_delay: Duration,
        shutdown_rx: watch::Receiver<()>,
    ) -> Result<Arc<Self>> {
        let active = Self::load_active(&edge_state)?;
        info!(endpoints = active.len(), "loaded active update schedules");
        Ok(Arc::new(Self {
            edge_state,
            active: Mutex::new(active),
            pending: Mutex::new(HashMap::new()),
            reconcile_delay,
            shutdown_rx,
        }))
    }

    /// Most recent schedule first. An endpoint stays with the first schedule
    /// that has not confirmed the update on it yet.
    fn load_active(edge_state: &EdgeState) -> Result<HashMap<EndpointId, UpdateScheduleId>> {
        let reader = edge_state.reader();
        let mut schedules = reader.list_update_schedules()?;
        schedules.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let mut active = HashMap::new();
        for schedule in schedules {
            let stack = reader
                .get_edge_stack(schedule.edge_stack_id)?
                .inspect_none(|| {
                    warn!(
                        update_schedule_id = %schedule.id,
                        edge_stack_id = %schedule.edge_stack_id,
                        "update schedule stack is missing"
                    )
                });
            for endpoint_id in schedule.endpoints() {
                if active.contains_key(&endpoint_id) {
                    continue;
                }
                let succeeded = stack
                    .as_ref()
                    .and_then(|stack| stack.status.get(&endpoint_id))
                    .is_some_and(|status| status.has(EdgeStackStatusKind::RemoteUpdateSuccess));
                if !succeeded {
                    active.insert(endpoint_id, schedule.id);
                }
            }
        }
        Ok(active)
    }

    pub async fn active_schedule(&self, endpoint_id: EndpointId) -> Option<UpdateScheduleId> {
        self.active.lock().await.get(&endpoint_id).copied()
    }

    /// Marks `endpoints` as going through `schedule_id`, all or none.
    /// Returns the endpoints that were not held by the schedule before, which
    /// is what a caller releases when its write fails.
    pub async fn reserve(
        &self,
        schedule_id: UpdateScheduleId,
        endpoints: &BTreeSet<EndpointId>,
    ) -> Result<BTreeSet<EndpointId>> {
        let mut active = self.active.lock().await;
        for endpoint_id in endpoints {
            if let Some(current) = active.get(endpoint_id) {
                if *current != schedule_id {
                    return Err(EdgeError::ScheduleConflict {
                        endpoint_id: *endpoint_id,
                        active: *current,
                    }
                    .into());
                }
            }
        }
        let mut reserved = BTreeSet::new();
        for endpoint_id in endpoints {
            if active.insert(*endpoint_id, schedule_id).is_none() {
                reserved.insert(*endpoint_id);
            }
        }
        Ok(reserved)
    }

    /// Drops `schedule_id` from `endpoints` where it is the active one.
    pub async fn release(&self, schedule_id: UpdateScheduleId, endpoints: &BTreeSet<EndpointId>) {
        let mut active = self.active.lock().await;
        for endpoint_id in endpoints {
            if active.get(endpoint_id) == Some(&schedule_id) {
                active.remove(endpoint_id);
            }
        }
    }

    /// Keeps the schedule only on `endpoints`.
    pub async fn retain(&self, schedule_id: UpdateScheduleId, endpoints: &BTreeSet<EndpointId>) {
        self.active
            .lock()
            .await
            .retain(|endpoint_id, id| *id != schedule_id || endpoints.contains(endpoint_id));
    }

    pub async fn remove_active_schedule(
        &self,
        endpoint_id: EndpointId,
        schedule_id: UpdateScheduleId,
    ) -> Result<()> {
        {
            let mut active = self.active.lock().await;
            match active.get(&endpoint_id) {
                None => return Ok(()),
                Some(current) if *current != schedule_id => {
                    return Err(EdgeError::ScheduleMismatch {
                        endpoint_id,
                        active: *current,
                        requested: schedule_id,
                    }
                    .into());
                }
                Some(_) => {
                    active.remove(&endpoint_id);
                }
            }
        }
        self.cancel_reconciliation(endpoint_id, schedule_id).await;
        debug!(
            endpoint_id = %endpoint_id,
            update_schedule_id = %schedule_id,
            "update schedule no longer active"
        );
        Ok(())
    }

    pub async fn remove_schedule(&self, schedule_id: UpdateScheduleId) {
        self.active.lock().await.retain(|_, id| *id != schedule_id);
        let mut pending = self.pending.lock().await;
        pending.retain(|(_, id), handles| {
            if *id == schedule_id {
                handles.cancel.cancel();
            }
            *id != schedule_id
        });
    }

    pub async fn remove_endpoint(&self, endpoint_id: EndpointId) {
        self.active.lock().await.remove(&endpoint_id);
        let mut pending = self.pending.lock().await;
        pending.retain(|(id, _), handles| {
            if *id == endpoint_id {
                handles.cancel.cancel();
            }
            *id != endpoint_id
        });
    }

    pub async fn cancel_reconciliation(&self, endpoint_id: EndpointId, schedule_id: UpdateScheduleId) {
        if let Some(handles) = self.pending.lock().await.remove(&(endpoint_id, schedule_id)) {
            handles.cancel.cancel();
        }
    }

    /// Runs a pending reconciliation now instead of waiting for its delay.
    pub async fn trigger_reconciliation(
        &self,
        endpoint_id: EndpointId,
        schedule_id: UpdateScheduleId,
    ) {
        if let Some(handles) = self.pending.lock().await.get(&(endpoint_id, schedule_id)) {
            handles.trigger.cancel();
        }
    }

    /// The updater stack reported Running on the endpoint. If the agent has
    /// not confirmed its new version once the delay elapsed, the endpoint is
    /// released from the schedule.
    pub async fn edge_stack_deployed(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        schedule_id: UpdateScheduleId,
    ) {
        let cancel = CancellationToken::new();
        let trigger = CancellationToken::new();
        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&(endpoint_id, schedule_id)) {
                return;
            }
            pending.insert(
                (endpoint_id, schedule_id),
                PendingReconcile {
                    cancel: cancel.clone(),
                    trigger: trigger.clone(),
                },
            );
        }

        let tracker = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(tracker.reconcile_delay) => {}
                _ = trigger.cancelled() => {}
                _ = cancel.cancelled() => return,
                _ = shutdown_rx.changed() => return,
            }
            tracker.reconcile(endpoint_id, schedule_id).await;
        });
    }

    async fn reconcile(&self, endpoint_id: EndpointId, schedule_id: UpdateScheduleId) {
        self.pending.lock().await.remove(&(endpoint_id, schedule_id));

        let reader = self.edge_state.reader();
        let schedule_exists = match reader.get_update_schedule(schedule_id) {
            Ok(schedule) => schedule.is_some(),
            Err(err) => {
                warn!(
                    update_schedule_id = %schedule_id,
                    "failed to read update schedule during reconciliation: {:?}", err
                );
                true
            }
        };

        let mut active = self.active.lock().await;
        if active.get(&endpoint_id) != Some(&schedule_id) {
            return;
        }
        active.remove(&endpoint_id);
        if schedule_exists {
            warn!(
                endpoint_id = %endpoint_id,
                update_schedule_id = %schedule_id,
                "agent did not confirm the update, releasing endpoint from schedule"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use data_model::{EdgeGroupId, EdgeStackId, UpdateScheduleType};
    use state_store::{
        requests::{
            CreateEndpointRequest,
            EdgeGroupRequest,
            RemoteUpdateSuccessRequest,
            RequestPayload,
            StateMachineUpdateRequest,
            UpdateScheduleRequest,
            WriteOutcome,
        },
        state_machine::EdgeObjectsColumns,
    };

    use super::*;
    use crate::testing::TestService;

    async fn write(edge_state: &EdgeState, payload: RequestPayload) -> Result<WriteOutcome> {
        Ok(edge_state
            .write(StateMachineUpdateRequest { payload })
            .await?
            .outcome)
    }

    async fn create_endpoint(edge_state: &EdgeState, name: &str) -> Result<EndpointId> {
        match write(
            edge_state,
            RequestPayload::CreateEndpoint(CreateEndpointRequest {
                name: name.to_string(),
                ..Default::default()
            }),
        )
        .await?
        {
            WriteOutcome::Endpoint(endpoint) => Ok(endpoint.id),
            other => Err(anyhow::anyhow!("unexpected outcome {:?}", other)),
        }
    }

    async fn create_group(edge_state: &EdgeState, endpoints: &[EndpointId]) -> Result<EdgeGroupId> {
        match write(
            edge_state,
            RequestPayload::CreateEdgeGroup(EdgeGroupRequest {
                name: "fleet".to_string(),
                endpoints: endpoints.iter().copied().collect(),
                ..Default::default()
            }),
        )
        .await?
        {
            WriteOutcome::Created(id) => Ok(id.into()),
            other => Err(anyhow::anyhow!("unexpected outcome {:?}", other)),
        }
    }

    fn schedule_request(
        edge_state: &EdgeState,
        group: EdgeGroupId,
        reserved_endpoints: BTreeSet<EndpointId>,
    ) -> Result<UpdateScheduleRequest> {
        let id = UpdateScheduleId::new(edge_state.allocate_id(EdgeObjectsColumns::UpdateSchedules)?);
        let stack_id = EdgeStackId::new(edge_state.allocate_id(EdgeObjectsColumns::EdgeStacks)?);
        Ok(UpdateScheduleRequest {
            id,
            name: format!("update-{}", id),
            version: "2.20.0".to_string(),
            schedule_type: UpdateScheduleType::Update,
            edge_group_ids: BTreeSet::from([group]),
            scheduled_time: None,
            created_by: "admin".to_string(),
            edge_stack_id: stack_id,
            file_version: None,
            reserved_endpoints,
        })
    }

    async fn create_schedule(
        edge_state: &EdgeState,
        group: EdgeGroupId,
    ) -> Result<(UpdateScheduleId, EdgeStackId)> {
        let members = edge_state
            .reader()
            .get_edge_group(group)?
            .map(|group| group.endpoints)
            .unwrap_or_default();
        let req = schedule_request(edge_state, group, members)?;
        let ids = (req.id, req.edge_stack_id);
        write(edge_state, RequestPayload::CreateUpdateSchedule(req)).await?;
        Ok(ids)
    }

    #[tokio::test]
    async fn test_schedule_write_needs_every_target_reserved() -> Result<()> {
        let test_srv = TestService::new().await?;
        let edge_state = test_srv.service.edge_state.clone();
        let tracker = test_srv.service.update_schedules.clone();
        let reserved = create_endpoint(&edge_state, "reserved").await?;
        let joined = create_endpoint(&edge_state, "joined").await?;
        let group = create_group(&edge_state, &[reserved]).await?;

        let req = schedule_request(&edge_state, group, BTreeSet::from([reserved]))?;
        let schedule_id = req.id;
        tracker.reserve(schedule_id, &req.reserved_endpoints).await?;

        // Another endpoint joins the group between reservation and write.
        write(
            &edge_state,
            RequestPayload::UpdateEdgeGroup((
                group,
                EdgeGroupRequest {
                    name: "fleet".to_string(),
                    endpoints: BTreeSet::from([reserved, joined]),
                    ..Default::default()
                },
            )),
        )
        .await?;

        let err = write(&edge_state, RequestPayload::CreateUpdateSchedule(req))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EdgeError>(),
            Some(EdgeError::InvalidState(_))
        ));
        assert!(edge_state.reader().get_update_schedule(schedule_id)?.is_none());
        assert_eq!(tracker.active_schedule(joined).await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_reserve_is_exclusive() -> Result<()> {
        let test_srv = TestService::new().await?;
        let tracker = test_srv.service.update_schedules.clone();
        let first = UpdateScheduleId::new(1);
        let second = UpdateScheduleId::new(2);
        let endpoints = BTreeSet::from([EndpointId::new(1), EndpointId::new(2)]);

        assert_eq!(tracker.reserve(first, &endpoints).await?, endpoints);
        // Reserving again for the same schedule holds nothing new.
        assert!(tracker.reserve(first, &endpoints).await?.is_empty());

        let overlapping = BTreeSet::from([EndpointId::new(2), EndpointId::new(3)]);
        let err = tracker.reserve(second, &overlapping).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EdgeError>(),
            Some(EdgeError::ScheduleConflict { .. })
        ));
        // A rejected reservation marks nothing.
        assert_eq!(tracker.active_schedule(EndpointId::new(3)).await, None);

        tracker.release(first, &BTreeSet::from([EndpointId::new(2)])).await;
        tracker.reserve(second, &overlapping).await?;
        assert_eq!(tracker.active_schedule(EndpointId::new(1)).await, Some(first));
        assert_eq!(tracker.active_schedule(EndpointId::new(2)).await, Some(second));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_active_schedule() -> Result<()> {
        let test_srv = TestService::new().await?;
        let tracker = test_srv.service.update_schedules.clone();
        let endpoint_id = EndpointId::new(1);

        // Nothing recorded is a no-op.
        tracker
            .remove_active_schedule(endpoint_id, UpdateScheduleId::new(9))
            .await?;

        tracker
            .reserve(UpdateScheduleId::new(1), &BTreeSet::from([endpoint_id]))
            .await?;
        let err = tracker
            .remove_active_schedule(endpoint_id, UpdateScheduleId::new(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EdgeError>(),
            Some(EdgeError::ScheduleMismatch { .. })
        ));

        tracker
            .remove_active_schedule(endpoint_id, UpdateScheduleId::new(1))
            .await?;
        assert_eq!(tracker.active_schedule(endpoint_id).await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_startup_scan_prefers_recent_schedules() -> Result<()> {
        let test_srv = TestService::new().await?;
        let edge_state = test_srv.service.edge_state.clone();
        let updated = create_endpoint(&edge_state, "updated").await?;
        let pending = create_endpoint(&edge_state, "pending").await?;
        let group = create_group(&edge_state, &[updated, pending]).await?;

        let (older, _) = create_schedule(&edge_state, group).await?;
        let (newer, _) = create_schedule(&edge_state, group).await?;
        write(
            &edge_state,
            RequestPayload::MarkRemoteUpdateSuccess(RemoteUpdateSuccessRequest {
                endpoint_id: updated,
                schedule_id: newer,
            }),
        )
        .await?;

        let (_tx, rx) = watch::channel(());
        let tracker = UpdateScheduleTracker::new(edge_state, Duration::from_secs(60), rx)?;
        assert_eq!(tracker.active_schedule(pending).await, Some(newer));
        // The newer schedule succeeded here, so the older one is still active.
        assert_eq!(tracker.active_schedule(updated).await, Some(older));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deployed_stack_releases_unconfirmed_endpoint() -> Result<()> {
        let test_srv = TestService::new().await?;
        let tracker = test_srv.service.update_schedules.clone();
        let schedule_id = UpdateScheduleId::new(1);
        let lagging = EndpointId::new(1);
        let confirmed = EndpointId::new(2);
        tracker
            .reserve(schedule_id, &BTreeSet::from([lagging, confirmed]))
            .await?;

        tracker.edge_stack_deployed(lagging, schedule_id).await;
        tracker.edge_stack_deployed(confirmed, schedule_id).await;
        tracker.remove_active_schedule(confirmed, schedule_id).await?;

        let delay = test_srv.service.config.edge.update_reconcile_delay();
        tokio::time::sleep(delay / 2).await;
        assert_eq!(tracker.active_schedule(lagging).await, Some(schedule_id));

        tokio::time::sleep(delay).await;
        assert_eq!(tracker.active_schedule(lagging).await, None);
        assert_eq!(tracker.active_schedule(confirmed).await, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggered_reconciliation_runs_early() -> Result<()> {
        let test_srv = TestService::new().await?;
        let tracker = test_srv.service.update_schedules.clone();
        let schedule_id = UpdateScheduleId::new(3);
        let endpoint_id = EndpointId::new(4);
        tracker
            .reserve(schedule_id, &BTreeSet::from([endpoint_id]))
            .await?;

        tracker.edge_stack_deployed(endpoint_id, schedule_id).await;
        tracker.trigger_reconciliation(endpoint_id, schedule_id).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.active_schedule(endpoint_id).await, None);
        Ok(())
    }
}
