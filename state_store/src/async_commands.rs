//! Per-endpoint command log consumed by agents in store-and-forward mode.
//!
//! Commands are keyed by `endpoint ‖ command id` and never rewritten except
//! to flip `executed` once delivered.

use anyhow::Result;
use chrono::Utc;
use data_model::{EdgeAsyncCommand, EdgeCommandId, Endpoint, EndpointId, NewEdgeCommand};
use edge_utils::{get_epoch_time_in_ms, is_scheduled_time_due};
use tracing::debug;

use crate::{
    driver::Transaction,
    state_machine::{next_id, put_object, scan_objects, EdgeObjectsColumns, Fleet},
};

/// Appends `command` to the endpoint's log. Synchronous endpoints receive
/// their work through the status response instead, so for them this is a
/// no-op returning false.
pub(crate) fn append(txn: &Transaction, endpoint: &Endpoint, command: NewEdgeCommand) -> Result<bool> {
    if !endpoint.is_async() {
        return Ok(false);
    }
    let id = EdgeCommandId::new(next_id(txn, EdgeObjectsColumns::EdgeAsyncCommands)?);
    let command = EdgeAsyncCommand {
        id,
        endpoint_id: endpoint.id,
        path: command.payload.path(),
        payload: command.payload,
        operation: command.operation,
        timestamp: get_epoch_time_in_ms(),
        scheduled_time: command.scheduled_time,
        executed: false,
    };
    debug!(
        endpoint_id = %endpoint.id,
        command_id = %id,
        kind = %command.payload,
        operation = %command.operation,
        "appended edge command"
    );
    put_object(txn, EdgeObjectsColumns::EdgeAsyncCommands, command.key(), &command)?;
    Ok(true)
}

/// Appends to an endpoint known to `fleet`. Unknown endpoints are skipped.
pub(crate) fn append_for(
    txn: &Transaction,
    fleet: &Fleet,
    endpoint_id: EndpointId,
    command: NewEdgeCommand,
) -> Result<bool> {
    match fleet.endpoint(endpoint_id) {
        Some(endpoint) => append(txn, endpoint, command),
        None => Ok(false),
    }
}

pub(crate) fn list(txn: &Transaction, endpoint_id: EndpointId) -> Result<Vec<EdgeAsyncCommand>> {
    scan_objects(
        txn,
        EdgeObjectsColumns::EdgeAsyncCommands,
        &EdgeAsyncCommand::key_prefix(endpoint_id),
    )
}

/// Returns the commands that are due, in creation order, and marks them
/// executed in the same transaction.
///
/// A command with a scheduled time is due once that time passed in the
/// endpoint's time zone. Any other command is due when it was created at or
/// before `since`, which defaults to now.
pub(crate) fn deliver_since(
    txn: &Transaction,
    endpoint: &Endpoint,
    since: Option<u64>,
) -> Result<Vec<EdgeAsyncCommand>> {
    let since = since.unwrap_or_else(get_epoch_time_in_ms);
    let now = Utc::now();
    let mut delivered = Vec::new();
    for mut command in list(txn, endpoint.id)? {
        if command.executed {
            continue;
        }
        let due = match &command.scheduled_time {
            Some(scheduled) => {
                is_scheduled_time_due(scheduled, endpoint.local_time_zone.as_deref(), now)
            }
            None => command.timestamp <= since,
        };
        if !due {
            continue;
        }
        command.executed = true;
        put_object(txn, EdgeObjectsColumns::EdgeAsyncCommands, command.key(), &command)?;
        delivered.push(command);
    }
    Ok(delivered)
}

pub(crate) fn has_pending(txn: &Transaction, endpoint_id: EndpointId) -> Result<bool> {
    Ok(list(txn, endpoint_id)?.iter().any(|command| !command.executed))
}

pub(crate) fn remove_for_endpoint(txn: &Transaction, endpoint_id: EndpointId) -> Result<()> {
    let prefix = EdgeAsyncCommand::key_prefix(endpoint_id);
    for (key, _) in txn.scan_prefix(EdgeObjectsColumns::EdgeAsyncCommands, &prefix)? {
        txn.delete(EdgeObjectsColumns::EdgeAsyncCommands, key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::mock_endpoint,
        CommandOperation,
        CommandPayload,
        ContainerCommandData,
        ContainerOperation,
        ImageCommandData,
    };

    use super::*;
    use crate::{driver::Writer, test_state_store::TestStateStore};

    fn image_command(name: &str) -> NewEdgeCommand {
        NewEdgeCommand::new(
            CommandPayload::Image(ImageCommandData {
                image_name: name.to_string(),
                force_remove: false,
            }),
            CommandOperation::Remove,
        )
    }

    #[tokio::test]
    async fn test_append_skips_sync_endpoints() -> Result<()> {
        let store = TestStateStore::new().await?;
        let txn = store.edge_state.db.transaction();
        let sync_endpoint = mock_endpoint(1, "edge-1", false);

        assert!(!append(&txn, &sync_endpoint, image_command("nginx"))?);
        assert!(list(&txn, sync_endpoint.id)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_delivery_is_ordered_and_idempotent() -> Result<()> {
        let store = TestStateStore::new().await?;
        let txn = store.edge_state.db.transaction();
        let endpoint = mock_endpoint(1, "edge-1", true);
        let other = mock_endpoint(2, "edge-2", true);

        append(&txn, &endpoint, image_command("a"))?;
        append(&txn, &other, image_command("other"))?;
        append(&txn, &endpoint, image_command("b"))?;

        let delivered = deliver_since(&txn, &endpoint, None)?;
        let paths: Vec<_> = delivered.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["/image/a", "/image/b"]);
        assert!(delivered.iter().all(|c| c.executed));

        // A second delivery never returns an executed command.
        assert!(deliver_since(&txn, &endpoint, None)?.is_empty());
        assert!(!has_pending(&txn, endpoint.id)?);
        assert!(has_pending(&txn, other.id)?);
        Ok(())
    }

    #[tokio::test]
    async fn test_cursor_holds_back_newer_commands() -> Result<()> {
        let store = TestStateStore::new().await?;
        let txn = store.edge_state.db.transaction();
        let endpoint = mock_endpoint(1, "edge-1", true);

        append(&txn, &endpoint, image_command("a"))?;
        let created = list(&txn, endpoint.id)?[0].timestamp;

        assert!(deliver_since(&txn, &endpoint, Some(created - 1))?.is_empty());
        assert_eq!(deliver_since(&txn, &endpoint, Some(created))?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduled_commands_wait_for_local_time() -> Result<()> {
        let store = TestStateStore::new().await?;
        let txn = store.edge_state.db.transaction();
        let mut endpoint = mock_endpoint(1, "edge-1", true);
        endpoint.local_time_zone = Some("Asia/Tokyo".to_string());

        let restart = |name: &str| {
            NewEdgeCommand::new(
                CommandPayload::Container(ContainerCommandData {
                    container_name: name.to_string(),
                    container_operation: ContainerOperation::Restart,
                    force_remove: false,
                }),
                CommandOperation::Replace,
            )
        };
        append(
            &txn,
            &endpoint,
            restart("later").scheduled(Some("2999-01-01 00:00:00".to_string())),
        )?;
        append(
            &txn,
            &endpoint,
            restart("earlier").scheduled(Some("2000-01-01 00:00:00".to_string())),
        )?;

        let delivered = deliver_since(&txn, &endpoint, None)?;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].path, "/container/earlier");
        assert!(has_pending(&txn, endpoint.id)?);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_for_endpoint() -> Result<()> {
        let store = TestStateStore::new().await?;
        let txn = store.edge_state.db.transaction();
        let endpoint = mock_endpoint(1, "edge-1", true);
        let other = mock_endpoint(2, "edge-2", true);
        append(&txn, &endpoint, image_command("a"))?;
        append(&txn, &other, image_command("b"))?;

        remove_for_endpoint(&txn, endpoint.id)?;
        assert!(list(&txn, endpoint.id)?.is_empty());
        assert_eq!(list(&txn, other.id)?.len(), 1);
        Ok(())
    }
}
