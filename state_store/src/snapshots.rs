use anyhow::Result;
use data_model::{snapshot_hash, EndpointId, Snapshot, SnapshotKind};
use edge_utils::get_epoch_time_in_ms;
use json_patch::Patch;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    driver::Transaction,
    state_machine::{get_snapshot, put_object, EdgeObjectsColumns},
};

/// One kind of snapshot as sent by an agent: either the full part, or a
/// patch against the part it sent before together with that part's hash.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotPart {
    #[serde(default)]
    pub full: Option<Value>,
    #[serde(default)]
    pub patch: Option<Value>,
    /// Hash of the previously sent part the patch applies to.
    #[serde(default)]
    pub previous_hash: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotPayload {
    #[serde(default)]
    pub docker: Option<SnapshotPart>,
    #[serde(default)]
    pub kubernetes: Option<SnapshotPart>,
}

/// Why a part could not be applied. Every variant asks the agent for a full
/// snapshot on its next check-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    MissingPrevious,
    MissingHash,
    HashMismatch { expected: u32, actual: u32 },
    InvalidPatch(String),
    InvalidSnapshot(String),
}

/// Merges the reported parts into the stored snapshot. Returns true when the
/// agent has to send a full snapshot. A part that fails verification leaves
/// the stored part untouched.
pub(crate) fn reconcile(
    txn: &Transaction,
    endpoint_id: EndpointId,
    payload: &SnapshotPayload,
) -> Result<bool> {
    let mut snapshot = get_snapshot(txn, endpoint_id)?;
    let mut need_full_snapshot = false;
    let mut changed = false;

    let parts = [
        (SnapshotKind::Docker, payload.docker.as_ref()),
        (SnapshotKind::Kubernetes, payload.kubernetes.as_ref()),
    ];
    for (kind, part) in parts {
        let Some(part) = part else {
            continue;
        };
        match apply_part(&mut snapshot, kind, part) {
            Ok(applied) => changed |= applied,
            Err(drift) => {
                debug!(
                    endpoint_id = %endpoint_id,
                    kind = %kind,
                    drift = ?drift,
                    "snapshot drift, requesting a full snapshot"
                );
                need_full_snapshot = true;
            }
        }
    }

    if changed {
        snapshot.updated_at = get_epoch_time_in_ms();
        put_object(txn, EdgeObjectsColumns::Snapshots, snapshot.key(), &snapshot)?;
    }
    Ok(need_full_snapshot)
}

/// Applies one part on a scratch value and only stores it once it decoded.
pub fn apply_part(
    snapshot: &mut Snapshot,
    kind: SnapshotKind,
    part: &SnapshotPart,
) -> Result<bool, Drift> {
    if let Some(full) = &part.full {
        snapshot
            .set_part_value(kind, full.clone())
            .map_err(|e| Drift::InvalidSnapshot(e.to_string()))?;
        return Ok(true);
    }
    let Some(patch) = &part.patch else {
        return Ok(false);
    };

    let mut scratch = snapshot
        .part_value(kind)
        .map_err(|e| {
            warn!("failed to encode stored snapshot: {:?}", e);
            Drift::MissingPrevious
        })?
        .ok_or(Drift::MissingPrevious)?;
    let expected = part.previous_hash.ok_or(Drift::MissingHash)?;
    let actual = snapshot_hash(&scratch);
    if expected != actual {
        return Err(Drift::HashMismatch { expected, actual });
    }

    let patch: Patch =
        serde_json::from_value(patch.clone()).map_err(|e| Drift::InvalidPatch(e.to_string()))?;
    json_patch::patch(&mut scratch, &patch).map_err(|e| Drift::InvalidPatch(e.to_string()))?;
    snapshot
        .set_part_value(kind, scratch)
        .map_err(|e| Drift::InvalidSnapshot(e.to_string()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stored() -> Snapshot {
        let mut snapshot = Snapshot::new(EndpointId::new(1));
        snapshot
            .set_part_value(
                SnapshotKind::Docker,
                json!({"docker_version": "24.0.5", "running_container_count": 2}),
            )
            .unwrap();
        snapshot
    }

    fn stored_hash(snapshot: &Snapshot) -> u32 {
        snapshot_hash(&snapshot.part_value(SnapshotKind::Docker).unwrap().unwrap())
    }

    #[test]
    fn test_verified_patch_applies() {
        let mut snapshot = stored();
        let part = SnapshotPart {
            full: None,
            patch: Some(json!([
                {"op": "replace", "path": "/running_container_count", "value": 5}
            ])),
            previous_hash: Some(stored_hash(&snapshot)),
        };
        assert_eq!(apply_part(&mut snapshot, SnapshotKind::Docker, &part), Ok(true));
        let docker = snapshot.docker.unwrap();
        assert_eq!(docker.running_container_count, 5);
        assert_eq!(docker.docker_version, "24.0.5");
    }

    #[test]
    fn test_hash_mismatch_never_mutates() {
        let mut snapshot = stored();
        let before = snapshot.clone();
        let part = SnapshotPart {
            full: None,
            patch: Some(json!([
                {"op": "replace", "path": "/running_container_count", "value": 5}
            ])),
            previous_hash: Some(stored_hash(&snapshot).wrapping_add(1)),
        };
        assert!(matches!(
            apply_part(&mut snapshot, SnapshotKind::Docker, &part),
            Err(Drift::HashMismatch { .. })
        ));
        assert_eq!(snapshot, before);
    }

    #[test]
    fn test_patch_without_previous_part() {
        let mut snapshot = Snapshot::new(EndpointId::new(1));
        let part = SnapshotPart {
            full: None,
            patch: Some(json!([])),
            previous_hash: Some(0),
        };
        assert_eq!(
            apply_part(&mut snapshot, SnapshotKind::Kubernetes, &part),
            Err(Drift::MissingPrevious)
        );
    }

    #[test]
    fn test_failed_patch_keeps_stored_part() {
        let mut snapshot = stored();
        let before = snapshot.clone();
        let hash = stored_hash(&snapshot);

        // The first operation would succeed; the second fails, so nothing is kept.
        let part = SnapshotPart {
            full: None,
            patch: Some(json!([
                {"op": "replace", "path": "/running_container_count", "value": 9},
                {"op": "remove", "path": "/does_not_exist"}
            ])),
            previous_hash: Some(hash),
        };
        assert!(matches!(
            apply_part(&mut snapshot, SnapshotKind::Docker, &part),
            Err(Drift::InvalidPatch(_))
        ));
        assert_eq!(snapshot, before);

        // A patch producing a value of the wrong shape is rejected as well.
        let part = SnapshotPart {
            full: None,
            patch: Some(json!([
                {"op": "replace", "path": "/running_container_count", "value": "lots"}
            ])),
            previous_hash: Some(hash),
        };
        assert!(matches!(
            apply_part(&mut snapshot, SnapshotKind::Docker, &part),
            Err(Drift::InvalidSnapshot(_))
        ));
        assert_eq!(snapshot, before);
    }

    #[test]
    fn test_full_part_replaces() {
        let mut snapshot = stored();
        let part = SnapshotPart {
            full: Some(json!({"kubernetes_version": "1.29", "node_count": 3})),
            patch: None,
            previous_hash: None,
        };
        assert_eq!(apply_part(&mut snapshot, SnapshotKind::Kubernetes, &part), Ok(true));
        assert_eq!(snapshot.kubernetes.unwrap().node_count, 3);
        assert!(snapshot.docker.is_some());
    }
}
