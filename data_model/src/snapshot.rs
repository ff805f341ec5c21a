use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display};

use crate::EndpointId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DockerSnapshotRaw {
    pub containers: Value,
    pub volumes: Value,
    pub images: Value,
    pub networks: Value,
    pub info: Value,
    pub version: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DockerSnapshot {
    pub time: u64,
    pub docker_version: String,
    pub swarm: bool,
    pub total_cpu: u64,
    pub total_memory: u64,
    pub running_container_count: u32,
    pub stopped_container_count: u32,
    pub healthy_container_count: u32,
    pub unhealthy_container_count: u32,
    pub volume_count: u32,
    pub image_count: u32,
    pub service_count: u32,
    pub stack_count: u32,
    pub node_count: u32,
    pub raw: DockerSnapshotRaw,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct KubernetesSnapshot {
    pub time: u64,
    pub kubernetes_version: String,
    pub node_count: u32,
    pub total_cpu: u64,
    pub total_memory: u64,
    pub diagnostics: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum SnapshotKind {
    Docker,
    Kubernetes,
}

/// Last known inventory of one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Snapshot {
    pub endpoint_id: EndpointId,
    #[serde(default)]
    pub docker: Option<DockerSnapshot>,
    #[serde(default)]
    pub kubernetes: Option<KubernetesSnapshot>,
    /// Parts exactly as the agent sent them. Hashes and patches apply to
    /// these, the typed parts above are decoded from them.
    #[serde(default)]
    pub docker_reported: Option<Value>,
    #[serde(default)]
    pub kubernetes_reported: Option<Value>,
    #[serde(default)]
    pub updated_at: u64,
}

impl Snapshot {
    pub fn new(endpoint_id: EndpointId) -> Self {
        Self {
            endpoint_id,
            ..Default::default()
        }
    }

    pub fn key(&self) -> [u8; 8] {
        self.endpoint_id.key()
    }

    /// The stored part of `kind` as the agent reported it, if any. Records
    /// written before reported parts were kept fall back to the typed part.
    pub fn part_value(&self, kind: SnapshotKind) -> Result<Option<Value>> {
        let (reported, typed) = match kind {
            SnapshotKind::Docker => (
                &self.docker_reported,
                self.docker.as_ref().map(serde_json::to_value),
            ),
            SnapshotKind::Kubernetes => (
                &self.kubernetes_reported,
                self.kubernetes.as_ref().map(serde_json::to_value),
            ),
        };
        if let Some(reported) = reported {
            return Ok(Some(reported.clone()));
        }
        Ok(typed.transpose()?)
    }

    /// Replaces the part of `kind` with `value`. Fails without touching the
    /// snapshot when `value` does not decode into the typed part.
    pub fn set_part_value(&mut self, kind: SnapshotKind, value: Value) -> Result<()> {
        match kind {
            SnapshotKind::Docker => {
                self.docker = Some(DockerSnapshot::deserialize(&value)?);
                self.docker_reported = Some(value);
            }
            SnapshotKind::Kubernetes => {
                self.kubernetes = Some(KubernetesSnapshot::deserialize(&value)?);
                self.kubernetes_reported = Some(value);
            }
        }
        Ok(())
    }
}

/// `value` as JSON with object keys sorted at every level. `serde_json::Map`
/// is ordered by key, so the plain encoding is already canonical.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// 32-bit content hash of a snapshot part: the first four bytes of the
/// SHA-256 of its canonical JSON.
pub fn snapshot_hash(value: &Value) -> u32 {
    let digest = Sha256::digest(canonical_json(value));
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b: Value = serde_json::from_str(r#"{"a": {"x": null, "y": [1, 2]}, "b": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(snapshot_hash(&a), snapshot_hash(&b));

        let c = json!({"b": 1, "a": {"y": [2, 1], "x": null}});
        assert_ne!(snapshot_hash(&a), snapshot_hash(&c));
    }

    #[test]
    fn test_canonical_json_is_valid_json() {
        let value = json!({"name": "quote\"d", "n": 1.5, "list": [true, "x"]});
        let bytes = canonical_json(&value);
        let decoded: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_part_round_trip() {
        let mut snapshot = Snapshot::new(EndpointId::new(3));
        assert!(snapshot.part_value(SnapshotKind::Docker).unwrap().is_none());

        snapshot
            .set_part_value(
                SnapshotKind::Docker,
                json!({"docker_version": "24.0.5", "running_container_count": 3}),
            )
            .unwrap();
        let docker = snapshot.docker.as_ref().unwrap();
        assert_eq!(docker.docker_version, "24.0.5");
        assert_eq!(docker.running_container_count, 3);

        assert!(snapshot
            .set_part_value(SnapshotKind::Kubernetes, json!({"node_count": "many"}))
            .is_err());
        assert!(snapshot.kubernetes.is_none());
        assert!(snapshot.kubernetes_reported.is_none());
    }

    #[test]
    fn test_part_value_is_what_the_agent_sent() {
        let sent = json!({
            "docker_version": "24.0.5",
            "running_container_count": 2,
            "agent_extra": {"labels": ["edge"]}
        });
        let mut snapshot = Snapshot::new(EndpointId::new(4));
        snapshot.set_part_value(SnapshotKind::Docker, sent.clone()).unwrap();

        let stored = snapshot.part_value(SnapshotKind::Docker).unwrap().unwrap();
        assert_eq!(stored, sent);
        assert_eq!(snapshot_hash(&stored), snapshot_hash(&sent));
        assert_eq!(snapshot.docker.as_ref().unwrap().running_container_count, 2);
    }

    #[test]
    fn test_part_value_falls_back_to_typed_part() {
        let mut snapshot = Snapshot::new(EndpointId::new(5));
        snapshot.kubernetes = Some(KubernetesSnapshot {
            node_count: 2,
            ..Default::default()
        });
        let value = snapshot.part_value(SnapshotKind::Kubernetes).unwrap().unwrap();
        assert_eq!(value["node_count"], json!(2));
    }
}
