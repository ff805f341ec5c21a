pub mod async_command;
pub mod edge_config;
pub mod snapshot;
pub mod test_objects;
pub mod update_schedule;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
};

pub use async_command::*;
use derive_builder::Builder;
pub use edge_config::*;
use edge_utils::get_epoch_time_in_ms;
use serde::{Deserialize, Serialize};
pub use snapshot::*;
use strum::{AsRefStr, Display};
pub use update_schedule::*;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            pub fn get(&self) -> u64 {
                self.0
            }

            /// Big-endian storage key, so byte order matches numeric order.
            pub fn key(&self) -> [u8; 8] {
                self.0.to_be_bytes()
            }

            pub fn from_key(key: &[u8]) -> Option<Self> {
                let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
                Some(Self(u64::from_be_bytes(bytes)))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(EndpointId);
numeric_id!(EdgeStackId);
numeric_id!(EdgeGroupId);
numeric_id!(EdgeJobId);
numeric_id!(EdgeConfigId);
numeric_id!(UpdateScheduleId);
numeric_id!(
    /// Identifies a command inside one endpoint's command log.
    EdgeCommandId
);
numeric_id!(TagId);

#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid edge configuration state transition from {from} to {to}")]
    InvalidTransition {
        from: EdgeConfigStateKind,
        to: EdgeConfigStateKind,
    },

    #[error("endpoint {endpoint_id} already has an active update schedule {active}")]
    ScheduleConflict {
        endpoint_id: EndpointId,
        active: UpdateScheduleId,
    },

    #[error("endpoint {endpoint_id} has active update schedule {active}, not {requested}")]
    ScheduleMismatch {
        endpoint_id: EndpointId,
        active: UpdateScheduleId,
        requested: UpdateScheduleId,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl EdgeError {
    pub fn not_found(kind: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Errors that an agent may trigger by re-sending a report that was
    /// already applied.
    pub fn is_stale_report(&self) -> bool {
        matches!(
            self,
            Self::InvalidState(_) | Self::InvalidTransition { .. } | Self::NotFound { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineMetadata {
    pub db_version: u64,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, AsRefStr, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    #[default]
    EdgeAgentOnDocker,
    EdgeAgentOnKubernetes,
    EdgeAgentOnNomad,
}

impl EndpointType {
    /// Maps the agent platform code sent in the platform header.
    pub fn from_platform(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::EdgeAgentOnDocker),
            2 => Some(Self::EdgeAgentOnKubernetes),
            3 => Some(Self::EdgeAgentOnNomad),
            _ => None,
        }
    }

    pub fn platform(&self) -> u8 {
        match self {
            Self::EdgeAgentOnDocker => 1,
            Self::EdgeAgentOnKubernetes => 2,
            Self::EdgeAgentOnNomad => 3,
        }
    }
}

/// An interval the endpoint may override. Stored and sent as `-1` when the
/// instance-wide default applies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(from = "i64", into = "i64")]
pub enum IntervalSetting {
    #[default]
    UseDefault,
    Seconds(u32),
}

impl IntervalSetting {
    pub fn resolve(self, default_secs: u32) -> u32 {
        match self {
            Self::UseDefault => default_secs,
            Self::Seconds(secs) => secs,
        }
    }
}

impl From<i64> for IntervalSetting {
    fn from(value: i64) -> Self {
        if value <= 0 {
            return Self::UseDefault;
        }
        Self::Seconds(u32::try_from(value).unwrap_or(u32::MAX))
    }
}

impl From<IntervalSetting> for i64 {
    fn from(value: IntervalSetting) -> Self {
        match value {
            IntervalSetting::UseDefault => -1,
            IntervalSetting::Seconds(secs) => secs as i64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EndpointEdgeSettings {
    pub async_mode: bool,
    #[serde(default)]
    pub ping_interval: IntervalSetting,
    #[serde(default)]
    pub snapshot_interval: IntervalSetting,
    #[serde(default)]
    pub command_interval: IntervalSetting,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EndpointAgent {
    pub version: String,
    pub previous_version: String,
}

/// Agent metadata carried by check-in headers.
#[derive(Debug, Clone, Default)]
pub struct AgentReport {
    pub version: Option<String>,
    pub platform: Option<EndpointType>,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    #[builder(default)]
    pub endpoint_type: EndpointType,
    #[builder(default)]
    pub edge_id: Option<String>,
    #[builder(default)]
    pub edge: EndpointEdgeSettings,
    #[builder(default)]
    #[serde(default)]
    pub checkin_interval: IntervalSetting,
    #[builder(default)]
    pub agent: EndpointAgent,
    #[builder(default)]
    pub local_time_zone: Option<String>,
    #[builder(default)]
    pub user_trusted: bool,
    #[builder(default)]
    pub tag_ids: BTreeSet<TagId>,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl Endpoint {
    pub fn key(&self) -> [u8; 8] {
        self.id.key()
    }

    pub fn is_async(&self) -> bool {
        self.edge.async_mode
    }

    /// Applies agent-reported metadata. Returns true when the stored record
    /// needs rewriting.
    pub fn apply_agent_report(&mut self, report: &AgentReport) -> bool {
        let mut changed = false;
        if let Some(version) = report.version.as_deref().filter(|v| !v.is_empty()) {
            if version != self.agent.version {
                self.agent.previous_version = std::mem::take(&mut self.agent.version);
                self.agent.version = version.to_string();
                changed = true;
            }
        }
        if let Some(platform) = report.platform {
            if platform != self.endpoint_type {
                self.endpoint_type = platform;
                changed = true;
            }
        }
        if let Some(tz) = report.time_zone.as_deref().filter(|tz| !tz.is_empty()) {
            if self.local_time_zone.as_deref() != Some(tz) {
                self.local_time_zone = Some(tz.to_string());
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EndpointRelation {
    pub endpoint_id: EndpointId,
    pub edge_stacks: BTreeMap<EdgeStackId, bool>,
}

impl EndpointRelation {
    pub fn new(endpoint_id: EndpointId) -> Self {
        Self {
            endpoint_id,
            edge_stacks: BTreeMap::new(),
        }
    }

    pub fn enabled_stacks(&self) -> impl Iterator<Item = EdgeStackId> + '_ {
        self.edge_stacks
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(id, _)| *id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct EdgeGroup {
    pub id: EdgeGroupId,
    pub name: String,
    #[builder(default)]
    pub dynamic: bool,
    #[builder(default)]
    pub tag_ids: BTreeSet<TagId>,
    #[builder(default)]
    pub partial_match: bool,
    #[builder(default)]
    pub endpoints: BTreeSet<EndpointId>,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl EdgeGroup {
    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        if !self.dynamic {
            return self.endpoints.contains(&endpoint.id);
        }
        if self.tag_ids.is_empty() {
            return false;
        }
        if self.partial_match {
            self.tag_ids.iter().any(|tag| endpoint.tag_ids.contains(tag))
        } else {
            self.tag_ids.is_subset(&endpoint.tag_ids)
        }
    }
}

/// Resolves the endpoints that belong to any of `groups`.
pub fn related_endpoints<'a>(
    groups: impl IntoIterator<Item = &'a EdgeGroup>,
    endpoints: &[Endpoint],
) -> BTreeSet<EndpointId> {
    let groups: Vec<&EdgeGroup> = groups.into_iter().collect();
    endpoints
        .iter()
        .filter(|endpoint| groups.iter().any(|group| group.matches(endpoint)))
        .map(|endpoint| endpoint.id)
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "snake_case")]
pub enum StackDeploymentType {
    #[default]
    Compose,
    Kubernetes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStackStatusKind {
    Pending,
    DeploymentReceived,
    Acknowledged,
    ImagesPulled,
    Deploying,
    Running,
    Error,
    Removing,
    Removed,
    RemoteUpdateSuccess,
    RollingBack,
    RolledBack,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeStackStatusEntry {
    pub kind: EdgeStackStatusKind,
    pub time: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeploymentInfo {
    pub version: u32,
    pub file_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EdgeStackEndpointStatus {
    pub details: Vec<EdgeStackStatusEntry>,
    #[serde(default)]
    pub deployment_info: Option<DeploymentInfo>,
}

impl EdgeStackEndpointStatus {
    pub fn pending(deployment_info: DeploymentInfo) -> Self {
        Self {
            details: vec![EdgeStackStatusEntry {
                kind: EdgeStackStatusKind::Pending,
                time: get_epoch_time_in_ms(),
                error: None,
            }],
            deployment_info: Some(deployment_info),
        }
    }

    pub fn latest(&self) -> Option<EdgeStackStatusKind> {
        self.details.last().map(|entry| entry.kind)
    }

    pub fn has(&self, kind: EdgeStackStatusKind) -> bool {
        self.details.iter().any(|entry| entry.kind == kind)
    }

    /// Appends a status unless it repeats the latest one.
    pub fn push(&mut self, kind: EdgeStackStatusKind, error: Option<String>) {
        if self.latest() == Some(kind) && error.is_none() {
            return;
        }
        self.details.push(EdgeStackStatusEntry {
            kind,
            time: get_epoch_time_in_ms(),
            error,
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct EdgeStack {
    pub id: EdgeStackId,
    pub name: String,
    #[builder(default)]
    pub edge_groups: BTreeSet<EdgeGroupId>,
    #[builder(default)]
    pub deployment_type: StackDeploymentType,
    #[builder(default = "\"docker-compose.yml\".to_string()")]
    pub entry_point: String,
    #[builder(default = "1")]
    pub version: u32,
    #[builder(default = "1")]
    pub stack_file_version: u32,
    #[builder(default)]
    pub previous_deployment_info: Option<DeploymentInfo>,
    #[builder(default)]
    pub rollback_to: Option<u32>,
    #[builder(default)]
    pub status: BTreeMap<EndpointId, EdgeStackEndpointStatus>,
    #[builder(default)]
    pub num_deployments: u32,
    #[builder(default)]
    pub scheduled_time: Option<String>,
    #[builder(default)]
    pub update_schedule_id: Option<UpdateScheduleId>,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl EdgeStack {
    pub fn key(&self) -> [u8; 8] {
        self.id.key()
    }

    pub fn deployment_info(&self) -> DeploymentInfo {
        DeploymentInfo {
            version: self.version,
            file_version: self.stack_file_version,
        }
    }

    pub fn file_key(id: EdgeStackId, file_version: u32, entry_point: &str) -> String {
        format!("edge_stacks/{}/v{}/{}", id, file_version, entry_point)
    }

    pub fn files_prefix(id: EdgeStackId) -> String {
        format!("edge_stacks/{}", id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "snake_case")]
pub enum EdgeJobLogsStatus {
    #[default]
    Idle,
    Pending,
    Collected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EdgeJobEndpointMeta {
    pub logs_status: EdgeJobLogsStatus,
    pub collect_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct EdgeJob {
    pub id: EdgeJobId,
    pub name: String,
    pub cron_expression: String,
    pub script: String,
    #[builder(default)]
    pub recurring: bool,
    #[builder(default)]
    pub edge_groups: BTreeSet<EdgeGroupId>,
    #[builder(default)]
    pub explicit_endpoints: BTreeSet<EndpointId>,
    /// Resolved targets with their log collection bookkeeping.
    #[builder(default)]
    pub endpoints: BTreeMap<EndpointId, EdgeJobEndpointMeta>,
    #[builder(default = "1")]
    pub version: u32,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
}

impl EdgeJob {
    pub fn key(&self) -> [u8; 8] {
        self.id.key()
    }

    pub fn logs_key(id: EdgeJobId, endpoint_id: EndpointId) -> String {
        format!("edge_jobs/{}/logs/{}.log", id, endpoint_id)
    }

    pub fn files_prefix(id: EdgeJobId) -> String {
        format!("edge_jobs/{}", id)
    }

    pub fn endpoint_meta(&self, endpoint_id: EndpointId) -> EdgeJobEndpointMeta {
        self.endpoints
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_objects::tests::{mock_dynamic_group, mock_endpoint, mock_static_group};

    #[test]
    fn test_interval_setting_sentinel() {
        assert_eq!(IntervalSetting::from(-1), IntervalSetting::UseDefault);
        assert_eq!(IntervalSetting::from(30), IntervalSetting::Seconds(30));
        assert_eq!(i64::from(IntervalSetting::UseDefault), -1);
        assert_eq!(IntervalSetting::UseDefault.resolve(60), 60);
        assert_eq!(IntervalSetting::Seconds(5).resolve(60), 5);

        let json = serde_json::to_string(&EndpointEdgeSettings::default()).unwrap();
        assert!(json.contains("\"ping_interval\":-1"), "{}", json);
    }

    #[test]
    fn test_id_keys_sort_numerically() {
        let a = EndpointId::new(2);
        let b = EndpointId::new(256);
        assert!(a.key() < b.key());
        assert_eq!(EndpointId::from_key(&b.key()), Some(b));
        assert_eq!(EndpointId::from_key(&[1, 2]), None);
    }

    #[test]
    fn test_apply_agent_report_tracks_previous_version() {
        let mut endpoint = mock_endpoint(1, "edge-1", true);
        endpoint.agent.version = "2.18.0".to_string();

        let report = AgentReport {
            version: Some("2.19.0".to_string()),
            platform: None,
            time_zone: Some("Europe/Paris".to_string()),
        };
        assert!(endpoint.apply_agent_report(&report));
        assert_eq!(endpoint.agent.version, "2.19.0");
        assert_eq!(endpoint.agent.previous_version, "2.18.0");
        assert_eq!(endpoint.local_time_zone.as_deref(), Some("Europe/Paris"));

        // Re-applying the same report changes nothing.
        assert!(!endpoint.apply_agent_report(&report));
    }

    #[test]
    fn test_group_membership() {
        let mut tagged = mock_endpoint(1, "edge-1", false);
        tagged.tag_ids = [TagId::new(1), TagId::new(2)].into();
        let mut half_tagged = mock_endpoint(2, "edge-2", false);
        half_tagged.tag_ids = [TagId::new(1)].into();
        let untagged = mock_endpoint(3, "edge-3", false);
        let endpoints = vec![tagged, half_tagged, untagged];

        let full = mock_dynamic_group(1, &[1, 2], false);
        assert_eq!(
            related_endpoints([&full], &endpoints),
            [EndpointId::new(1)].into()
        );

        let partial = mock_dynamic_group(2, &[1, 2], true);
        assert_eq!(
            related_endpoints([&partial], &endpoints),
            [EndpointId::new(1), EndpointId::new(2)].into()
        );

        // Static groups ignore members that no longer exist.
        let fixed = mock_static_group(3, &[3, 99]);
        assert_eq!(
            related_endpoints([&fixed, &full], &endpoints),
            [EndpointId::new(1), EndpointId::new(3)].into()
        );
    }

    #[test]
    fn test_stack_status_push_skips_repeats() {
        let mut status = EdgeStackEndpointStatus::pending(DeploymentInfo::default());
        status.push(EdgeStackStatusKind::Running, None);
        status.push(EdgeStackStatusKind::Running, None);
        assert_eq!(status.details.len(), 2);
        assert_eq!(status.latest(), Some(EdgeStackStatusKind::Running));
        assert!(status.has(EdgeStackStatusKind::Pending));
    }
}
