use std::collections::{BTreeMap, BTreeSet};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use data_model::{
    EdgeAsyncCommand,
    EdgeConfigStateKind,
    EdgeConfiguration,
    EdgeError,
    EdgeGroup,
    EdgeJob,
    EdgeStack,
    EdgeStackEndpointStatus,
    EdgeStackStatusKind,
    Endpoint,
    IntervalSetting,
    Snapshot,
    TagId,
    UpdateSchedule,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use state_store::snapshots::{SnapshotPart, SnapshotPayload};
use tracing::error;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct EdgeAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl EdgeAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl From<anyhow::Error> for EdgeAPIError {
    fn from(e: anyhow::Error) -> Self {
        let status_code = match e.downcast_ref::<EdgeError>() {
            Some(EdgeError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(EdgeError::Forbidden(_)) => StatusCode::FORBIDDEN,
            Some(_) => StatusCode::BAD_REQUEST,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status_code, &e.to_string())
    }
}

impl From<serde_json::Error> for EdgeAPIError {
    fn from(e: serde_json::Error) -> Self {
        Self::bad_request(&e.to_string())
    }
}

impl IntoResponse for EdgeAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, Json(self)).into_response()
    }
}

fn tag_set(tags: &[u64]) -> BTreeSet<TagId> {
    tags.iter().copied().map(TagId::from).collect()
}

fn id_set<T: From<u64> + Ord>(ids: &[u64]) -> BTreeSet<T> {
    ids.iter().copied().map(T::from).collect()
}

// Agent-facing objects.

/// One snapshot kind: either `full`, or `patch` (RFC 6902) together with the
/// hash of the part it applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct SnapshotPartBody {
    #[schema(value_type = Option<Object>)]
    pub full: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub patch: Option<Value>,
    pub previous_hash: Option<u32>,
}

impl From<SnapshotPartBody> for SnapshotPart {
    fn from(part: SnapshotPartBody) -> Self {
        SnapshotPart {
            full: part.full,
            patch: part.patch,
            previous_hash: part.previous_hash,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct SnapshotBody {
    pub docker: Option<SnapshotPartBody>,
    pub kubernetes: Option<SnapshotPartBody>,
}

impl From<SnapshotBody> for SnapshotPayload {
    fn from(body: SnapshotBody) -> Self {
        SnapshotPayload {
            docker: body.docker.map(Into::into),
            kubernetes: body.kubernetes.map(Into::into),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StackStatusBody {
    pub stack_id: u64,
    #[schema(value_type = String)]
    pub status: EdgeStackStatusKind,
    #[serde(default)]
    pub error: Option<String>,
    /// Stack version the report refers to.
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobStatusBody {
    pub job_id: u64,
    #[serde(default)]
    pub logs_collected: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct AsyncCheckInBody {
    /// Creation time of the newest command the agent has seen.
    pub command_timestamp: Option<u64>,
    pub snapshot: Option<SnapshotBody>,
    pub stack_statuses: Vec<StackStatusBody>,
    pub job_statuses: Vec<JobStatusBody>,
    /// Configuration id to state name or numeric state code.
    #[schema(value_type = BTreeMap<String, String>)]
    pub edge_config_states: BTreeMap<u64, Value>,
}

/// Parses a state sent either as a name or as its numeric code.
pub fn parse_config_state(value: &Value) -> Result<EdgeConfigStateKind, EdgeAPIError> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(EdgeAPIError::bad_request(&format!(
                "invalid edge configuration state {}",
                other
            )))
        }
    };
    raw.parse::<EdgeConfigStateKind>()
        .map_err(|e| EdgeAPIError::bad_request(&e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentCommand {
    pub id: u64,
    /// Payload kind, for example `EdgeStack` or `Container`.
    #[serde(rename = "type")]
    pub kind: String,
    pub operation: String,
    pub path: String,
    pub timestamp: u64,
    pub scheduled_time: Option<String>,
    #[schema(value_type = Object)]
    pub value: Value,
}

impl TryFrom<EdgeAsyncCommand> for AgentCommand {
    type Error = serde_json::Error;

    fn try_from(command: EdgeAsyncCommand) -> Result<Self, Self::Error> {
        let mut tagged = serde_json::to_value(&command.payload)?;
        let value = tagged
            .get_mut("value")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Self {
            id: command.id.get(),
            kind: command.payload.to_string(),
            operation: command.operation.to_string(),
            path: command.path,
            timestamp: command.timestamp,
            scheduled_time: command.scheduled_time,
            value,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AsyncCheckInResponse {
    pub endpoint_id: u64,
    pub ping_interval: u32,
    pub snapshot_interval: u32,
    pub command_interval: u32,
    pub need_full_snapshot: bool,
    pub commands: Vec<AgentCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeJobSchedule {
    pub id: u64,
    pub cron_expression: String,
    /// Base64 encoded script body.
    pub script: String,
    pub version: u32,
    pub collect_logs: bool,
}

impl EdgeJobSchedule {
    pub fn new(job: &EdgeJob, collect_logs: bool) -> Self {
        Self {
            id: job.id.get(),
            cron_expression: job.cron_expression.clone(),
            script: STANDARD.encode(&job.script),
            version: job.version,
            collect_logs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeStatusStack {
    pub id: u64,
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeStatusResponse {
    /// `REQUIRED`, `ACTIVE` or `IDLE`.
    pub status: String,
    pub port: Option<u16>,
    pub credentials: Option<String>,
    pub checkin_interval: u32,
    pub schedules: Vec<EdgeJobSchedule>,
    pub stacks: Vec<EdgeStatusStack>,
    #[schema(value_type = BTreeMap<String, String>)]
    pub edge_configurations: BTreeMap<u64, EdgeConfigStateKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeStackFileResponse {
    pub name: String,
    pub stack_file_content: String,
    pub file_version: u32,
    #[schema(value_type = String)]
    pub deployment_type: data_model::StackDeploymentType,
    pub rollback_to: Option<u32>,
    /// Registry credentials are resolved by the agent.
    #[schema(value_type = Vec<Object>)]
    pub registry_credentials: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams)]
pub struct StackFileParams {
    /// Serve an older file version, used for rollbacks.
    pub version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StackStatusUpdate {
    #[schema(value_type = String)]
    pub status: EdgeStackStatusKind,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConfigFile {
    pub path: String,
    /// Base64 encoded content.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeConfigFilesResponse {
    pub id: u64,
    pub name: String,
    pub base_dir: String,
    #[schema(value_type = String)]
    pub category: data_model::EdgeConfigCategory,
    pub version: u32,
    #[schema(value_type = String)]
    pub state: EdgeConfigStateKind,
    pub files: Vec<ConfigFile>,
    /// Files of the version being replaced, only while updating.
    pub prev_files: Vec<ConfigFile>,
}

// Administrator objects.

fn default_interval() -> i64 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateEndpoint {
    pub name: String,
    #[serde(default)]
    #[schema(value_type = String)]
    pub endpoint_type: data_model::EndpointType,
    #[serde(default)]
    pub edge_id: Option<String>,
    #[serde(default)]
    pub async_mode: bool,
    /// Seconds, `-1` uses the instance default.
    #[serde(default = "default_interval")]
    pub ping_interval: i64,
    #[serde(default = "default_interval")]
    pub snapshot_interval: i64,
    #[serde(default = "default_interval")]
    pub command_interval: i64,
    #[serde(default = "default_interval")]
    pub checkin_interval: i64,
    #[serde(default)]
    pub local_time_zone: Option<String>,
    #[serde(default)]
    pub user_trusted: bool,
    #[serde(default)]
    pub tag_ids: Vec<u64>,
}

impl From<CreateEndpoint> for state_store::requests::CreateEndpointRequest {
    fn from(body: CreateEndpoint) -> Self {
        Self {
            name: body.name,
            endpoint_type: body.endpoint_type,
            edge_id: body.edge_id,
            edge: data_model::EndpointEdgeSettings {
                async_mode: body.async_mode,
                ping_interval: IntervalSetting::from(body.ping_interval),
                snapshot_interval: IntervalSetting::from(body.snapshot_interval),
                command_interval: IntervalSetting::from(body.command_interval),
            },
            checkin_interval: IntervalSetting::from(body.checkin_interval),
            local_time_zone: body.local_time_zone,
            user_trusted: body.user_trusted,
            tag_ids: tag_set(&body.tag_ids),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct UpdateEndpoint {
    pub name: Option<String>,
    pub async_mode: Option<bool>,
    pub ping_interval: Option<i64>,
    pub snapshot_interval: Option<i64>,
    pub command_interval: Option<i64>,
    pub checkin_interval: Option<i64>,
    pub local_time_zone: Option<String>,
    pub user_trusted: Option<bool>,
    pub tag_ids: Option<Vec<u64>>,
}

impl UpdateEndpoint {
    pub fn into_request(self, current: &Endpoint) -> state_store::requests::UpdateEndpointRequest {
        let edge_changed = self.async_mode.is_some() ||
            self.ping_interval.is_some() ||
            self.snapshot_interval.is_some() ||
            self.command_interval.is_some();
        let edge = edge_changed.then(|| data_model::EndpointEdgeSettings {
            async_mode: self.async_mode.unwrap_or(current.edge.async_mode),
            ping_interval: self
                .ping_interval
                .map(IntervalSetting::from)
                .unwrap_or(current.edge.ping_interval),
            snapshot_interval: self
                .snapshot_interval
                .map(IntervalSetting::from)
                .unwrap_or(current.edge.snapshot_interval),
            command_interval: self
                .command_interval
                .map(IntervalSetting::from)
                .unwrap_or(current.edge.command_interval),
        });
        state_store::requests::UpdateEndpointRequest {
            id: current.id,
            name: self.name,
            edge,
            checkin_interval: self.checkin_interval.map(IntervalSetting::from),
            local_time_zone: self.local_time_zone,
            user_trusted: self.user_trusted,
            tag_ids: self.tag_ids.as_deref().map(tag_set),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EndpointBody {
    pub id: u64,
    pub name: String,
    #[schema(value_type = String)]
    pub endpoint_type: data_model::EndpointType,
    pub edge_id: Option<String>,
    pub async_mode: bool,
    pub ping_interval: i64,
    pub snapshot_interval: i64,
    pub command_interval: i64,
    pub checkin_interval: i64,
    pub agent_version: String,
    pub agent_previous_version: String,
    pub local_time_zone: Option<String>,
    pub user_trusted: bool,
    pub tag_ids: Vec<u64>,
    pub created_at: u64,
    /// Epoch milliseconds of the last check-in seen by this instance.
    pub last_check_in: Option<u64>,
}

impl EndpointBody {
    pub fn new(endpoint: Endpoint, last_check_in: Option<u64>) -> Self {
        Self {
            id: endpoint.id.get(),
            name: endpoint.name,
            endpoint_type: endpoint.endpoint_type,
            edge_id: endpoint.edge_id,
            async_mode: endpoint.edge.async_mode,
            ping_interval: endpoint.edge.ping_interval.into(),
            snapshot_interval: endpoint.edge.snapshot_interval.into(),
            command_interval: endpoint.edge.command_interval.into(),
            checkin_interval: endpoint.checkin_interval.into(),
            agent_version: endpoint.agent.version,
            agent_previous_version: endpoint.agent.previous_version,
            local_time_zone: endpoint.local_time_zone,
            user_trusted: endpoint.user_trusted,
            tag_ids: endpoint.tag_ids.iter().map(|t| t.get()).collect(),
            created_at: endpoint.created_at,
            last_check_in,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EndpointList {
    pub endpoints: Vec<EndpointBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EndpointSnapshot {
    pub endpoint_id: u64,
    #[schema(value_type = Option<Object>)]
    pub docker: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub kubernetes: Option<Value>,
    pub updated_at: u64,
}

impl EndpointSnapshot {
    pub fn new(snapshot: &Snapshot) -> Result<Self, serde_json::Error> {
        Ok(Self {
            endpoint_id: snapshot.endpoint_id.get(),
            docker: snapshot.docker.as_ref().map(serde_json::to_value).transpose()?,
            kubernetes: snapshot
                .kubernetes
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
            updated_at: snapshot.updated_at,
        })
    }
}

/// An imperative command for an async endpoint. `command` uses the command
/// wire shape, `{"type": "Container", "value": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AppendCommand {
    #[schema(value_type = Object)]
    pub command: Value,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub operation: Option<data_model::CommandOperation>,
    #[serde(default)]
    pub scheduled_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelDetails {
    pub status: String,
    pub port: Option<u16>,
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct EdgeGroupBody {
    pub name: String,
    pub dynamic: bool,
    pub tag_ids: Vec<u64>,
    pub partial_match: bool,
    pub endpoints: Vec<u64>,
}

impl From<EdgeGroupBody> for state_store::requests::EdgeGroupRequest {
    fn from(body: EdgeGroupBody) -> Self {
        Self {
            name: body.name,
            dynamic: body.dynamic,
            tag_ids: tag_set(&body.tag_ids),
            partial_match: body.partial_match,
            endpoints: id_set(&body.endpoints),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeGroupResponse {
    pub id: u64,
    pub name: String,
    pub dynamic: bool,
    pub tag_ids: Vec<u64>,
    pub partial_match: bool,
    pub endpoints: Vec<u64>,
    pub created_at: u64,
}

impl From<EdgeGroup> for EdgeGroupResponse {
    fn from(group: EdgeGroup) -> Self {
        Self {
            id: group.id.get(),
            name: group.name,
            dynamic: group.dynamic,
            tag_ids: group.tag_ids.iter().map(|t| t.get()).collect(),
            partial_match: group.partial_match,
            endpoints: group.endpoints.iter().map(|e| e.get()).collect(),
            created_at: group.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeGroupList {
    pub edge_groups: Vec<EdgeGroupResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateEdgeStack {
    pub name: String,
    pub edge_groups: Vec<u64>,
    #[serde(default)]
    #[schema(value_type = String)]
    pub deployment_type: data_model::StackDeploymentType,
    #[serde(default)]
    pub entry_point: Option<String>,
    pub stack_file_content: String,
    #[serde(default)]
    pub scheduled_time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct UpdateEdgeStack {
    /// New file content. Creates a new file version.
    pub stack_file_content: Option<String>,
    pub edge_groups: Option<Vec<u64>>,
    pub redeploy: bool,
    pub rollback_to: Option<u32>,
    /// An empty string clears the schedule.
    pub scheduled_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StackStatusEntry {
    #[schema(value_type = String)]
    pub kind: EdgeStackStatusKind,
    pub time: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EndpointStackStatus {
    pub details: Vec<StackStatusEntry>,
    pub version: Option<u32>,
    pub file_version: Option<u32>,
}

impl From<&EdgeStackEndpointStatus> for EndpointStackStatus {
    fn from(status: &EdgeStackEndpointStatus) -> Self {
        Self {
            details: status
                .details
                .iter()
                .map(|entry| StackStatusEntry {
                    kind: entry.kind,
                    time: entry.time,
                    error: entry.error.clone(),
                })
                .collect(),
            version: status.deployment_info.map(|info| info.version),
            file_version: status.deployment_info.map(|info| info.file_version),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeStackResponse {
    pub id: u64,
    pub name: String,
    pub edge_groups: Vec<u64>,
    #[schema(value_type = String)]
    pub deployment_type: data_model::StackDeploymentType,
    pub entry_point: String,
    pub version: u32,
    pub stack_file_version: u32,
    pub rollback_to: Option<u32>,
    pub num_deployments: u32,
    pub scheduled_time: Option<String>,
    pub update_schedule_id: Option<u64>,
    pub status: BTreeMap<u64, EndpointStackStatus>,
    pub created_at: u64,
}

impl From<EdgeStack> for EdgeStackResponse {
    fn from(stack: EdgeStack) -> Self {
        Self {
            id: stack.id.get(),
            name: stack.name,
            edge_groups: stack.edge_groups.iter().map(|g| g.get()).collect(),
            deployment_type: stack.deployment_type,
            entry_point: stack.entry_point,
            version: stack.version,
            stack_file_version: stack.stack_file_version,
            rollback_to: stack.rollback_to,
            num_deployments: stack.num_deployments,
            scheduled_time: stack.scheduled_time,
            update_schedule_id: stack.update_schedule_id.map(|id| id.get()),
            status: stack
                .status
                .iter()
                .map(|(endpoint_id, status)| (endpoint_id.get(), status.into()))
                .collect(),
            created_at: stack.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeStackList {
    pub edge_stacks: Vec<EdgeStackResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateEdgeJob {
    pub name: String,
    pub cron_expression: String,
    #[serde(default)]
    pub recurring: bool,
    pub script: String,
    #[serde(default)]
    pub edge_groups: Vec<u64>,
    #[serde(default)]
    pub endpoints: Vec<u64>,
}

impl From<CreateEdgeJob> for state_store::requests::CreateEdgeJobRequest {
    fn from(body: CreateEdgeJob) -> Self {
        Self {
            name: body.name,
            cron_expression: body.cron_expression,
            recurring: body.recurring,
            script: body.script,
            edge_groups: id_set(&body.edge_groups),
            endpoints: id_set(&body.endpoints),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeJobTarget {
    #[schema(value_type = String)]
    pub logs_status: data_model::EdgeJobLogsStatus,
    pub collect_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeJobResponse {
    pub id: u64,
    pub name: String,
    pub cron_expression: String,
    pub script: String,
    pub recurring: bool,
    pub edge_groups: Vec<u64>,
    pub endpoints: BTreeMap<u64, EdgeJobTarget>,
    pub version: u32,
    pub created_at: u64,
}

impl From<EdgeJob> for EdgeJobResponse {
    fn from(job: EdgeJob) -> Self {
        Self {
            id: job.id.get(),
            name: job.name,
            cron_expression: job.cron_expression,
            script: job.script,
            recurring: job.recurring,
            edge_groups: job.edge_groups.iter().map(|g| g.get()).collect(),
            endpoints: job
                .endpoints
                .iter()
                .map(|(id, meta)| {
                    (
                        id.get(),
                        EdgeJobTarget {
                            logs_status: meta.logs_status,
                            collect_logs: meta.collect_logs,
                        },
                    )
                })
                .collect(),
            version: job.version,
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeJobList {
    pub edge_jobs: Vec<EdgeJobResponse>,
}

/// The `metadata` part of the configuration multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeConfigMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_dir: Option<String>,
    #[serde(default)]
    #[schema(value_type = String)]
    pub category: data_model::EdgeConfigCategory,
    pub edge_group_ids: Vec<u64>,
    #[serde(default)]
    pub user: String,
}

impl EdgeConfigMetadata {
    pub fn group_ids(&self) -> BTreeSet<data_model::EdgeGroupId> {
        id_set(&self.edge_group_ids)
    }
}

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct EdgeConfigUpload {
    pub metadata: EdgeConfigMetadata,
    #[schema(format = "binary")]
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeConfigProgressBody {
    pub success: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeConfigurationResponse {
    pub id: u64,
    pub name: String,
    pub base_dir: String,
    #[schema(value_type = String)]
    pub category: data_model::EdgeConfigCategory,
    pub edge_group_ids: Vec<u64>,
    #[schema(value_type = String)]
    pub state: EdgeConfigStateKind,
    pub progress: EdgeConfigProgressBody,
    pub version: u32,
    pub files: Vec<String>,
    pub created_at: u64,
    pub created_by: String,
    pub updated_at: Option<u64>,
    pub updated_by: Option<String>,
}

impl From<EdgeConfiguration> for EdgeConfigurationResponse {
    fn from(config: EdgeConfiguration) -> Self {
        Self {
            id: config.id.get(),
            name: config.name,
            base_dir: config.base_dir,
            category: config.category,
            edge_group_ids: config.edge_group_ids.iter().map(|g| g.get()).collect(),
            state: config.state,
            progress: EdgeConfigProgressBody {
                success: config.progress.success,
                total: config.progress.total,
            },
            version: config.version,
            files: config.files,
            created_at: config.created_at,
            created_by: config.created_by,
            updated_at: config.updated_at,
            updated_by: config.updated_by,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeConfigurationList {
    pub edge_configurations: Vec<EdgeConfigurationResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateScheduleBody {
    pub name: String,
    /// Agent version to roll out.
    pub version: String,
    #[serde(default)]
    #[schema(value_type = String)]
    pub schedule_type: data_model::UpdateScheduleType,
    pub edge_group_ids: Vec<u64>,
    #[serde(default)]
    pub scheduled_time: Option<String>,
    #[serde(default)]
    pub created_by: String,
}

impl UpdateScheduleBody {
    pub fn group_ids(&self) -> BTreeSet<data_model::EdgeGroupId> {
        id_set(&self.edge_group_ids)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams)]
pub struct ScheduleStatusParams {
    #[serde(default)]
    pub include_status: bool,
}

/// Deployment progress of an update schedule across its endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UpdateScheduleStatus {
    pub pending: u32,
    pub in_progress: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl UpdateScheduleStatus {
    pub fn from_stack(schedule: &UpdateSchedule, stack: Option<&EdgeStack>) -> Self {
        let mut status = Self::default();
        for endpoint_id in schedule.endpoints() {
            let endpoint_status = stack.and_then(|stack| stack.status.get(&endpoint_id));
            let Some(endpoint_status) = endpoint_status else {
                status.pending += 1;
                continue;
            };
            if endpoint_status.has(EdgeStackStatusKind::RemoteUpdateSuccess) {
                status.succeeded += 1;
                continue;
            }
            match endpoint_status.latest() {
                Some(EdgeStackStatusKind::Error) => status.failed += 1,
                None | Some(EdgeStackStatusKind::Pending) => status.pending += 1,
                Some(_) => status.in_progress += 1,
            }
        }
        status
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateScheduleResponse {
    pub id: u64,
    pub name: String,
    pub version: String,
    #[schema(value_type = String)]
    pub schedule_type: data_model::UpdateScheduleType,
    pub edge_group_ids: Vec<u64>,
    pub edge_stack_id: u64,
    pub scheduled_time: Option<String>,
    /// Agent version of each targeted endpoint before the rollout.
    pub previous_versions: BTreeMap<u64, String>,
    pub created_at: u64,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UpdateScheduleStatus>,
}

impl UpdateScheduleResponse {
    pub fn new(schedule: UpdateSchedule, status: Option<UpdateScheduleStatus>) -> Self {
        Self {
            id: schedule.id.get(),
            name: schedule.name,
            version: schedule.version,
            schedule_type: schedule.schedule_type,
            edge_group_ids: schedule.edge_group_ids.iter().map(|g| g.get()).collect(),
            edge_stack_id: schedule.edge_stack_id.get(),
            scheduled_time: schedule.scheduled_time,
            previous_versions: schedule
                .previous_versions
                .iter()
                .map(|(id, version)| (id.get(), version.clone()))
                .collect(),
            created_at: schedule.created_at,
            created_by: schedule.created_by,
            status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateScheduleList {
    pub update_schedules: Vec<UpdateScheduleResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreatedResponse {
    pub id: u64,
}
