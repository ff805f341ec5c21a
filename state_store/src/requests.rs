use std::collections::{BTreeMap, BTreeSet};

use data_model::{
    AgentReport,
    EdgeAsyncCommand,
    EdgeConfigCategory,
    EdgeConfigId,
    EdgeConfigStateKind,
    EdgeGroupId,
    EdgeJobId,
    EdgeStackId,
    EdgeStackStatusKind,
    Endpoint,
    EndpointEdgeSettings,
    EndpointId,
    EndpointType,
    IntervalSetting,
    NewEdgeCommand,
    StackDeploymentType,
    TagId,
    UpdateScheduleId,
    UpdateScheduleType,
};

use crate::snapshots::SnapshotPayload;

#[derive(Debug)]
pub struct StateMachineUpdateRequest {
    pub payload: RequestPayload,
}

#[derive(Debug, strum::Display)]
pub enum RequestPayload {
    CreateEndpoint(CreateEndpointRequest),
    UpdateEndpoint(UpdateEndpointRequest),
    DeleteEndpoint(EndpointId),
    CreateEdgeGroup(EdgeGroupRequest),
    UpdateEdgeGroup((EdgeGroupId, EdgeGroupRequest)),
    DeleteEdgeGroup(EdgeGroupId),
    CreateEdgeStack(CreateEdgeStackRequest),
    UpdateEdgeStack(UpdateEdgeStackRequest),
    DeleteEdgeStack(EdgeStackId),
    UpdateEdgeStackStatus(StackStatusReport),
    CreateEdgeJob(CreateEdgeJobRequest),
    DeleteEdgeJob(EdgeJobId),
    RequestEdgeJobLogs(EdgeJobTaskRequest),
    EdgeJobLogsCollected(EdgeJobTaskRequest),
    CreateEdgeConfiguration(CreateEdgeConfigurationRequest),
    UpdateEdgeConfiguration(UpdateEdgeConfigurationRequest),
    DeleteEdgeConfiguration(EdgeConfigId),
    EdgeConfigurationTransition(EdgeConfigTransitionRequest),
    AppendEdgeCommand(AppendEdgeCommandRequest),
    AsyncCheckIn(Box<AsyncCheckInRequest>),
    StatusCheckIn(StatusCheckInRequest),
    CreateUpdateSchedule(UpdateScheduleRequest),
    UpdateUpdateSchedule(UpdateScheduleRequest),
    DeleteUpdateSchedule(UpdateScheduleId),
    MarkRemoteUpdateSuccess(RemoteUpdateSuccessRequest),
}

#[derive(Debug, Clone, Default)]
pub struct CreateEndpointRequest {
    pub name: String,
    pub endpoint_type: EndpointType,
    pub edge_id: Option<String>,
    pub edge: EndpointEdgeSettings,
    pub checkin_interval: IntervalSetting,
    pub local_time_zone: Option<String>,
    pub user_trusted: bool,
    pub tag_ids: BTreeSet<TagId>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateEndpointRequest {
    pub id: EndpointId,
    pub name: Option<String>,
    pub edge: Option<EndpointEdgeSettings>,
    pub checkin_interval: Option<IntervalSetting>,
    pub local_time_zone: Option<String>,
    pub user_trusted: Option<bool>,
    pub tag_ids: Option<BTreeSet<TagId>>,
}

#[derive(Debug, Clone, Default)]
pub struct EdgeGroupRequest {
    pub name: String,
    pub dynamic: bool,
    pub tag_ids: BTreeSet<TagId>,
    pub partial_match: bool,
    pub endpoints: BTreeSet<EndpointId>,
}

/// The id is allocated up front so the stack file can be stored before the
/// stack becomes visible to agents.
#[derive(Debug, Clone)]
pub struct CreateEdgeStackRequest {
    pub id: EdgeStackId,
    pub name: String,
    pub edge_groups: BTreeSet<EdgeGroupId>,
    pub deployment_type: StackDeploymentType,
    pub entry_point: String,
    pub scheduled_time: Option<String>,
    pub update_schedule_id: Option<UpdateScheduleId>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateEdgeStackRequest {
    pub id: EdgeStackId,
    pub edge_groups: Option<BTreeSet<EdgeGroupId>>,
    /// Set when new file content was stored under this file version.
    pub file_version: Option<u32>,
    /// Redeploy on every target even when the file did not change.
    pub redeploy: bool,
    pub rollback_to: Option<u32>,
    pub scheduled_time: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct StackStatusReport {
    pub stack_id: EdgeStackId,
    pub endpoint_id: EndpointId,
    pub status: EdgeStackStatusKind,
    pub error: Option<String>,
    /// Stack version the agent deployed, if it reports one.
    pub version: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CreateEdgeJobRequest {
    pub name: String,
    pub cron_expression: String,
    pub recurring: bool,
    pub script: String,
    pub edge_groups: BTreeSet<EdgeGroupId>,
    pub endpoints: BTreeSet<EndpointId>,
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeJobTaskRequest {
    pub job_id: EdgeJobId,
    pub endpoint_id: EndpointId,
}

#[derive(Debug, Clone)]
pub struct CreateEdgeConfigurationRequest {
    pub id: EdgeConfigId,
    pub name: String,
    pub base_dir: String,
    pub category: EdgeConfigCategory,
    pub edge_group_ids: BTreeSet<EdgeGroupId>,
    pub files: Vec<String>,
    /// Blob directory the files were uploaded to.
    pub files_dir: String,
    pub created_by: String,
}

#[derive(Debug, Clone)]
pub struct UpdateEdgeConfigurationRequest {
    pub id: EdgeConfigId,
    pub category: EdgeConfigCategory,
    pub edge_group_ids: BTreeSet<EdgeGroupId>,
    /// Version the new files were stored under. Must directly follow the
    /// stored version.
    pub version: u32,
    pub files: Vec<String>,
    pub files_dir: String,
    pub updated_by: String,
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeConfigTransitionRequest {
    pub config_id: EdgeConfigId,
    pub endpoint_id: EndpointId,
    pub state: EdgeConfigStateKind,
}

#[derive(Debug, Clone)]
pub struct AppendEdgeCommandRequest {
    pub endpoint_id: EndpointId,
    pub command: NewEdgeCommand,
}

/// Registration policy for agents that check in with an unknown edge id.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoCreatePolicy {
    pub enabled: bool,
    pub trust_on_first_connect: bool,
}

#[derive(Debug, Clone)]
pub struct AsyncCheckInRequest {
    pub edge_id: String,
    pub agent: AgentReport,
    pub auto_create: AutoCreatePolicy,
    /// Commands created at or before this time (epoch ms) are delivered.
    pub command_timestamp: Option<u64>,
    pub snapshot: Option<SnapshotPayload>,
    pub stack_statuses: Vec<StackStatusReport>,
    pub job_statuses: Vec<JobStatusReport>,
    pub edge_config_states: BTreeMap<EdgeConfigId, EdgeConfigStateKind>,
    pub full_snapshot_min_agent_version: Option<semver::Version>,
}

#[derive(Debug, Clone, Copy)]
pub struct JobStatusReport {
    pub job_id: EdgeJobId,
    pub logs_collected: bool,
}

#[derive(Debug, Clone)]
pub struct StatusCheckInRequest {
    pub endpoint_id: EndpointId,
    pub edge_id: String,
    pub agent: AgentReport,
}

#[derive(Debug, Clone)]
pub struct UpdateScheduleRequest {
    pub id: UpdateScheduleId,
    pub name: String,
    pub version: String,
    pub schedule_type: UpdateScheduleType,
    pub edge_group_ids: BTreeSet<EdgeGroupId>,
    pub scheduled_time: Option<String>,
    pub created_by: String,
    /// The generated stack that runs the updater on every target.
    pub edge_stack_id: EdgeStackId,
    /// Set when a new updater file was stored for an existing schedule.
    pub file_version: Option<u32>,
    /// Endpoints the caller holds in the schedule tracker. The write fails
    /// when the groups resolve to any endpoint outside this set.
    pub reserved_endpoints: BTreeSet<EndpointId>,
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteUpdateSuccessRequest {
    pub endpoint_id: EndpointId,
    pub schedule_id: UpdateScheduleId,
}

#[derive(Debug, Clone, Default)]
pub enum WriteOutcome {
    #[default]
    Done,
    Created(u64),
    Endpoint(Box<Endpoint>),
    AsyncCheckIn(Box<AsyncCheckInOutcome>),
    StatusCheckIn(Box<StatusCheckInOutcome>),
    StackStatus(StackStatusOutcome),
    UpdateSchedule(UpdateScheduleOutcome),
}

#[derive(Debug, Clone)]
pub struct AsyncCheckInOutcome {
    pub endpoint: Endpoint,
    pub created: bool,
    pub need_full_snapshot: bool,
    pub commands: Vec<EdgeAsyncCommand>,
    /// Update schedules whose stack reported Running on this endpoint.
    pub deployed_updates: Vec<UpdateScheduleId>,
}

#[derive(Debug, Clone)]
pub struct StatusCheckInOutcome {
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StackStatusOutcome {
    pub deployed_update: Option<UpdateScheduleId>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateScheduleOutcome {
    /// Endpoints targeted by the schedule after the write.
    pub endpoints: BTreeSet<EndpointId>,
}
