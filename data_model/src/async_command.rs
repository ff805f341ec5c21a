use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    EdgeCommandId,
    EdgeConfigCategory,
    EdgeConfigId,
    EdgeConfigStateKind,
    EdgeJobId,
    EdgeStackId,
    EndpointId,
    StackDeploymentType,
    UpdateScheduleId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandOperation {
    Add,
    Replace,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeStackCommandData {
    pub id: EdgeStackId,
    pub name: String,
    pub version: u32,
    pub file_version: u32,
    pub deployment_type: StackDeploymentType,
    #[serde(default)]
    pub rollback_to: Option<u32>,
    #[serde(default)]
    pub edge_update_id: Option<UpdateScheduleId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeJobCommandData {
    pub id: EdgeJobId,
    pub cron_expression: String,
    /// Base64 encoded script body.
    #[serde(default)]
    pub script_file_content: String,
    pub version: u32,
    pub collect_logs: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
pub enum ContainerOperation {
    Start,
    Stop,
    Restart,
    Kill,
    Pause,
    Unpause,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerCommandData {
    pub container_name: String,
    pub container_operation: ContainerOperation,
    #[serde(default)]
    pub force_remove: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageCommandData {
    pub image_name: String,
    #[serde(default)]
    pub force_remove: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeCommandData {
    pub volume_name: String,
    #[serde(default)]
    pub force_remove: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeConfigCommandData {
    pub id: EdgeConfigId,
    pub name: String,
    pub base_dir: String,
    pub category: EdgeConfigCategory,
    pub version: u32,
    pub state: EdgeConfigStateKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeLogCommandData {
    pub edge_job_id: EdgeJobId,
    #[serde(default)]
    pub tail: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalStackCommandData {
    pub name: String,
    #[serde(default)]
    pub stack_file_content: String,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub pull_image: bool,
}

/// The kind-specific part of a command. The `type` tag names the kind and
/// `value` carries the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Display)]
#[serde(tag = "type", content = "value")]
pub enum CommandPayload {
    EdgeStack(EdgeStackCommandData),
    EdgeJob(EdgeJobCommandData),
    Container(ContainerCommandData),
    Image(ImageCommandData),
    Volume(VolumeCommandData),
    EdgeConfig(EdgeConfigCommandData),
    EdgeLog(EdgeLogCommandData),
    NormalStack(NormalStackCommandData),
}

impl CommandPayload {
    /// Resource path the agent applies the command to.
    pub fn path(&self) -> String {
        match self {
            Self::EdgeStack(data) => format!("/edgestack/{}", data.id),
            Self::EdgeJob(data) => format!("/edgejob/{}", data.id),
            Self::Container(data) => format!("/container/{}", data.container_name),
            Self::Image(data) => format!("/image/{}", data.image_name),
            Self::Volume(data) => format!("/volume/{}", data.volume_name),
            Self::EdgeConfig(data) => format!("/edgeconfig/{}", data.id),
            Self::EdgeLog(data) => format!("/edgejob/{}/logs", data.edge_job_id),
            Self::NormalStack(data) => format!("/normalstack/{}", data.name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeAsyncCommand {
    pub id: EdgeCommandId,
    pub endpoint_id: EndpointId,
    pub payload: CommandPayload,
    pub operation: CommandOperation,
    pub path: String,
    /// Creation time in epoch milliseconds.
    pub timestamp: u64,
    #[serde(default)]
    pub scheduled_time: Option<String>,
    #[serde(default)]
    pub executed: bool,
}

impl EdgeAsyncCommand {
    pub fn key(&self) -> [u8; 16] {
        Self::key_from(self.endpoint_id, self.id)
    }

    /// `endpoint ‖ command`, so a prefix scan over one endpoint yields
    /// commands in creation order.
    pub fn key_from(endpoint_id: EndpointId, id: EdgeCommandId) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&endpoint_id.key());
        key[8..].copy_from_slice(&id.key());
        key
    }

    pub fn key_prefix(endpoint_id: EndpointId) -> [u8; 8] {
        endpoint_id.key()
    }
}

/// A command that has not been stamped and stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEdgeCommand {
    pub payload: CommandPayload,
    pub operation: CommandOperation,
    pub scheduled_time: Option<String>,
}

impl NewEdgeCommand {
    pub fn new(payload: CommandPayload, operation: CommandOperation) -> Self {
        Self {
            payload,
            operation,
            scheduled_time: None,
        }
    }

    pub fn scheduled(mut self, scheduled_time: Option<String>) -> Self {
        self.scheduled_time = scheduled_time;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_wire_format() {
        let payload = CommandPayload::Image(ImageCommandData {
            image_name: "nginx:latest".to_string(),
            force_remove: true,
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "Image");
        assert_eq!(value["value"]["image_name"], "nginx:latest");
        assert_eq!(payload.path(), "/image/nginx:latest");

        let decoded: CommandPayload = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_command_keys_group_by_endpoint() {
        let a = EdgeAsyncCommand::key_from(EndpointId::new(1), EdgeCommandId::new(300));
        let b = EdgeAsyncCommand::key_from(EndpointId::new(2), EdgeCommandId::new(1));
        assert!(a < b);
        assert!(a.starts_with(&EdgeAsyncCommand::key_prefix(EndpointId::new(1))));
    }
}
