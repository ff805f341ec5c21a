use std::collections::{BTreeMap, BTreeSet};

use derive_builder::Builder;
use edge_utils::get_epoch_time_in_ms;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{EdgeGroupId, EdgeStackId, EndpointId, UpdateScheduleId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UpdateScheduleType {
    #[default]
    Update,
    Rollback,
}

/// An agent version rollout. Each targeted endpoint keeps the version it ran
/// before the rollout started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct UpdateSchedule {
    pub id: UpdateScheduleId,
    pub name: String,
    pub version: String,
    #[builder(default)]
    pub schedule_type: UpdateScheduleType,
    #[builder(default)]
    pub edge_group_ids: BTreeSet<EdgeGroupId>,
    pub edge_stack_id: EdgeStackId,
    #[builder(default)]
    pub previous_versions: BTreeMap<EndpointId, String>,
    #[builder(default)]
    pub scheduled_time: Option<String>,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
    #[builder(default)]
    pub created_by: String,
}

impl UpdateSchedule {
    pub fn key(&self) -> [u8; 8] {
        self.id.key()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = EndpointId> + '_ {
        self.previous_versions.keys().copied()
    }
}
