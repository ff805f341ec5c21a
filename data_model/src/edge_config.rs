use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

use derive_builder::Builder;
use edge_utils::get_epoch_time_in_ms;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::{EdgeConfigId, EdgeError, EdgeGroupId, EndpointId};

/// Lifecycle of a configuration, both per endpoint and in aggregate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EdgeConfigStateKind {
    Idle,
    Saving,
    Updating,
    Deleting,
    Failure,
}

impl EdgeConfigStateKind {
    pub fn allowed_transitions(self) -> &'static [EdgeConfigStateKind] {
        use EdgeConfigStateKind::*;
        match self {
            Idle => &[Saving, Updating, Deleting],
            Saving | Updating | Deleting => &[Idle, Failure],
            Failure => &[],
        }
    }

    pub fn can_transition_to(self, next: EdgeConfigStateKind) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn validate_transition(self, next: EdgeConfigStateKind) -> Result<(), EdgeError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(EdgeError::InvalidTransition {
            from: self,
            to: next,
        })
    }

    /// Numeric code used by agents that report states as integers.
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Failure => 1,
            Self::Saving => 2,
            Self::Deleting => 3,
            Self::Updating => 4,
        }
    }
}

impl FromStr for EdgeConfigStateKind {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.to_ascii_lowercase().as_str() {
            "idle" | "0" => Self::Idle,
            "failure" | "1" => Self::Failure,
            "saving" | "2" => Self::Saving,
            "deleting" | "3" => Self::Deleting,
            "updating" | "4" => Self::Updating,
            _ => {
                return Err(EdgeError::BadRequest(format!(
                    "unknown edge configuration state {:?}",
                    s
                )))
            }
        };
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "snake_case")]
pub enum EdgeConfigCategory {
    #[default]
    General,
    SpecificFile,
    SpecificFolder,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EdgeConfigProgress {
    pub success: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeConfigPrev {
    pub category: EdgeConfigCategory,
    pub edge_group_ids: BTreeSet<EdgeGroupId>,
}

/// What storage must do after an endpoint transition was folded into the
/// aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEffect {
    KeepEntry,
    DropEntry,
    DeleteConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct EdgeConfiguration {
    pub id: EdgeConfigId,
    pub name: String,
    #[builder(default)]
    pub base_dir: String,
    #[builder(default)]
    pub category: EdgeConfigCategory,
    #[builder(default)]
    pub edge_group_ids: BTreeSet<EdgeGroupId>,
    #[builder(default = "EdgeConfigStateKind::Saving")]
    pub state: EdgeConfigStateKind,
    #[builder(default)]
    pub progress: EdgeConfigProgress,
    #[builder(default = "get_epoch_time_in_ms()")]
    pub created_at: u64,
    #[builder(default)]
    pub created_by: String,
    #[builder(default)]
    pub updated_at: Option<u64>,
    #[builder(default)]
    pub updated_by: Option<String>,
    #[builder(default)]
    pub prev: Option<EdgeConfigPrev>,
    #[builder(default = "1")]
    pub version: u32,
    #[builder(default)]
    pub files: Vec<String>,
    /// Blob directory holding `files`.
    #[builder(default)]
    #[serde(default)]
    pub files_dir: Option<String>,
    /// Blob directory of the replaced version, served while endpoints update.
    #[builder(default)]
    #[serde(default)]
    pub prev_files_dir: Option<String>,
    /// Endpoints pending removal that had already been counted as a success.
    #[builder(default)]
    #[serde(default)]
    pub succeeded_removals: BTreeSet<EndpointId>,
}

impl EdgeConfiguration {
    pub fn key(&self) -> [u8; 8] {
        self.id.key()
    }

    pub fn file_key(dir: &str, path: &str) -> String {
        format!("{}/{}", dir, path)
    }

    pub fn version_prefix(id: EdgeConfigId, version: u32) -> String {
        format!("{}/v{}", Self::files_prefix(id), version)
    }

    /// Directory for one upload of `version`. `nonce` keeps concurrent
    /// uploads of the same version apart.
    pub fn upload_dir(id: EdgeConfigId, version: u32, nonce: &str) -> String {
        format!("{}-{}", Self::version_prefix(id, version), nonce)
    }

    /// Records written before upload directories existed keep their files
    /// under the plain version prefix.
    pub fn current_files_dir(&self) -> String {
        self.files_dir
            .clone()
            .unwrap_or_else(|| Self::version_prefix(self.id, self.version))
    }

    pub fn previous_files_dir(&self) -> Option<String> {
        self.prev_files_dir.clone().or_else(|| {
            (self.version > 1).then(|| Self::version_prefix(self.id, self.version - 1))
        })
    }

    pub fn files_prefix(id: EdgeConfigId) -> String {
        format!("edge_configs/{}", id)
    }

    fn settle(&mut self) {
        self.progress.success = self.progress.success.min(self.progress.total);
        if self.progress.success == self.progress.total {
            self.state = EdgeConfigStateKind::Idle;
        }
    }

    /// Folds one endpoint's transition from `previous` to `next` into the
    /// aggregate state and progress counters.
    pub fn apply_transition(
        &mut self,
        endpoint_id: EndpointId,
        previous: EdgeConfigStateKind,
        next: EdgeConfigStateKind,
    ) -> TransitionEffect {
        use EdgeConfigStateKind::*;

        if next == Failure {
            self.state = Failure;
            return TransitionEffect::KeepEntry;
        }
        if next != Idle {
            return TransitionEffect::KeepEntry;
        }

        if self.state == Deleting {
            self.progress.success += 1;
            if self.progress.success >= self.progress.total {
                return TransitionEffect::DeleteConfiguration;
            }
            return TransitionEffect::KeepEntry;
        }

        let mut effect = TransitionEffect::KeepEntry;
        match previous {
            Deleting => {
                self.progress.total = self.progress.total.saturating_sub(1);
                let had_succeeded = self.succeeded_removals.remove(&endpoint_id);
                if had_succeeded || self.state == Idle {
                    self.progress.success = self.progress.success.saturating_sub(1);
                }
                effect = TransitionEffect::DropEntry;
            }
            Saving | Updating => self.progress.success += 1,
            Idle | Failure => {}
        }
        self.settle();
        effect
    }

    /// A new endpoint joined one of the configuration's groups.
    pub fn endpoint_added(&mut self) {
        self.progress.total += 1;
        if self.state == EdgeConfigStateKind::Idle {
            self.state = EdgeConfigStateKind::Saving;
        }
    }

    /// An endpoint left the configuration's groups while in `current` state.
    /// Counters stay untouched until the endpoint acknowledges the removal.
    pub fn endpoint_removed(&mut self, endpoint_id: EndpointId, current: EdgeConfigStateKind) {
        if current == EdgeConfigStateKind::Idle {
            self.succeeded_removals.insert(endpoint_id);
        }
    }

    /// An endpoint whose removal was not acknowledged yet joined the
    /// configuration's groups again. It stays counted in `total` and has to
    /// acknowledge the new save.
    pub fn endpoint_readded(&mut self, endpoint_id: EndpointId) {
        if self.succeeded_removals.remove(&endpoint_id) {
            self.progress.success = self.progress.success.saturating_sub(1);
        }
        if self.state == EdgeConfigStateKind::Idle {
            self.state = EdgeConfigStateKind::Saving;
        }
    }

    /// An endpoint in `current` state was deleted and will never acknowledge.
    /// Returns true when a pending deletion of the configuration completed.
    pub fn endpoint_deleted(&mut self, endpoint_id: EndpointId, current: EdgeConfigStateKind) -> bool {
        let counted =
            self.succeeded_removals.remove(&endpoint_id) || current == EdgeConfigStateKind::Idle;
        self.progress.total = self.progress.total.saturating_sub(1);
        if counted {
            self.progress.success = self.progress.success.saturating_sub(1);
        }
        if self.state == EdgeConfigStateKind::Deleting {
            return self.progress.success >= self.progress.total;
        }
        self.settle();
        false
    }

    /// Resets counters for a new rollout over `total` endpoints.
    pub fn start_rollout(&mut self, state: EdgeConfigStateKind, total: u32) {
        self.progress = EdgeConfigProgress { success: 0, total };
        self.succeeded_removals.clear();
        self.state = if total == 0 {
            EdgeConfigStateKind::Idle
        } else {
            state
        };
    }
}

/// Per-endpoint states of every configuration targeting that endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EdgeConfigurationState {
    pub endpoint_id: EndpointId,
    pub states: BTreeMap<EdgeConfigId, EdgeConfigStateKind>,
}

impl EdgeConfigurationState {
    pub fn new(endpoint_id: EndpointId) -> Self {
        Self {
            endpoint_id,
            states: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> [u8; 8] {
        self.endpoint_id.key()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::test_objects::tests::mock_edge_configuration;

    #[test]
    fn test_files_dirs() {
        let mut config = mock_edge_configuration(1, &[1]);
        config.version = 2;
        assert_eq!(config.current_files_dir(), "edge_configs/1/v2");
        assert_eq!(config.previous_files_dir().as_deref(), Some("edge_configs/1/v1"));

        config.prev_files_dir = Some(config.current_files_dir());
        config.files_dir = Some(EdgeConfiguration::upload_dir(config.id, 3, "abc"));
        config.version = 3;
        assert_eq!(config.current_files_dir(), "edge_configs/1/v3-abc");
        assert_eq!(config.previous_files_dir().as_deref(), Some("edge_configs/1/v2"));
        assert_eq!(
            EdgeConfiguration::file_key(&config.current_files_dir(), "nginx/site.conf"),
            "edge_configs/1/v3-abc/nginx/site.conf"
        );
    }

    #[test]
    fn test_transition_table() {
        use EdgeConfigStateKind::*;

        assert!(Idle.can_transition_to(Saving));
        assert!(Idle.can_transition_to(Updating));
        assert!(Idle.can_transition_to(Deleting));
        assert!(!Idle.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Failure));

        for state in [Saving, Updating, Deleting] {
            assert!(state.can_transition_to(Idle));
            assert!(state.can_transition_to(Failure));
        }
        assert!(!Saving.can_transition_to(Updating));
        assert!(!Updating.can_transition_to(Saving));

        for next in EdgeConfigStateKind::iter() {
            assert!(!Failure.can_transition_to(next));
        }

        assert!(matches!(
            Saving.validate_transition(Updating),
            Err(EdgeError::InvalidTransition {
                from: Saving,
                to: Updating
            })
        ));
    }

    #[test]
    fn test_state_parsing() {
        for state in EdgeConfigStateKind::iter() {
            assert_eq!(state.to_string().parse::<EdgeConfigStateKind>().unwrap(), state);
            assert_eq!(
                state.code().to_string().parse::<EdgeConfigStateKind>().unwrap(),
                state
            );
        }
        assert!("IDLE".parse::<EdgeConfigStateKind>().is_ok());
        assert!("bogus".parse::<EdgeConfigStateKind>().is_err());
    }

    #[test]
    fn test_saving_rollout_reaches_idle() {
        use EdgeConfigStateKind::*;

        let mut config = mock_edge_configuration(1, &[1]);
        config.start_rollout(Saving, 2);
        assert_eq!(config.state, Saving);

        let effect = config.apply_transition(EndpointId::new(1), Saving, Idle);
        assert_eq!(effect, TransitionEffect::KeepEntry);
        assert_eq!(config.state, Saving);
        assert_eq!(config.progress, EdgeConfigProgress { success: 1, total: 2 });

        config.apply_transition(EndpointId::new(2), Saving, Idle);
        assert_eq!(config.state, Idle);
        assert_eq!(config.progress, EdgeConfigProgress { success: 2, total: 2 });
    }

    #[test]
    fn test_failure_marks_aggregate() {
        use EdgeConfigStateKind::*;

        let mut config = mock_edge_configuration(1, &[1]);
        config.start_rollout(Updating, 2);
        config.apply_transition(EndpointId::new(1), Updating, Failure);
        assert_eq!(config.state, Failure);
        assert_eq!(config.progress.success, 0);
    }

    #[test]
    fn test_removal_of_succeeded_endpoint_conserves_progress() {
        use EdgeConfigStateKind::*;

        let mut config = mock_edge_configuration(1, &[1]);
        config.start_rollout(Saving, 2);
        config.apply_transition(EndpointId::new(1), Saving, Idle);
        config.apply_transition(EndpointId::new(2), Saving, Idle);

        config.endpoint_removed(EndpointId::new(2), Idle);
        assert_eq!(config.progress, EdgeConfigProgress { success: 2, total: 2 });

        let effect = config.apply_transition(EndpointId::new(2), Deleting, Idle);
        assert_eq!(effect, TransitionEffect::DropEntry);
        assert_eq!(config.progress, EdgeConfigProgress { success: 1, total: 1 });
        assert_eq!(config.state, Idle);
    }

    #[test]
    fn test_removal_during_rollout_keeps_pending_work() {
        use EdgeConfigStateKind::*;

        let mut config = mock_edge_configuration(1, &[1]);
        config.start_rollout(Saving, 3);
        // Endpoint 1 succeeds, then leaves the group while 2 and 3 are saving.
        config.apply_transition(EndpointId::new(1), Saving, Idle);
        config.endpoint_removed(EndpointId::new(1), Idle);
        config.apply_transition(EndpointId::new(1), Deleting, Idle);
        assert_eq!(config.progress, EdgeConfigProgress { success: 0, total: 2 });
        assert_eq!(config.state, Saving);

        config.apply_transition(EndpointId::new(2), Saving, Idle);
        assert_eq!(config.state, Saving);
        config.apply_transition(EndpointId::new(3), Saving, Idle);
        assert_eq!(config.state, Idle);
    }

    #[test]
    fn test_added_endpoint_restarts_saving() {
        use EdgeConfigStateKind::*;

        let mut config = mock_edge_configuration(1, &[1]);
        config.start_rollout(Saving, 1);
        config.apply_transition(EndpointId::new(1), Saving, Idle);
        assert_eq!(config.state, Idle);

        config.endpoint_added();
        assert_eq!(config.state, Saving);
        assert_eq!(config.progress, EdgeConfigProgress { success: 1, total: 2 });
    }

    #[test]
    fn test_readded_endpoint_must_ack_again() {
        use EdgeConfigStateKind::*;

        let mut config = mock_edge_configuration(1, &[1]);
        config.start_rollout(Saving, 2);
        config.apply_transition(EndpointId::new(1), Saving, Idle);
        config.apply_transition(EndpointId::new(2), Saving, Idle);
        config.endpoint_removed(EndpointId::new(2), Idle);

        config.endpoint_readded(EndpointId::new(2));
        assert_eq!(config.state, Saving);
        assert_eq!(config.progress, EdgeConfigProgress { success: 1, total: 2 });

        config.apply_transition(EndpointId::new(2), Saving, Idle);
        assert_eq!(config.state, Idle);
    }

    #[test]
    fn test_deleted_endpoint_leaves_counters_consistent() {
        use EdgeConfigStateKind::*;

        let mut config = mock_edge_configuration(1, &[1]);
        config.start_rollout(Saving, 3);
        config.apply_transition(EndpointId::new(1), Saving, Idle);
        config.apply_transition(EndpointId::new(2), Saving, Idle);

        // The acknowledged endpoint goes away: both counters shrink.
        assert!(!config.endpoint_deleted(EndpointId::new(1), Idle));
        assert_eq!(config.progress, EdgeConfigProgress { success: 1, total: 2 });
        assert_eq!(config.state, Saving);

        // The last pending endpoint goes away: nothing is left to wait for.
        assert!(!config.endpoint_deleted(EndpointId::new(3), Saving));
        assert_eq!(config.progress, EdgeConfigProgress { success: 1, total: 1 });
        assert_eq!(config.state, Idle);

        config.start_rollout(Deleting, 1);
        assert!(config.endpoint_deleted(EndpointId::new(2), Deleting));
    }

    #[test]
    fn test_deleting_aggregate_deletes_when_done() {
        use EdgeConfigStateKind::*;

        let mut config = mock_edge_configuration(1, &[1]);
        config.start_rollout(Deleting, 2);
        assert_eq!(
            config.apply_transition(EndpointId::new(1), Deleting, Idle),
            TransitionEffect::KeepEntry
        );
        assert_eq!(
            config.apply_transition(EndpointId::new(2), Deleting, Idle),
            TransitionEffect::DeleteConfiguration
        );
    }

    #[test]
    fn test_empty_rollout_is_idle() {
        let mut config = mock_edge_configuration(1, &[1]);
        config.start_rollout(EdgeConfigStateKind::Updating, 0);
        assert_eq!(config.state, EdgeConfigStateKind::Idle);
    }

    /// Every interleaving of acknowledgements ends Idle exactly when all
    /// endpoints acknowledged.
    #[test]
    fn test_closure_over_ack_orders() {
        use EdgeConfigStateKind::*;

        let orders: [[u64; 3]; 6] = [
            [1, 2, 3],
            [1, 3, 2],
            [2, 1, 3],
            [2, 3, 1],
            [3, 1, 2],
            [3, 2, 1],
        ];
        for order in orders {
            let mut config = mock_edge_configuration(1, &[1]);
            config.start_rollout(Updating, 3);
            for (acked, endpoint) in order.iter().enumerate() {
                assert_ne!(config.state, Idle);
                config.apply_transition(EndpointId::new(*endpoint), Updating, Idle);
                let done = acked + 1 == order.len();
                assert_eq!(config.state == Idle, done);
                assert_eq!(
                    config.state == Idle,
                    config.progress.success == config.progress.total
                );
            }
        }
    }
}
