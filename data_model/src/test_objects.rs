pub mod tests {
    use crate::{
        EdgeConfigId,
        EdgeConfiguration,
        EdgeConfigurationBuilder,
        EdgeGroup,
        EdgeGroupBuilder,
        EdgeGroupId,
        Endpoint,
        EndpointBuilder,
        EndpointEdgeSettings,
        EndpointId,
        TagId,
    };

    pub const TEST_AGENT_VERSION: &str = "2.19.0";

    pub fn mock_endpoint(id: u64, edge_id: &str, async_mode: bool) -> Endpoint {
        EndpointBuilder::default()
            .id(EndpointId::new(id))
            .name(format!("endpoint-{}", id))
            .edge_id(Some(edge_id.to_string()))
            .edge(EndpointEdgeSettings {
                async_mode,
                ..Default::default()
            })
            .user_trusted(true)
            .build()
            .unwrap()
    }

    pub fn mock_static_group(id: u64, endpoints: &[u64]) -> EdgeGroup {
        EdgeGroupBuilder::default()
            .id(EdgeGroupId::new(id))
            .name(format!("group-{}", id))
            .endpoints(endpoints.iter().copied().map(EndpointId::new).collect())
            .build()
            .unwrap()
    }

    pub fn mock_dynamic_group(id: u64, tags: &[u64], partial_match: bool) -> EdgeGroup {
        EdgeGroupBuilder::default()
            .id(EdgeGroupId::new(id))
            .name(format!("dynamic-group-{}", id))
            .dynamic(true)
            .partial_match(partial_match)
            .tag_ids(tags.iter().copied().map(TagId::new).collect())
            .build()
            .unwrap()
    }

    pub fn mock_edge_configuration(id: u64, groups: &[u64]) -> EdgeConfiguration {
        EdgeConfigurationBuilder::default()
            .id(EdgeConfigId::new(id))
            .name(format!("config-{}", id))
            .base_dir("/etc/edge".to_string())
            .edge_group_ids(groups.iter().copied().map(EdgeGroupId::new).collect())
            .files(vec!["app.conf".to_string()])
            .build()
            .unwrap()
    }
}
