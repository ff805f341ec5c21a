use std::{env, fmt::Debug, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use state_store::{driver::RocksDBConfig, StatusCacheConfig};

const LOCAL_ENV: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub state_store_path: String,
    pub rocksdb_config: RocksDBConfig,
    pub listen_addr: String,
    /// Forces JSON logs on or off. Defaults to JSON outside the local env.
    pub structured_logging: Option<bool>,
    pub blob_storage: BlobStorageConfig,
    pub telemetry: TelemetryConfig,
    pub status_cache: StatusCacheConfig,
    pub edge: EdgeSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            state_store_path: default_state_store_path(),
            rocksdb_config: Default::default(),
            listen_addr: "0.0.0.0:8900".to_string(),
            structured_logging: None,
            blob_storage: Default::default(),
            telemetry: Default::default(),
            status_cache: Default::default(),
            edge: Default::default(),
        }
    }
}

fn default_state_store_path() -> String {
    let base = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    base.join("edge_storage/state").display().to_string()
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        self.edge.validate()
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging.unwrap_or(self.env != LOCAL_ENV)
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, nanoid::nanoid!(12)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_metrics: bool,
    // Enable tracing through the OTLP span exporter.
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317 when empty.
    pub endpoint: Option<String>,
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
    // Used as the metric attribute "edge.instance.id".
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_tracing: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start)) + 1
    }
}

/// Instance-wide settings for the agent protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeSettings {
    /// Register unknown agents on their first async check-in.
    pub auto_create_endpoints: bool,
    /// Mark self-registered endpoints as trusted right away.
    pub trust_on_first_connect: bool,
    /// Agents older than this keep the stored snapshot while commands are
    /// pending instead of being asked for a full one.
    pub full_snapshot_min_agent_version: Option<String>,
    pub updater_image: String,
    pub checkin_interval_secs: u32,
    pub ping_interval_secs: u32,
    pub snapshot_interval_secs: u32,
    pub command_interval_secs: u32,
    pub tunnel_port_range: PortRange,
    pub tunnel_idle_timeout_secs: u64,
    /// Grace period between an updater stack reporting Running and the
    /// schedule being dropped for an endpoint that never confirmed.
    pub update_reconcile_delay_secs: u64,
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self {
            auto_create_endpoints: false,
            trust_on_first_connect: false,
            full_snapshot_min_agent_version: None,
            updater_image: "edge/agent-updater:latest".to_string(),
            checkin_interval_secs: 5,
            ping_interval_secs: 60,
            snapshot_interval_secs: 60,
            command_interval_secs: 60,
            tunnel_port_range: PortRange {
                start: 52000,
                end: 52999,
            },
            tunnel_idle_timeout_secs: 300,
            update_reconcile_delay_secs: 300,
        }
    }
}

impl EdgeSettings {
    pub fn validate(&self) -> Result<()> {
        if self.tunnel_port_range.start == 0 || self.tunnel_port_range.start > self.tunnel_port_range.end
        {
            return Err(anyhow!(
                "invalid tunnel port range: {}-{}",
                self.tunnel_port_range.start,
                self.tunnel_port_range.end
            ));
        }
        if let Some(version) = &self.full_snapshot_min_agent_version {
            semver::Version::parse(version)
                .map_err(|e| anyhow!("invalid full_snapshot_min_agent_version {}: {}", version, e))?;
        }
        if self.updater_image.is_empty() {
            return Err(anyhow!("updater_image must not be empty"));
        }
        Ok(())
    }

    pub fn full_snapshot_min_agent_version(&self) -> Option<semver::Version> {
        self.full_snapshot_min_agent_version
            .as_deref()
            .and_then(|v| semver::Version::parse(v).ok())
    }

    pub fn tunnel_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_idle_timeout_secs)
    }

    pub fn update_reconcile_delay(&self) -> Duration {
        Duration::from_secs(self.update_reconcile_delay_secs)
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ServerConfig;

    #[test]
    pub fn should_parse_sample_config() {
        let config_yaml = include_str!("../sample_config.yaml");
        let config = ServerConfig::from_yaml_str(config_yaml).expect("unable to parse from yaml");

        assert_eq!("local", config.env);
        assert!(!config.structured_logging());
        assert!(config.edge.auto_create_endpoints);
        assert_eq!(
            Some(semver::Version::new(2, 18, 0)),
            config.edge.full_snapshot_min_agent_version()
        );
        assert_eq!(100, config.edge.tunnel_port_range.len());
        assert_eq!(30, config.telemetry.metrics_interval.as_secs());
        // Omitted keys keep their defaults.
        assert_eq!(60, config.edge.ping_interval_secs);
    }

    #[test]
    pub fn should_reject_bad_settings() {
        let bad_addr = "listen_addr: nope\n";
        assert!(ServerConfig::from_yaml_str(bad_addr).is_err());

        let bad_version = "edge:\n  full_snapshot_min_agent_version: two\n";
        assert!(ServerConfig::from_yaml_str(bad_version).is_err());

        let bad_range = "edge:\n  tunnel_port_range:\n    start: 9000\n    end: 8000\n";
        assert!(ServerConfig::from_yaml_str(bad_range).is_err());
    }
}
