use anyhow::Result;
use blob_store::BlobStorageConfig;
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, service::Service};

pub struct TestService {
    pub service: Service,
    _dir: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_config(ServerConfig::default()).await
    }

    /// Starts a service on a fresh state store and blob directory. Paths in
    /// `cfg` are replaced.
    pub async fn with_config(cfg: ServerConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let cfg = ServerConfig {
            state_store_path: temp_dir.path().join("state_store").display().to_string(),
            blob_storage: BlobStorageConfig {
                path: Some(format!(
                    "file://{}",
                    temp_dir.path().join("blob_store").display()
                )),
            },
            ..cfg
        };
        let srv = Service::new(cfg).await?;

        Ok(Self {
            service: srv,
            _dir: temp_dir,
        })
    }
}
