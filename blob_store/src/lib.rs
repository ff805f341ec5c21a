use std::{env, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::StreamExt;
use metrics::{blob_storage, Timer};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    parse_url,
    parse_url_opts,
    path::Path,
    ObjectStore,
    ObjectStoreScheme,
    PutPayload,
};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    pub path: Option<String>,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: Some(format!("file://{}", path)),
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let base = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let blob_store_path = format!("file://{}", base.join("edge_storage/blobs").display());
        info!("using blob store path: {}", blob_store_path);
        BlobStorageConfig {
            path: Some(blob_store_path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

/// Stack files, configuration archives and job logs, addressed by
/// slash-separated keys under the configured root.
#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    metrics: Arc<blob_storage::Metrics>,
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        let url = config
            .path
            .ok_or_else(|| anyhow!("blob storage path is not configured"))?;
        let (object_store, path) = Self::build_object_store(&url)?;
        Ok(Self {
            object_store: Arc::new(object_store),
            path,
            metrics: Arc::new(blob_storage::Metrics::new()),
        })
    }

    pub fn build_object_store(url_str: &str) -> Result<(Box<dyn ObjectStore>, Path)> {
        let url = &url_str.parse::<Url>()?;
        let (scheme, _) = ObjectStoreScheme::parse(url)?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // inject AWS environment variables to prioritize keys over instance metadata
                // credentials.
                let opts: Vec<(AmazonS3ConfigKey, String)> = std::env::vars_os()
                    .filter_map(|(os_key, os_value)| {
                        if let (Some(key), Some(value)) = (os_key.to_str(), os_value.to_str()) {
                            if key.starts_with("AWS_") {
                                if let Ok(config_key) = key.to_ascii_lowercase().parse() {
                                    return Some((config_key, String::from(value)));
                                }
                            }
                        }
                        None
                    })
                    .collect();

                let mut s3_builder = AmazonS3Builder::new().with_url(url_str);
                for (key, value) in opts.iter() {
                    s3_builder = s3_builder.with_config(*key, value.clone());
                }
                let store = s3_builder.build()?;
                let (_, path) = parse_url_opts(url, opts)?;
                Ok((Box::new(store), path))
            }
            _ => Ok(parse_url(url)?),
        }
    }

    fn location(&self, key: &str) -> Path {
        if self.path.as_ref().is_empty() {
            return Path::from(key);
        }
        Path::from(format!("{}/{}", self.path, key))
    }

    pub async fn put(&self, key: &str, data: Bytes) -> Result<PutResult> {
        let labels = &[KeyValue::new("op", "put")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);

        let hash = format!("{:x}", Sha256::digest(&data));
        let size_bytes = data.len() as u64;
        let location = self.location(key);
        self.object_store
            .put(&location, PutPayload::from(data))
            .await
            .map_err(|e| anyhow!("can't write blob {}: {}", key, e))?;
        debug!(key, size_bytes, "stored blob");
        Ok(PutResult {
            url: location.to_string(),
            size_bytes,
            sha256_hash: hash,
        })
    }

    /// Returns `None` when nothing is stored under `key`.
    pub async fn read_optional(&self, key: &str) -> Result<Option<Bytes>> {
        let labels = &[KeyValue::new("op", "get")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);

        match self.object_store.get(&self.location(key)).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(anyhow!("can't read blob {}: {}", key, e)),
        }
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        self.read_optional(key)
            .await?
            .ok_or_else(|| anyhow!("blob {} not found", key))
    }

    /// Keys under `prefix`, relative to it, in lexical order.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let labels = &[KeyValue::new("op", "list")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);

        let prefix_path = self.location(prefix);
        let mut listing = self.object_store.list(Some(&prefix_path));
        let mut keys = Vec::new();
        while let Some(meta) = listing.next().await {
            let location = meta?.location;
            if let Some(parts) = location.prefix_match(&prefix_path) {
                let relative = parts.map(|part| part.as_ref().to_string()).collect::<Vec<_>>();
                keys.push(relative.join("/"));
            };
        }
        keys.sort();
        Ok(keys)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let labels = &[KeyValue::new("op", "delete")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);

        match self.object_store.delete(&self.location(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(anyhow!("can't delete blob {}: {}", key, e)),
        }
    }

    /// Deletes every object under `prefix`.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let labels = &[KeyValue::new("op", "delete_prefix")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, labels);

        let prefix_path = self.location(prefix);
        let mut listing = self.object_store.list(Some(&prefix_path));
        let mut locations = Vec::new();
        while let Some(meta) = listing.next().await {
            locations.push(meta?.location);
        }
        for location in &locations {
            match self.object_store.delete(location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(anyhow!("can't delete blob {}: {}", location, e)),
            }
        }
        debug!(prefix, deleted = locations.len(), "deleted blobs");
        Ok(locations.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &tempfile::TempDir) -> Result<BlobStorage> {
        BlobStorage::new(BlobStorageConfig::new(
            dir.path()
                .to_str()
                .ok_or_else(|| anyhow!("non utf-8 temp dir"))?,
        ))
    }

    #[tokio::test]
    async fn test_put_and_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blobs = storage(&dir)?;

        let result = blobs
            .put("edge_stacks/1/v1/docker-compose.yml", Bytes::from_static(b"services: {}"))
            .await?;
        assert_eq!(result.size_bytes, 12);
        assert_eq!(result.sha256_hash.len(), 64);

        let bytes = blobs.read_bytes("edge_stacks/1/v1/docker-compose.yml").await?;
        assert_eq!(bytes.as_ref(), b"services: {}");
        assert!(blobs.read_optional("edge_stacks/2/v1/docker-compose.yml").await?.is_none());
        assert!(blobs.read_bytes("edge_stacks/2/v1/docker-compose.yml").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_prefix_keeps_siblings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blobs = storage(&dir)?;
        blobs.put("edge_configs/1/v1/a.conf", Bytes::from_static(b"a")).await?;
        blobs.put("edge_configs/1/v2/a.conf", Bytes::from_static(b"b")).await?;
        blobs.put("edge_configs/10/v1/a.conf", Bytes::from_static(b"c")).await?;

        assert_eq!(blobs.delete_prefix("edge_configs/1").await?, 2);
        assert!(blobs.read_optional("edge_configs/1/v1/a.conf").await?.is_none());
        assert!(blobs.read_optional("edge_configs/10/v1/a.conf").await?.is_some());
        assert_eq!(blobs.delete_prefix("edge_configs/1").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_keys_is_relative() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blobs = storage(&dir)?;
        blobs.put("edge_configs/2/v1/nginx/site.conf", Bytes::from_static(b"a")).await?;
        blobs.put("edge_configs/2/v1/app.env", Bytes::from_static(b"b")).await?;
        blobs.put("edge_configs/2/v2/app.env", Bytes::from_static(b"c")).await?;

        let keys = blobs.list_keys("edge_configs/2/v1").await?;
        assert_eq!(keys, vec!["app.env".to_string(), "nginx/site.conf".to_string()]);
        assert!(blobs.list_keys("edge_configs/3").await?.is_empty());
        Ok(())
    }
}
