use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use crate::{driver::RocksDBConfig, EdgeState};

pub struct TestStateStore {
    pub edge_state: Arc<EdgeState>,
    _dir: TempDir,
}

impl TestStateStore {
    pub async fn new() -> Result<TestStateStore> {
        let temp_dir = tempfile::tempdir()?;
        let edge_state = EdgeState::new(
            temp_dir.path().join("state"),
            RocksDBConfig::default(),
            Default::default(),
        )
        .await?;
        Ok(TestStateStore {
            edge_state,
            _dir: temp_dir,
        })
    }
}
