//! Checkpoint metadata, written as a JSON sidecar next to the saved
//! weights.

use super::config::RunConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Path of the weight file saved through the tch VarStore.
    pub weights: String,
    /// Epoch after which the checkpoint was taken.
    pub epoch: usize,
    /// Best epoch-mean training loss seen so far.
    pub best_loss: f64,
    /// Configuration the run was started with.
    pub config: RunConfig,
    /// Epoch-mean training losses up to the checkpoint.
    pub losses: Vec<f64>,
}

impl CheckpointMeta {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::Error::new(e)
                .context(format!("error reading {:?}", path.as_ref().to_string_lossy()))
        })?;
        let meta: CheckpointMeta = serde_json::from_str(&content)?;
        Ok(meta)
    }
}
