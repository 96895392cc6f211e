//! Run configuration, persisted as JSON next to checkpoints so that a
//! trained network can always be rebuilt with the exact same shape.

use crate::models::unet_3d::{BlockConfig, UNet3DModelConfig};
use crate::schedulers::ddim::DDIMSchedulerConfig;
use crate::schedulers::ddpm::DDPMSchedulerConfig;
use crate::schedulers::BetaSchedule;
use crate::training::TrainingConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
}

/// Data configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory scanned for `*.npy` volumes, the data-dir default when
    /// neither this nor `index_csv` is given.
    pub volume_dir: Option<PathBuf>,
    /// CSV index with one volume path per row, the original spreadsheet
    /// driven layout.
    pub index_csv: Option<PathBuf>,
    /// Column of `index_csv` holding the volume paths.
    pub image_column: String,
    /// Patch cropped (or padded) out of each volume.
    pub patch_size: [i64; 3],
    pub batch_size: usize,
    /// Fraction of the volumes held out for validation.
    pub val_fraction: f64,
    /// Seed for shuffling and crop offsets.
    pub seed: u64,
}

/// Model and diffusion-process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Channel count per resolution level.
    pub channels: Vec<i64>,
    /// Self-attention toggle per resolution level.
    pub attention_levels: Vec<bool>,
    pub attention_head_dim: i64,
    pub layers_per_block: i64,
    pub norm_num_groups: i64,
    /// Number of diffusion steps used during training.
    pub train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    /// One of "linear", "scaled_linear" or "squaredcos_cap_v2".
    pub beta_schedule: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data: DataConfig {
                volume_dir: None,
                index_csv: None,
                image_column: "image".to_string(),
                patch_size: [32, 32, 32],
                batch_size: 8,
                val_fraction: 0.2,
                seed: 42,
            },
            model: ModelConfig {
                channels: vec![32, 64, 64],
                attention_levels: vec![false, false, true],
                attention_head_dim: 8,
                layers_per_block: 2,
                norm_num_groups: 32,
                train_timesteps: 1000,
                beta_start: 0.0005,
                beta_end: 0.0195,
                beta_schedule: "scaled_linear".to_string(),
            },
            training: TrainingConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load configuration from file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::Error::new(e)
                .context(format!("error reading {:?}", path.as_ref().to_string_lossy()))
        })?;
        let config: RunConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl ModelConfig {
    pub fn beta_schedule(&self) -> anyhow::Result<BetaSchedule> {
        match self.beta_schedule.as_str() {
            "linear" => Ok(BetaSchedule::Linear),
            "scaled_linear" => Ok(BetaSchedule::ScaledLinear),
            "squaredcos_cap_v2" => Ok(BetaSchedule::SquaredcosCapV2),
            other => anyhow::bail!("unknown beta schedule {other}"),
        }
    }

    pub fn unet_config(&self) -> anyhow::Result<UNet3DModelConfig> {
        if self.channels.is_empty() || self.channels.len() != self.attention_levels.len() {
            anyhow::bail!(
                "channels ({}) and attention_levels ({}) must be non-empty and of equal length",
                self.channels.len(),
                self.attention_levels.len()
            )
        }
        let blocks = self
            .channels
            .iter()
            .zip(self.attention_levels.iter())
            .map(|(out_channels, use_attn)| BlockConfig {
                out_channels: *out_channels,
                use_attn: *use_attn,
                attention_head_dim: self.attention_head_dim,
            })
            .collect();
        Ok(UNet3DModelConfig {
            blocks,
            layers_per_block: self.layers_per_block,
            norm_num_groups: self.norm_num_groups,
            norm_eps: 1e-5,
        })
    }

    pub fn ddpm_config(&self) -> anyhow::Result<DDPMSchedulerConfig> {
        Ok(DDPMSchedulerConfig {
            beta_start: self.beta_start,
            beta_end: self.beta_end,
            beta_schedule: self.beta_schedule()?,
            train_timesteps: self.train_timesteps,
            ..Default::default()
        })
    }

    pub fn ddim_config(&self) -> anyhow::Result<DDIMSchedulerConfig> {
        Ok(DDIMSchedulerConfig {
            beta_start: self.beta_start,
            beta_end: self.beta_end,
            beta_schedule: self.beta_schedule()?,
            train_timesteps: self.train_timesteps,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = RunConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model.channels, config.model.channels);
        assert_eq!(back.data.patch_size, config.data.patch_size);
        assert_eq!(back.training.epochs, config.training.epochs);
    }

    #[test]
    fn mismatched_attention_levels_are_rejected() {
        let mut config = RunConfig::default();
        config.model.attention_levels = vec![false];
        assert!(config.model.unet_config().is_err());
    }

    #[test]
    fn unknown_beta_schedule_is_rejected() {
        let mut config = RunConfig::default();
        config.model.beta_schedule = "quadratic".to_string();
        assert!(config.model.beta_schedule().is_err());
    }
}
