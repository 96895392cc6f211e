//! Training loop for the volumetric DDPM.

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::info;

use crate::data::VolumeLoader;
use crate::models::unet_3d::UNet3DModel;
use crate::pipelines::volume_ddpm;
use crate::schedulers::ddpm::DDPMScheduler;
use crate::utils::checkpoint::CheckpointMeta;
use crate::utils::config::RunConfig;

/// Training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs.
    pub epochs: usize,
    /// Learning rate for the Adam optimizer.
    pub learning_rate: f64,
    /// Gradient-norm clipping, none to leave gradients untouched.
    pub grad_clip: Option<f64>,
    /// Epochs between validation passes.
    pub val_interval: usize,
    /// Epochs between checkpoints.
    pub checkpoint_interval: usize,
    /// Directory receiving checkpoints and sampling previews.
    pub checkpoint_dir: PathBuf,
    /// Number of volumes sampled as a progress artifact after each
    /// validation pass, zero to disable.
    pub val_samples: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 75,
            learning_rate: 1e-4,
            grad_clip: None,
            val_interval: 5,
            checkpoint_interval: 25,
            checkpoint_dir: PathBuf::from("checkpoints"),
            val_samples: 1,
        }
    }
}

/// Trainer for the volumetric DDPM.
pub struct Trainer {
    vs: nn::VarStore,
    model: UNet3DModel,
    scheduler: DDPMScheduler,
    opt: nn::Optimizer,
    run_config: RunConfig,
    device: Device,
    best_loss: f64,
}

impl Trainer {
    /// Builds the network, the diffusion process and the optimizer from a
    /// run configuration.
    pub fn new(run_config: RunConfig, device: Device) -> Result<Self> {
        let vs = nn::VarStore::new(device);
        let model = UNet3DModel::new(vs.root(), 1, 1, run_config.model.unet_config()?);
        let scheduler =
            DDPMScheduler::new(run_config.model.train_timesteps, run_config.model.ddpm_config()?)?;
        let opt = nn::Adam::default()
            .build(&vs, run_config.training.learning_rate)
            .context("failed to create the optimizer")?;
        Ok(Self { vs, model, scheduler, opt, run_config, device, best_loss: f64::INFINITY })
    }

    /// Restores previously saved weights, e.g. to resume a run.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.vs.load(path.as_ref()).with_context(|| {
            format!("error loading weights from {:?}", path.as_ref().to_string_lossy())
        })
    }

    pub fn model(&self) -> &UNet3DModel {
        &self.model
    }

    pub fn scheduler(&self) -> &DDPMScheduler {
        &self.scheduler
    }

    /// One optimizer update on a `[B, 1, D, H, W]` batch, returning the
    /// batch loss.
    fn train_batch(&mut self, batch: &Tensor) -> f64 {
        let bsize = batch.size()[0];
        let train_timesteps = self.run_config.model.train_timesteps as i64;
        let timesteps = Tensor::randint(train_timesteps, [bsize], (Kind::Int64, self.device));
        let noise = Tensor::randn_like(batch);
        let noisy = self.scheduler.add_noise_batch(batch, &noise, &timesteps);
        let noise_pred = self.model.forward(&noisy, &timesteps);
        let loss = noise_pred.mse_loss(&noise, tch::Reduction::Mean);

        self.opt.zero_grad();
        loss.backward();
        if let Some(max_norm) = self.run_config.training.grad_clip {
            self.opt.clip_grad_norm(max_norm);
        }
        self.opt.step();
        loss.double_value(&[])
    }

    /// Train the model, returning the epoch-mean losses.
    pub fn train(
        &mut self,
        train_loader: &mut VolumeLoader,
        val_loader: &mut VolumeLoader,
    ) -> Result<Vec<f64>> {
        let config = self.run_config.training.clone();
        let mut losses = Vec::new();

        let pb = ProgressBar::new(config.epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );

        for epoch in 0..config.epochs {
            train_loader.reset();
            let mut epoch_losses = Vec::new();
            for batch in train_loader.by_ref() {
                let loss = self.train_batch(&batch);
                if !loss.is_finite() {
                    bail!("training loss became non-finite at epoch {epoch}, aborting the run")
                }
                epoch_losses.push(loss);
            }
            if epoch_losses.is_empty() {
                bail!("the training loader produced no batches")
            }
            let avg_loss = epoch_losses.iter().sum::<f64>() / epoch_losses.len() as f64;
            losses.push(avg_loss);
            if avg_loss < self.best_loss {
                self.best_loss = avg_loss;
            }

            if (epoch + 1) % config.val_interval == 0 {
                let val_loss = self.evaluate(val_loader)?;
                info!(
                    "epoch {:>4}/{} | loss {:.6} | val loss {:.6} | best {:.6}",
                    epoch + 1,
                    config.epochs,
                    avg_loss,
                    val_loss,
                    self.best_loss
                );
                if config.val_samples > 0 {
                    self.sample_previews(epoch + 1, config.val_samples)?;
                }
            }

            if (epoch + 1) % config.checkpoint_interval == 0 {
                self.save_checkpoint(epoch + 1, &losses, false)?;
            }

            pb.set_message(format!("loss: {avg_loss:.6}"));
            pb.inc(1);
        }
        pb.finish_with_message(format!("training complete, best loss {:.6}", self.best_loss));

        self.save_checkpoint(config.epochs, &losses, true)?;
        Ok(losses)
    }

    /// Validation loss: the training objective without parameter updates.
    pub fn evaluate(&self, loader: &mut VolumeLoader) -> Result<f64> {
        loader.reset();
        let mut total_loss = 0.;
        let mut num_batches = 0usize;
        for batch in loader.by_ref() {
            let loss = tch::no_grad(|| {
                let bsize = batch.size()[0];
                let train_timesteps = self.run_config.model.train_timesteps as i64;
                let timesteps =
                    Tensor::randint(train_timesteps, [bsize], (Kind::Int64, self.device));
                let noise = Tensor::randn_like(&batch);
                let noisy = self.scheduler.add_noise_batch(&batch, &noise, &timesteps);
                let noise_pred = self.model.forward(&noisy, &timesteps);
                noise_pred.mse_loss(&noise, tch::Reduction::Mean).double_value(&[])
            });
            if !loss.is_finite() {
                bail!("validation loss became non-finite")
            }
            total_loss += loss;
            num_batches += 1;
        }
        if num_batches == 0 {
            bail!("the validation loader produced no batches")
        }
        Ok(total_loss / num_batches as f64)
    }

    /// Runs the full reverse chain and stores the generated volumes as
    /// progress artifacts, one `.npy` volume and one mid-depth PNG slice
    /// per sample.
    fn sample_previews(&self, epoch: usize, count: usize) -> Result<()> {
        let samples_dir = self.run_config.training.checkpoint_dir.join("samples");
        std::fs::create_dir_all(&samples_dir)?;
        let [d, h, w] = self.run_config.data.patch_size;
        let volumes = volume_ddpm::sample(
            &self.model,
            &self.scheduler,
            &[count as i64, 1, d, h, w],
            self.device,
        );
        for index in 0..count as i64 {
            let volume = volumes.get(index).to_device(Device::Cpu);
            let stem = samples_dir.join(format!("epoch_{epoch:04}_{index}"));
            volume.write_npy(stem.with_extension("npy"))?;
            let mid_slice = (volume.select(1, d / 2).clamp(0., 1.) * 255.).to_kind(Kind::Uint8);
            tch::vision::image::save(&mid_slice, stem.with_extension("png"))?;
        }
        info!("wrote {count} sampling previews to {samples_dir:?}");
        Ok(())
    }

    fn save_checkpoint(&self, epoch: usize, losses: &[f64], final_checkpoint: bool) -> Result<()> {
        let dir = &self.run_config.training.checkpoint_dir;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("could not create checkpoint dir {dir:?}"))?;
        let stem = if final_checkpoint {
            dir.join("ddpm_final")
        } else {
            dir.join(format!("ddpm_epoch_{epoch:04}"))
        };
        let weights = stem.with_extension("ot");
        self.vs.save(&weights)?;
        let meta = CheckpointMeta {
            weights: weights.to_string_lossy().to_string(),
            epoch,
            best_loss: self.best_loss,
            config: self.run_config.clone(),
            losses: losses.to_vec(),
        };
        meta.save(stem.with_extension("json"))?;
        info!("saved checkpoint to {weights:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{VolumeDataset, VolumeLoader};

    fn tiny_run_config(dir: &Path) -> RunConfig {
        let mut config = RunConfig::default();
        config.data.patch_size = [8, 8, 8];
        config.data.batch_size = 2;
        config.model.channels = vec![8, 16];
        config.model.attention_levels = vec![false, true];
        config.model.attention_head_dim = 4;
        config.model.layers_per_block = 1;
        config.model.norm_num_groups = 4;
        config.model.train_timesteps = 10;
        config.training.epochs = 1;
        config.training.val_interval = 1;
        config.training.checkpoint_interval = 1;
        config.training.checkpoint_dir = dir.join("checkpoints");
        config.training.val_samples = 0;
        config
    }

    fn tiny_loaders(dir: &Path, config: &RunConfig) -> (VolumeLoader, VolumeLoader) {
        let volumes_dir = dir.join("volumes");
        std::fs::create_dir_all(&volumes_dir).unwrap();
        for i in 0..3 {
            let volume = Tensor::rand([8, 8, 8], tch::kind::FLOAT_CPU);
            volume.write_npy(volumes_dir.join(format!("v{i}.npy"))).unwrap();
        }
        let dataset = VolumeDataset::from_dir(&volumes_dir, config.data.patch_size).unwrap();
        let (train, val) = dataset.split(0.34, config.data.seed);
        let train = VolumeLoader::new(train, config.data.batch_size, true, Device::Cpu, 0);
        let val = VolumeLoader::new(val, config.data.batch_size, false, Device::Cpu, 0);
        (train, val)
    }

    #[test]
    fn one_epoch_smoke_train_produces_finite_losses_and_a_checkpoint() {
        tch::manual_seed(0);
        let dir = std::env::temp_dir().join(format!("volgen-trainer-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = tiny_run_config(&dir);
        let (mut train_loader, mut val_loader) = tiny_loaders(&dir, &config);
        let mut trainer = Trainer::new(config.clone(), Device::Cpu).unwrap();
        let losses = trainer.train(&mut train_loader, &mut val_loader).unwrap();
        assert_eq!(losses.len(), 1);
        assert!(losses[0].is_finite());
        assert!(config.training.checkpoint_dir.join("ddpm_final.ot").exists());
        let meta =
            CheckpointMeta::load(config.training.checkpoint_dir.join("ddpm_final.json")).unwrap();
        assert_eq!(meta.epoch, 1);
    }
}
