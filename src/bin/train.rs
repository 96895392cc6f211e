//! Batch training entry point: loads a volume dataset, trains the DDPM and
//! writes checkpoints plus sampling previews.

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use volgen::data::{VolumeDataset, VolumeLoader};
use volgen::training::Trainer;
use volgen::utils::config::RunConfig;
use volgen::utils::DeviceSetup;

#[derive(Parser)]
#[command(author, version, about = "Train a volumetric DDPM", long_about = None)]
struct Args {
    /// Path to a JSON run configuration, defaults are used when omitted.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Directory holding the training volumes as .npy files.
    #[arg(long, value_name = "DIR")]
    volume_dir: Option<String>,

    /// CSV index of volume paths, an alternative to --volume-dir.
    #[arg(long, value_name = "FILE")]
    index_csv: Option<String>,

    /// Number of epochs, overriding the configuration.
    #[arg(long)]
    epochs: Option<usize>,

    /// Directory receiving checkpoints and previews, overriding the
    /// configuration.
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<String>,

    /// Resume from previously saved weights.
    #[arg(long, value_name = "FILE")]
    resume: Option<String>,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// Seed for the tch RNG and the data pipeline, overriding the
    /// configuration.
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(volume_dir) = &args.volume_dir {
        config.data.volume_dir = Some(volume_dir.into());
    }
    if let Some(index_csv) = &args.index_csv {
        config.data.index_csv = Some(index_csv.into());
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(checkpoint_dir) = &args.checkpoint_dir {
        config.training.checkpoint_dir = checkpoint_dir.into();
    }
    if let Some(seed) = args.seed {
        config.data.seed = seed;
    }
    tch::manual_seed(config.data.seed as i64);

    let device_setup = DeviceSetup::new(if args.cpu { vec!["all".to_string()] } else { vec![] });
    let device = device_setup.get("unet");
    info!("training on {device:?}");

    let patch_size = config.data.patch_size;
    let dataset = match (&config.data.index_csv, &config.data.volume_dir) {
        (Some(index_csv), _) => {
            VolumeDataset::from_index(index_csv, &config.data.image_column, patch_size)?
        }
        (None, Some(volume_dir)) => VolumeDataset::from_dir(volume_dir, patch_size)?,
        (None, None) => {
            let data_dir = volgen::utils::data_dir();
            info!("no dataset given, using {data_dir:?}");
            VolumeDataset::from_dir(&data_dir, patch_size)?
        }
    };
    if dataset.len() < 2 {
        bail!("need at least two volumes to split off a validation set, got {}", dataset.len())
    }
    info!("loaded {} volumes, patch size {patch_size:?}", dataset.len());

    let (train_set, val_set) = dataset.split(config.data.val_fraction, config.data.seed);
    info!("{} training volumes, {} validation volumes", train_set.len(), val_set.len());
    let mut train_loader =
        VolumeLoader::new(train_set, config.data.batch_size, true, device, config.data.seed);
    let mut val_loader =
        VolumeLoader::new(val_set, config.data.batch_size, false, device, config.data.seed);
    info!("{} training batches per epoch", train_loader.num_batches());

    std::fs::create_dir_all(&config.training.checkpoint_dir)?;
    config.to_file(config.training.checkpoint_dir.join("run_config.json"))?;
    let mut trainer = Trainer::new(config, device)?;
    if let Some(resume) = &args.resume {
        info!("resuming from {resume}");
        trainer.load_weights(resume)?;
    }

    let losses = trainer.train(&mut train_loader, &mut val_loader)?;
    if let Some(final_loss) = losses.last() {
        info!("final epoch loss {final_loss:.6}");
    }
    Ok(())
}
