//! Inference entry point: loads a training checkpoint and samples new
//! volumes with either the full DDPM chain or the accelerated DDIM sampler.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tch::{nn, Device, Kind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use volgen::models::unet_3d::UNet3DModel;
use volgen::pipelines::volume_ddpm;
use volgen::schedulers::ddim::DDIMScheduler;
use volgen::schedulers::ddpm::DDPMScheduler;
use volgen::utils::checkpoint::CheckpointMeta;
use volgen::utils::DeviceSetup;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SamplerKind {
    /// The full-length stochastic sampler used during training.
    Ddpm,
    /// The accelerated deterministic sampler.
    Ddim,
}

#[derive(Parser)]
#[command(author, version, about = "Sample volumes from a trained DDPM", long_about = None)]
struct Args {
    /// Checkpoint metadata written during training (the .json file next to
    /// the weights).
    #[arg(long, value_name = "FILE")]
    checkpoint: String,

    /// Which reverse sampler to run.
    #[arg(long, value_enum, default_value = "ddpm")]
    sampler: SamplerKind,

    /// The number of steps to run the diffusion for; defaults to the full
    /// training schedule.
    #[arg(long)]
    n_steps: Option<usize>,

    /// Noise level of the DDIM sampler, zero for deterministic sampling.
    #[arg(long, default_value_t = 0.)]
    eta: f64,

    /// Number of volumes to generate.
    #[arg(long, default_value_t = 1)]
    num_samples: usize,

    /// Directory receiving the generated volumes.
    #[arg(long, value_name = "DIR", default_value = "samples")]
    output_dir: PathBuf,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// Seed for the tch RNG.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
    let args = Args::parse();
    tch::manual_seed(args.seed as i64);

    let meta = CheckpointMeta::load(&args.checkpoint)?;
    let config = &meta.config;
    let device_setup = DeviceSetup::new(if args.cpu { vec!["all".to_string()] } else { vec![] });
    let device = device_setup.get("unet");

    let mut vs = nn::VarStore::new(device);
    let unet = UNet3DModel::new(vs.root(), 1, 1, config.model.unet_config()?);
    vs.load(&meta.weights)
        .with_context(|| format!("error loading weights from {:?}", meta.weights))?;
    info!("loaded weights from {:?} (epoch {})", meta.weights, meta.epoch);

    let train_timesteps = config.model.train_timesteps;
    let n_steps = args.n_steps.unwrap_or(train_timesteps);
    let [d, h, w] = config.data.patch_size;
    let shape = [args.num_samples as i64, 1, d, h, w];

    info!("sampling {} volumes with {:?} over {n_steps} steps", args.num_samples, args.sampler);
    let volumes = match args.sampler {
        SamplerKind::Ddpm => {
            let scheduler = DDPMScheduler::new(n_steps, config.model.ddpm_config()?)?;
            volume_ddpm::sample(&unet, &scheduler, &shape, device)
        }
        SamplerKind::Ddim => {
            let mut ddim_config = config.model.ddim_config()?;
            ddim_config.eta = args.eta;
            let scheduler = DDIMScheduler::new(n_steps, ddim_config)?;
            volume_ddpm::sample(&unet, &scheduler, &shape, device)
        }
    };

    std::fs::create_dir_all(&args.output_dir)?;
    for index in 0..args.num_samples as i64 {
        let volume = volumes.get(index).to_device(Device::Cpu);
        let stem = args.output_dir.join(format!("sample_{index:03}"));
        volume.write_npy(stem.with_extension("npy"))?;
        let mid_slice =
            (volume.select(1, d / 2).clamp(0., 1.) * 255.).to_kind(Kind::Uint8);
        tch::vision::image::save(&mid_slice, stem.with_extension("png"))?;
        info!("wrote {:?}", stem.with_extension("npy"));
    }
    Ok(())
}
