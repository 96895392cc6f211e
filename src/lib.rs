//! # Volumetric diffusion models
//!
//! This library trains and samples denoising diffusion probabilistic models
//! on 3D image volumes using Torch via the [tch-rs](https://github.com/LaurentMazare/tch-rs) bindings.
//!
//! This library includes:
//! - DDPM and accelerated DDIM noise schedulers behind a common trait.
//! - An unconditional 3D UNet noise-prediction model with a ResNet backend.
//! - A patch-based volume dataset and a training loop with validation
//!   sampling, checkpointing and progress artifacts.
//!
//! The `train` and `sample` binaries provide the batch entry points.

pub mod data;
pub mod metrics;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod training;
pub mod utils;
