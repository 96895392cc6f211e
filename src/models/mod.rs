//! # Noise-prediction models
//!
//! The sampling and training loops only see models through the
//! [`NoisePredictor`] trait, so the network itself stays an opaque,
//! swappable component.

use tch::Tensor;

pub mod attention;
pub mod embeddings;
pub mod resnet;
pub mod unet_3d;
pub mod unet_3d_blocks;

/// A parametric function mapping a noisy sample and a timestep to the noise
/// it believes was injected.
pub trait NoisePredictor {
    fn predict_noise(&self, sample: &Tensor, timestep: usize) -> Tensor;
}
