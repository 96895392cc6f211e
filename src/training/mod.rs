//! # Training
//!
//! The denoising training loop: noise injection, noise prediction, MSE
//! loss, optimizer updates, periodic validation with sampling previews.

mod trainer;

pub use trainer::{Trainer, TrainingConfig};
