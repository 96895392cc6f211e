//! # Noise schedulers
//!
//! A noise scheduler owns the per-timestep beta/alpha coefficient tables of
//! the diffusion process. The forward direction mixes a clean volume with
//! Gaussian noise at a given timestep, the reverse direction turns a model's
//! noise prediction into the previous, less noisy sample. Schedulers can be
//! used to set the trade-off between sampling speed and quality.

use tch::{kind, Tensor};

pub mod ddim;
pub mod ddpm;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

/// The quantity the denoising model is trained to predict.
#[derive(Debug, Clone, Copy)]
pub enum PredictionType {
    /// The injected noise.
    Epsilon,
    /// The clean sample itself.
    Sample,
}

/// Errors raised when a scheduler configuration is rejected.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("the number of train timesteps must be positive")]
    NoTrainTimesteps,
    #[error("inference steps ({inference}) must be positive and not exceed train timesteps ({train})")]
    InvalidInferenceSteps { inference: usize, train: usize },
    #[error("beta bounds must be positive and increasing, got start={start} end={end}")]
    InvalidBetaRange { start: f64, end: f64 },
}

/// A single reverse-process capability shared by all scheduler variants:
/// given the current sample, the timestep, and the model's noise prediction,
/// produce the next (less noisy) sample.
pub trait DiffusionScheduler {
    /// The timesteps iterated during sampling, in decreasing order.
    fn timesteps(&self) -> &[usize];

    /// Forward diffusion: mix a clean sample with noise at `timestep`.
    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Tensor;

    /// One reverse step from `timestep` towards the clean sample.
    fn step(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Tensor;

    /// Scale of the initial noise the sampling loop starts from.
    fn init_noise_sigma(&self) -> f64;
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Tensor {
    let alpha_bar = |time_step: f64| {
        f64::cos((time_step + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2)
    };
    let mut betas = Vec::with_capacity(num_diffusion_timesteps);
    for i in 0..num_diffusion_timesteps {
        let t1 = i as f64 / num_diffusion_timesteps as f64;
        let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
        betas.push((1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta));
    }

    Tensor::from_slice(&betas)
}

/// Build the per-timestep beta table for a profile, rejecting degenerate
/// configurations up front.
pub(crate) fn build_betas(
    beta_schedule: BetaSchedule,
    train_timesteps: usize,
    beta_start: f64,
    beta_end: f64,
) -> Result<Tensor, SchedulerError> {
    if train_timesteps == 0 {
        return Err(SchedulerError::NoTrainTimesteps);
    }
    if beta_start <= 0. || beta_end <= 0. || beta_start >= beta_end {
        return Err(SchedulerError::InvalidBetaRange { start: beta_start, end: beta_end });
    }
    let betas = match beta_schedule {
        BetaSchedule::ScaledLinear => Tensor::linspace(
            beta_start.sqrt(),
            beta_end.sqrt(),
            train_timesteps as i64,
            kind::FLOAT_CPU,
        )
        .square(),
        BetaSchedule::Linear => {
            Tensor::linspace(beta_start, beta_end, train_timesteps as i64, kind::FLOAT_CPU)
        }
        BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(train_timesteps, 0.999),
    };
    Ok(betas)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timesteps_are_rejected() {
        match build_betas(BetaSchedule::Linear, 0, 0.0001, 0.02) {
            Err(SchedulerError::NoTrainTimesteps) => (),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn non_positive_bounds_are_rejected() {
        assert!(build_betas(BetaSchedule::Linear, 10, 0., 0.02).is_err());
        assert!(build_betas(BetaSchedule::Linear, 10, -0.001, 0.02).is_err());
        assert!(build_betas(BetaSchedule::ScaledLinear, 10, 0.0001, -0.02).is_err());
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        match build_betas(BetaSchedule::Linear, 10, 0.02, 0.0001) {
            Err(SchedulerError::InvalidBetaRange { start, end }) => {
                assert_eq!(start, 0.02);
                assert_eq!(end, 0.0001);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn cosine_betas_stay_below_cap() {
        let betas = Vec::<f64>::try_from(betas_for_alpha_bar(50, 0.999)).unwrap();
        assert_eq!(betas.len(), 50);
        assert!(betas.iter().all(|b| *b > 0. && *b <= 0.999));
    }
}
