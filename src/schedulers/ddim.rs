//! # Denoising Diffusion Implicit Models
//!
//! The Denoising Diffusion Implicit Models (DDIM) scheduler generalizes the
//! Markovian DDPM reverse process to a non-Markovian one, which allows
//! sampling with a reduced subset of the training timesteps. With `eta = 0`
//! the accelerated reverse process is fully deterministic.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use super::{build_betas, BetaSchedule, DiffusionScheduler, PredictionType, SchedulerError};
use tch::{Kind, Tensor};

/// The configuration for the DDIM scheduler.
#[derive(Debug, Clone, Copy)]
pub struct DDIMSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// The amount of noise to be added at each step, zero for fully
    /// deterministic sampling.
    pub eta: f64,
    /// Adjust the indexes of the inference schedule by this value.
    pub steps_offset: usize,
    /// The quantity the model predicts.
    pub prediction_type: PredictionType,
    /// Number of diffusion steps used to train the model.
    pub train_timesteps: usize,
}

impl Default for DDIMSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.0005,
            beta_end: 0.0195,
            beta_schedule: BetaSchedule::ScaledLinear,
            eta: 0.,
            steps_offset: 0,
            prediction_type: PredictionType::Epsilon,
            train_timesteps: 1000,
        }
    }
}

/// The DDIM scheduler.
#[derive(Debug, Clone)]
pub struct DDIMScheduler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    step_ratio: usize,
    init_noise_sigma: f64,
    pub config: DDIMSchedulerConfig,
}

impl DDIMScheduler {
    /// Creates a new DDIM scheduler given the number of steps to be used for
    /// inference, a strictly decreasing subsequence of the timesteps the
    /// model was trained on.
    pub fn new(inference_steps: usize, config: DDIMSchedulerConfig) -> Result<Self, SchedulerError> {
        let betas = build_betas(
            config.beta_schedule,
            config.train_timesteps,
            config.beta_start,
            config.beta_end,
        )?;
        if inference_steps == 0 || inference_steps > config.train_timesteps {
            return Err(SchedulerError::InvalidInferenceSteps {
                inference: inference_steps,
                train: config.train_timesteps,
            });
        }

        let step_ratio = config.train_timesteps / inference_steps;
        let timesteps: Vec<usize> = (0..inference_steps)
            .map(|s| (s * step_ratio + config.steps_offset).min(config.train_timesteps - 1))
            .rev()
            .collect();

        let alphas: Tensor = 1.0 - betas;
        let alphas_cumprod = Vec::<f64>::try_from(alphas.cumprod(0, Kind::Double)).unwrap();
        let sqrt_alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1. - a).sqrt()).collect();
        Ok(Self {
            timesteps,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            step_ratio,
            init_noise_sigma: 1.,
            config,
        })
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }
}

impl DiffusionScheduler for DDIMScheduler {
    fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Tensor {
        self.sqrt_alphas_cumprod[timestep] * original
            + self.sqrt_one_minus_alphas_cumprod[timestep] * noise
    }

    /// Performs a backward step during inference.
    fn step(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Tensor {
        let prev_timestep = if timestep >= self.step_ratio { timestep - self.step_ratio } else { 0 };

        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev =
            if timestep >= self.step_ratio { self.alphas_cumprod[prev_timestep] } else { 1.0 };
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;

        let (pred_original_sample, pred_epsilon) = match self.config.prediction_type {
            PredictionType::Epsilon => {
                let pred_original_sample =
                    (sample - beta_prod_t.sqrt() * model_output) / alpha_prod_t.sqrt();
                (pred_original_sample, model_output.shallow_clone())
            }
            PredictionType::Sample => {
                let pred_original_sample = model_output.shallow_clone();
                let pred_epsilon =
                    (sample - alpha_prod_t.sqrt() * &pred_original_sample) / beta_prod_t.sqrt();
                (pred_original_sample, pred_epsilon)
            }
        };

        let variance = (beta_prod_t_prev / beta_prod_t) * (1. - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = self.config.eta * variance.sqrt();

        let pred_sample_direction =
            (1. - alpha_prod_t_prev - std_dev_t * std_dev_t).sqrt() * pred_epsilon;
        let prev_sample = alpha_prod_t_prev.sqrt() * pred_original_sample + pred_sample_direction;
        if self.config.eta > 0. {
            &prev_sample + Tensor::randn_like(&prev_sample) * std_dev_t
        } else {
            prev_sample
        }
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind, Tensor};

    #[test]
    fn accelerated_timesteps_are_a_strictly_decreasing_subsequence() {
        let s = DDIMScheduler::new(50, DDIMSchedulerConfig::default()).unwrap();
        let timesteps = s.timesteps();
        assert_eq!(timesteps.len(), 50);
        for pair in timesteps.windows(2) {
            assert!(pair[0] > pair[1], "timesteps not strictly decreasing: {pair:?}");
        }
        assert!(timesteps.iter().all(|t| *t < 1000));
    }

    #[test]
    fn full_length_schedule_visits_every_timestep() {
        let s = DDIMScheduler::new(1000, DDIMSchedulerConfig::default()).unwrap();
        assert_eq!(s.timesteps().len(), 1000);
        assert_eq!(s.timesteps()[0], 999);
        assert_eq!(*s.timesteps().last().unwrap(), 0);
    }

    #[test]
    fn zero_eta_steps_are_deterministic() {
        let s = DDIMScheduler::new(10, DDIMSchedulerConfig::default()).unwrap();
        let sample = Tensor::randn([1, 1, 4, 4, 4], (Kind::Float, Device::Cpu));
        let eps = Tensor::randn_like(&sample);
        let timestep = s.timesteps()[0];
        let a = s.step(&eps, timestep, &sample);
        let b = s.step(&eps, timestep, &sample);
        let max_err: f64 = (a - b).abs().max().double_value(&[]);
        assert_eq!(max_err, 0.);
    }

    #[test]
    fn too_many_inference_steps_are_rejected() {
        let config = DDIMSchedulerConfig { train_timesteps: 100, ..Default::default() };
        assert!(DDIMScheduler::new(101, config).is_err());
        assert!(DDIMScheduler::new(0, config).is_err());
    }
}
