//! # Denoising Diffusion Probabilistic Models
//!
//! The full-length ancestral sampler from the original DDPM formulation.
//! Each reverse step estimates the clean volume from the model's noise
//! prediction, forms the posterior mean, and re-injects a small amount of
//! Gaussian noise everywhere but at the final step.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use super::{build_betas, BetaSchedule, DiffusionScheduler, PredictionType, SchedulerError};
use tch::{Kind, Tensor};

/// How the variance of the re-injected noise is fixed at each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DDPMVarianceType {
    /// The lower bound, beta scaled by the cumulative-product ratio.
    FixedSmall,
    /// The upper bound, beta itself.
    FixedLarge,
}

/// The configuration for the DDPM scheduler.
#[derive(Debug, Clone, Copy)]
pub struct DDPMSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// Clamp the predicted clean sample to [-1, 1] for numerical stability.
    pub clip_sample: bool,
    /// Variance of the noise added back at each reverse step.
    pub variance_type: DDPMVarianceType,
    /// The quantity the model predicts.
    pub prediction_type: PredictionType,
    /// Number of diffusion steps used to train the model.
    pub train_timesteps: usize,
}

impl Default for DDPMSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.0005,
            beta_end: 0.0195,
            beta_schedule: BetaSchedule::ScaledLinear,
            clip_sample: true,
            variance_type: DDPMVarianceType::FixedSmall,
            prediction_type: PredictionType::Epsilon,
            train_timesteps: 1000,
        }
    }
}

/// The DDPM scheduler.
#[derive(Debug, Clone)]
pub struct DDPMScheduler {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
    init_noise_sigma: f64,
    pub config: DDPMSchedulerConfig,
}

impl DDPMScheduler {
    /// Creates a new DDPM scheduler. `inference_steps` selects how many of
    /// the training timesteps the sampling loop visits; pass
    /// `config.train_timesteps` for the full-length chain.
    pub fn new(inference_steps: usize, config: DDPMSchedulerConfig) -> Result<Self, SchedulerError> {
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

        let alphas: Tensor = 1. - &betas;
        let alphas_cumprod = Vec::<f64>::try_from(alphas.cumprod(0, Kind::Double)).unwrap();
        let sqrt_alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1. - a).sqrt()).collect();

        let step_ratio = config.train_timesteps / inference_steps;
        let timesteps: Vec<usize> =
            (0..config.train_timesteps).step_by(step_ratio).rev().collect();

        Ok(Self {
            betas: Vec::<f64>::try_from(betas).unwrap(),
            alphas: Vec::<f64>::try_from(alphas).unwrap(),
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            timesteps,
            init_noise_sigma: 1.0,
            config,
        })
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    fn get_variance(&self, timestep: usize) -> f64 {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev =
            if timestep > 0 { self.alphas_cumprod[timestep - 1] } else { 1.0 };

        match self.config.variance_type {
            DDPMVarianceType::FixedSmall => {
                ((1. - alpha_prod_t_prev) / (1. - alpha_prod_t) * self.betas[timestep]).max(1e-20)
            }
            DDPMVarianceType::FixedLarge => self.betas[timestep],
        }
    }

    /// Forward diffusion with one timestep per batch element. `timesteps` is
    /// an int64 tensor of shape `[batch]` on the same device as the samples.
    pub fn add_noise_batch(
        &self,
        original: &Tensor,
        noise: &Tensor,
        timesteps: &Tensor,
    ) -> Tensor {
        let device = original.device();
        let mut broadcast_shape = vec![-1i64];
        broadcast_shape.extend(std::iter::repeat(1).take(original.dim() - 1));
        let sqrt_alpha_prod = Tensor::from_slice(&self.sqrt_alphas_cumprod)
            .to_kind(original.kind())
            .to_device(device)
            .index_select(0, timesteps)
            .view(broadcast_shape.as_slice());
        let sqrt_one_minus_alpha_prod = Tensor::from_slice(&self.sqrt_one_minus_alphas_cumprod)
            .to_kind(original.kind())
            .to_device(device)
            .index_select(0, timesteps)
            .view(broadcast_shape.as_slice());
        sqrt_alpha_prod * original + sqrt_one_minus_alpha_prod * noise
    }
}

impl DiffusionScheduler for DDPMScheduler {
    fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Tensor {
        self.sqrt_alphas_cumprod[timestep] * original
            + self.sqrt_one_minus_alphas_cumprod[timestep] * noise
    }

    fn step(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Tensor {
        // 1. compute alphas, betas
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev =
            if timestep > 0 { self.alphas_cumprod[timestep - 1] } else { 1.0 };
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;

        // 2. compute the predicted clean sample, "predicted x_0" of formula (15)
        let mut pred_original_sample = match self.config.prediction_type {
            PredictionType::Epsilon => {
                (sample - beta_prod_t.sqrt() * model_output) / alpha_prod_t.sqrt()
            }
            PredictionType::Sample => model_output.shallow_clone(),
        };

        // 3. clip predicted x_0
        if self.config.clip_sample {
            pred_original_sample = pred_original_sample.clamp(-1, 1);
        }

        // 4. coefficients for pred_original_sample x_0 and the current sample x_t (formula 7)
        let pred_original_sample_coeff =
            (alpha_prod_t_prev.sqrt() * self.betas[timestep]) / beta_prod_t;
        let current_sample_coeff = self.alphas[timestep].sqrt() * beta_prod_t_prev / beta_prod_t;

        // 5. predicted previous sample mean (formula 7)
        let pred_prev_sample =
            pred_original_sample_coeff * &pred_original_sample + current_sample_coeff * sample;

        // 6. add noise, except at the final step
        if timestep > 0 {
            let variance_noise = Tensor::randn_like(model_output);
            pred_prev_sample + self.get_variance(timestep).sqrt() * variance_noise
        } else {
            pred_prev_sample
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

    fn scheduler(config: DDPMSchedulerConfig) -> DDPMScheduler {
        DDPMScheduler::new(config.train_timesteps, config).unwrap()
    }

    #[test]
    fn alphas_complement_betas() {
        let s = scheduler(DDPMSchedulerConfig::default());
        for (alpha, beta) in s.alphas().iter().zip(s.betas().iter()) {
            assert!((alpha - (1. - beta)).abs() < 1e-6, "alpha={alpha} beta={beta}");
        }
    }

    #[test]
    fn cumprod_is_the_running_product_and_non_increasing() {
        let s = scheduler(DDPMSchedulerConfig::default());
        let mut product = 1.0;
        let mut previous = f64::INFINITY;
        for (alpha, cumprod) in s.alphas().iter().zip(s.alphas_cumprod().iter()) {
            product *= alpha;
            assert!((product - cumprod).abs() < 1e-9);
            assert!(*cumprod <= previous);
            previous = *cumprod;
        }
    }

    #[test]
    fn scaled_profile_matches_reference_values() {
        let s = scheduler(DDPMSchedulerConfig::default());
        // Linear in sqrt-space keeps the endpoints of the beta range exact.
        assert!((s.betas()[0] - 0.0005).abs() < 1e-6);
        assert!((s.betas()[999] - 0.0195).abs() < 1e-5);
        let last = s.alphas_cumprod()[999];
        assert!(last > 0. && last < 1e-3, "cumprod at the final step: {last}");
    }

    #[test]
    fn forward_diffusion_without_noise_scales_the_sample() {
        let s = scheduler(DDPMSchedulerConfig::default());
        let x0 = Tensor::ones([2, 1, 4, 4, 4], (Kind::Float, Device::Cpu));
        let noised = s.add_noise(&x0, Tensor::zeros_like(&x0), 500);
        let expected = s.alphas_cumprod()[500].sqrt();
        let max_err: f64 = (noised - expected).abs().max().double_value(&[]);
        assert!(max_err < 1e-5);
    }

    #[test]
    fn first_timestep_barely_perturbs_the_sample() {
        let config = DDPMSchedulerConfig {
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
            ..Default::default()
        };
        let s = scheduler(config);
        assert!(s.alphas_cumprod()[0] > 0.999);
        let x0 = Tensor::randn([2, 1, 4, 4, 4], (Kind::Float, Device::Cpu));
        let noised = s.add_noise(&x0, Tensor::zeros_like(&x0), 0);
        let max_err: f64 = (noised - &x0).abs().max().double_value(&[]);
        assert!(max_err < 1e-3);
    }

    #[test]
    fn batched_noising_matches_the_scalar_path() {
        let s = scheduler(DDPMSchedulerConfig::default());
        let x0 = Tensor::randn([2, 1, 3, 3, 3], (Kind::Float, Device::Cpu));
        let noise = Tensor::randn_like(&x0);
        let timesteps = Tensor::from_slice(&[3i64, 700]);
        let batched = s.add_noise_batch(&x0, &noise, &timesteps);
        for (row, t) in [3usize, 700].iter().enumerate() {
            let row = row as i64;
            let scalar = s.add_noise(&x0.get(row), noise.get(row), *t);
            let max_err: f64 = (batched.get(row) - scalar).abs().max().double_value(&[]);
            assert!(max_err < 1e-6);
        }
    }

    #[test]
    fn final_step_is_deterministic() {
        let s = scheduler(DDPMSchedulerConfig::default());
        let sample = Tensor::randn([1, 1, 4, 4, 4], (Kind::Float, Device::Cpu));
        let eps = Tensor::zeros_like(&sample);
        let a = s.step(&eps, 0, &sample);
        let b = s.step(&eps, 0, &sample);
        let max_err: f64 = (a - b).abs().max().double_value(&[]);
        assert_eq!(max_err, 0.);
    }
}
