//! # Pipelines

pub mod volume_ddpm;
