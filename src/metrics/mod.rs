//! # Evaluation metrics

mod mmd;

pub use mmd::{Mmd, MetricError};
