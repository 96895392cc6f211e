//! Maximum Mean Discrepancy between two batches of samples.
//!
//! Compares the distribution of generated volumes against a reference batch
//! with a linear kernel on flattened samples. Identical batches score
//! exactly zero.

use tch::{Kind, Tensor};

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("inputs must have identical shapes, got {y:?} and {y_pred:?}")]
    ShapeMismatch { y: Vec<i64>, y_pred: Vec<i64> },
}

type Transform = Box<dyn Fn(&Tensor) -> Tensor>;

/// The MMD metric, with optional per-batch transforms applied before the
/// comparison (an intensity window, a mask, a downsampling step).
#[derive(Default)]
pub struct Mmd {
    y_transform: Option<Transform>,
    y_pred_transform: Option<Transform>,
}

impl Mmd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_y_transform(mut self, transform: impl Fn(&Tensor) -> Tensor + 'static) -> Self {
        self.y_transform = Some(Box::new(transform));
        self
    }

    pub fn with_y_pred_transform(
        mut self,
        transform: impl Fn(&Tensor) -> Tensor + 'static,
    ) -> Self {
        self.y_pred_transform = Some(Box::new(transform));
        self
    }

    /// Computes the discrepancy between a reference batch `y` and a
    /// generated batch `y_pred`, both `[batch, ...]`.
    pub fn compute(&self, y: &Tensor, y_pred: &Tensor) -> Result<f64, MetricError> {
        let y = match &self.y_transform {
            Some(transform) => transform(y),
            None => y.shallow_clone(),
        };
        let y_pred = match &self.y_pred_transform {
            Some(transform) => transform(y_pred),
            None => y_pred.shallow_clone(),
        };
        if y.size() != y_pred.size() {
            return Err(MetricError::ShapeMismatch { y: y.size(), y_pred: y_pred.size() });
        }

        let batch = y.size()[0];
        let y = y.view((batch, -1)).to_kind(Kind::Double);
        let y_pred = y_pred.view((batch, -1)).to_kind(Kind::Double);

        let y_y = y.matmul(&y.transpose(0, 1));
        let y_pred_y_pred = y_pred.matmul(&y_pred.transpose(0, 1));
        let y_pred_y = y_pred.matmul(&y.transpose(0, 1));

        let mmd: Tensor = y_y.mean(Kind::Double) + y_pred_y_pred.mean(Kind::Double)
            - 2. * y_pred_y.mean(Kind::Double);
        Ok(mmd.double_value(&[]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind, Tensor};

    #[test]
    fn identical_batches_score_zero() {
        let y = Tensor::ones([3, 1, 8, 8, 8], (Kind::Float, Device::Cpu));
        let result = Mmd::new().compute(&y, &y).unwrap();
        assert!(result.abs() < 1e-8, "mmd of identical batches: {result}");
    }

    #[test]
    fn identical_random_batches_score_zero() {
        let y = Tensor::randn([4, 1, 4, 4, 4], (Kind::Float, Device::Cpu));
        let result = Mmd::new().compute(&y, &y.shallow_clone()).unwrap();
        assert!(result.abs() < 1e-8);
    }

    #[test]
    fn diverging_batches_score_positive() {
        let y = Tensor::zeros([4, 1, 4, 4, 4], (Kind::Float, Device::Cpu));
        let y_pred = Tensor::ones([4, 1, 4, 4, 4], (Kind::Float, Device::Cpu));
        let result = Mmd::new().compute(&y, &y_pred).unwrap();
        assert!(result > 0.);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let y = Tensor::ones([3, 1, 8, 8, 8], (Kind::Float, Device::Cpu));
        let y_pred = Tensor::ones([3, 1, 9, 9, 9], (Kind::Float, Device::Cpu));
        match Mmd::new().compute(&y, &y_pred) {
            Err(MetricError::ShapeMismatch { .. }) => (),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn transforms_apply_before_the_comparison() {
        let y = Tensor::ones([2, 1, 4, 4, 4], (Kind::Float, Device::Cpu));
        let y_pred = Tensor::ones([2, 1, 4, 4, 4], (Kind::Float, Device::Cpu)) * 2.0;
        let metric = Mmd::new().with_y_pred_transform(|t| t / 2.0);
        let result = metric.compute(&y, &y_pred).unwrap();
        assert!(result.abs() < 1e-8);
    }
}
