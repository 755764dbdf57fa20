use candle_core::{DType, Tensor, D};

use crate::TrainingError;

/// Running mean of scalar observations.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    sum: f64,
    count: u64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average(&self) -> Result<f64, TrainingError> {
        if self.count == 0 {
            return Err(TrainingError::EmptyAccumulator);
        }
        Ok(self.sum / self.count as f64)
    }
}

/// Sum over samples of the fraction of positions whose argmax class matches the label.
///
/// `scores` is `(batch, positions, classes)`, `labels` is `(batch, positions)`. Dividing the
/// accumulated sum by the number of samples seen gives the mean per-sample accuracy.
pub fn ancestry_accuracy(scores: &Tensor, labels: &Tensor) -> Result<f64, TrainingError> {
    let (batch, positions, _) = scores.dims3().map_err(|_| {
        TrainingError::runtime(format!(
            "accuracy expects (batch, positions, classes) scores, got {:?}",
            scores.dims()
        ))
    })?;
    if labels.dims() != [batch, positions] {
        return Err(TrainingError::runtime(format!(
            "labels {:?} do not match scores {:?}",
            labels.dims(),
            scores.dims()
        )));
    }
    if positions == 0 {
        return Err(TrainingError::runtime("cannot score samples without positions"));
    }

    let labels = labels
        .to_device(scores.device())
        .and_then(|t| t.to_dtype(DType::U32))?;
    let per_sample = scores
        .argmax(D::Minus1)?
        .eq(&labels)?
        .to_dtype(DType::F32)?
        .mean(1)?;
    let total = per_sample.sum_all()?.to_dtype(DType::F64)?.to_vec0::<f64>()?;
    Ok(total)
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    /// Mean per-sample position accuracy.
    pub accuracy: f64,
    pub average_loss: f64,
    pub samples: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn average_of_observations() {
        let mut meter = AverageMeter::new();
        for value in [1.0, 2.0, 6.0] {
            meter.update(value);
        }
        assert_eq!(meter.count(), 3);
        assert!((meter.average().unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn empty_average_is_an_error() {
        let mut meter = AverageMeter::new();
        assert!(matches!(meter.average(), Err(TrainingError::EmptyAccumulator)));

        meter.update(4.0);
        meter.reset();
        assert_eq!(meter.count(), 0);
        assert!(matches!(meter.average(), Err(TrainingError::EmptyAccumulator)));

        meter.update(5.0);
        assert_eq!(meter.average().unwrap(), 5.0);
    }

    #[test]
    fn accuracy_sums_per_sample_fractions() {
        // sample 0: argmax [0, 1] vs [0, 1] -> 1.0; sample 1: argmax [1, 1] vs [0, 1] -> 0.5
        let scores = Tensor::from_vec(
            vec![3.0f32, 1.0, 0.0, 2.0, 0.0, 5.0, 1.0, 4.0],
            (2, 2, 2),
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::from_vec(vec![0u32, 1, 0, 1], (2, 2), &Device::Cpu).unwrap();
        let accuracy = ancestry_accuracy(&scores, &labels).unwrap();
        assert!((accuracy - 1.5).abs() < 1e-6);
    }

    #[test]
    fn accuracy_rejects_misaligned_labels() {
        let scores = Tensor::zeros((2, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((2, 2), DType::U32, &Device::Cpu).unwrap();
        assert!(ancestry_accuracy(&scores, &labels).is_err());
    }
}
