use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Per-position cross entropy over `(batch, positions, classes)` scores.
///
/// Scores are flattened to `(batch * positions, classes)` and targets to
/// `(batch * positions,)` before the loss is averaged over every position.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, scores: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, positions, classes) = scores.dims3().map_err(|_| {
            TrainingError::runtime(format!(
                "cross entropy expects (batch, positions, classes) scores, got {:?}",
                scores.dims()
            ))
        })?;
        if classes == 0 {
            return Err(TrainingError::runtime(
                "class dimension must be greater than zero",
            ));
        }
        if targets.dims() != [batch, positions] {
            return Err(TrainingError::runtime(format!(
                "targets {:?} do not match scores {:?}",
                targets.dims(),
                scores.dims()
            )));
        }

        let count = batch * positions;
        if count == 0 {
            return Err(TrainingError::runtime(
                "no positions available for loss computation",
            ));
        }

        let device = scores.device();
        let flat_scores = scores.reshape((count, classes)).map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&flat_scores, D::Minus1).map_err(to_runtime_error)?;

        let flat_targets = targets
            .to_device(device)
            .and_then(|t| t.reshape((count,)))
            .map_err(to_runtime_error)?;
        let flat_targets = match flat_targets.dtype() {
            DType::U32 => flat_targets,
            DType::I64 | DType::U8 => flat_targets
                .to_dtype(DType::U32)
                .map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let loss = log_probs
            .gather(&flat_targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .and_then(|t| t.squeeze(1))
            .and_then(|t| t.mean_all())
            .and_then(|t| t.neg())
            .map_err(to_runtime_error)?;
        let average_loss = scalar(&loss)?;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics { average_loss },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar loss tensor, still attached to the graph.
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, Copy)]
pub struct LossMetrics {
    average_loss: f32,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }
}

fn scalar(tensor: &Tensor) -> Result<f32, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
