use std::{collections::HashMap, path::Path};

use candle_core::{DType, Device, Tensor};
use lai_model::LaiModel;

use crate::{
    data::{BlockingDataLoader, DataLoader, REFERENCE_IDX, REF_LABELS, SAMPLE_IDX},
    postprocess::{attended_labels, compute_ibd, correct_max_indices},
    trainer::forward_batch,
    TrainingError,
};

/// Concatenated inference results, rows in loader order.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    /// Most likely ancestry per position, `(samples, positions)` u32.
    pub predictions: Tensor,
    /// Most likely ancestry per window after smoothing, `(samples, windows)` u32.
    pub predictions_window: Tensor,
    /// Canonical reference id per window or `NO_IBD`, `(samples, windows)` i64.
    pub ibd: Tensor,
    /// Dataset row of each output row, when the loader reports it.
    pub sample_idx: Option<Vec<usize>>,
}

impl InferenceOutput {
    pub fn samples(&self) -> usize {
        self.predictions.dims().first().copied().unwrap_or(0)
    }

    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        let mut tensors = HashMap::new();
        tensors.insert("predictions".to_string(), self.predictions.clone());
        tensors.insert(
            "predictions_window".to_string(),
            self.predictions_window.clone(),
        );
        tensors.insert("ibd".to_string(), self.ibd.clone());
        if let Some(indices) = self.sample_idx.as_ref() {
            let indices: Vec<i64> = indices.iter().map(|&idx| idx as i64).collect();
            let count = indices.len();
            tensors.insert(
                "sample_idx".to_string(),
                Tensor::from_vec(indices, count, &Device::Cpu)?,
            );
        }
        candle_core::safetensors::save(&tensors, path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write inference output {}: {err}",
                path.display()
            ))
        })
    }
}

/// Runs the model over every batch in eval mode; labels are not needed.
pub fn inference<M, L>(
    model: &M,
    loader: &mut BlockingDataLoader<L>,
    device: &Device,
) -> Result<InferenceOutput, TrainingError>
where
    M: LaiModel + ?Sized,
    L: DataLoader,
{
    let was_training = model.is_training();
    model.set_training(false);
    let result = run_inference(model, loader, device);
    model.set_training(was_training);
    result
}

fn run_inference<M, L>(
    model: &M,
    loader: &mut BlockingDataLoader<L>,
    device: &Device,
) -> Result<InferenceOutput, TrainingError>
where
    M: LaiModel + ?Sized,
    L: DataLoader,
{
    loader.start_epoch(0);

    let mut predictions = Vec::new();
    let mut predictions_window = Vec::new();
    let mut ibd = Vec::new();
    let mut sample_idx = Some(Vec::new());

    while let Some(batch) = loader.next_batch()? {
        let batch = batch.to_device(device)?;
        let output = forward_batch(model, &batch)?;

        let attended = attended_labels(batch.tensor(REF_LABELS)?, &output.max_indices)?;
        let corrected = correct_max_indices(&output.max_indices, batch.tensor(REFERENCE_IDX)?)?;
        let window_predictions = output.out_smoother.detach().argmax(1)?;
        let batch_ibd = compute_ibd(&window_predictions, &corrected, &attended)?;
        let position_predictions = output.predictions.detach().argmax(2)?;

        predictions.push(position_predictions.to_device(&Device::Cpu)?);
        predictions_window.push(window_predictions.to_device(&Device::Cpu)?);
        ibd.push(batch_ibd.to_device(&Device::Cpu)?);

        match (sample_idx.as_mut(), batch.indices(SAMPLE_IDX)) {
            (Some(all), Some(indices)) => all.extend_from_slice(indices),
            _ => sample_idx = None,
        }
    }

    if predictions.is_empty() {
        return Err(TrainingError::runtime("inference loader produced no batches"));
    }

    Ok(InferenceOutput {
        predictions: Tensor::cat(&predictions, 0)?.to_dtype(DType::U32)?,
        predictions_window: Tensor::cat(&predictions_window, 0)?.to_dtype(DType::U32)?,
        ibd: Tensor::cat(&ibd, 0)?,
        sample_idx,
    })
}
