//! Mapping model attention back to canonical references and deriving IBD calls.
//!
//! `max_indices` produced by the model point into the per-batch shuffled reference panel.
//! `reference_idx[b, j]` is the canonical identity of shuffled entry `j` for sample `b`.

use candle_core::{DType, Tensor};
use serde::Serialize;

use crate::TrainingError;

/// Window value meaning "no IBD call".
pub const NO_IBD: i64 = -1;

/// `corrected[b, ...] = reference_idx[b, max_indices[b, ...]]`, for any trailing shape.
pub fn correct_max_indices(
    max_indices: &Tensor,
    reference_idx: &Tensor,
) -> Result<Tensor, TrainingError> {
    gather_per_sample(reference_idx, max_indices, "reference_idx")
}

/// Ancestry of the reference entry each window attended to, from the shuffled-space indices.
pub fn attended_labels(ref_labels: &Tensor, max_indices: &Tensor) -> Result<Tensor, TrainingError> {
    gather_per_sample(ref_labels, max_indices, "ref_labels")
}

/// Per-window IBD estimate, `(batch, windows)` i64.
///
/// The value is the canonical reference id when the predicted window ancestry agrees with
/// the ancestry of the attended reference, otherwise [`NO_IBD`].
pub fn compute_ibd(
    window_predictions: &Tensor,
    corrected_indices: &Tensor,
    attended_labels: &Tensor,
) -> Result<Tensor, TrainingError> {
    let dims = window_predictions.dims();
    if corrected_indices.dims() != dims || attended_labels.dims() != dims {
        return Err(TrainingError::runtime(format!(
            "IBD inputs disagree in shape: predictions {:?}, indices {:?}, labels {:?}",
            dims,
            corrected_indices.dims(),
            attended_labels.dims()
        )));
    }
    let predicted = window_predictions.to_dtype(DType::U32)?;
    let attended = attended_labels
        .to_device(predicted.device())?
        .to_dtype(DType::U32)?;
    let agrees = predicted.eq(&attended)?;
    let ids = corrected_indices
        .to_device(predicted.device())?
        .to_dtype(DType::I64)?;
    let none = Tensor::full(NO_IBD, ids.shape(), ids.device())?;
    Ok(agrees.where_cond(&ids, &none)?)
}

/// A run of consecutive windows attributed to one canonical reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IbdSegment {
    /// Row of the IBD tensor.
    pub sample: usize,
    pub reference: u32,
    pub start_window: usize,
    /// Exclusive.
    pub end_window: usize,
}

impl IbdSegment {
    pub fn len(&self) -> usize {
        self.end_window - self.start_window
    }

    pub fn is_empty(&self) -> bool {
        self.end_window == self.start_window
    }
}

/// Decodes maximal runs of equal non-negative values, dropping runs shorter than `min_windows`.
pub fn ibd_segments(ibd: &Tensor, min_windows: usize) -> Result<Vec<IbdSegment>, TrainingError> {
    let rows = ibd.to_dtype(DType::I64)?.to_vec2::<i64>()?;
    let mut segments = Vec::new();
    for (sample, row) in rows.iter().enumerate() {
        let mut start = 0;
        while start < row.len() {
            let value = row[start];
            let mut end = start + 1;
            while end < row.len() && row[end] == value {
                end += 1;
            }
            if value >= 0 && end - start >= min_windows.max(1) {
                segments.push(IbdSegment {
                    sample,
                    reference: value as u32,
                    start_window: start,
                    end_window: end,
                });
            }
            start = end;
        }
    }
    Ok(segments)
}

fn gather_per_sample(
    source: &Tensor,
    indices: &Tensor,
    source_name: &str,
) -> Result<Tensor, TrainingError> {
    let (batch, entries) = source.dims2().map_err(|_| {
        TrainingError::runtime(format!(
            "{source_name} must be (batch, refs), got {:?}",
            source.dims()
        ))
    })?;
    let shape = indices.dims().to_vec();
    if shape.first() != Some(&batch) {
        return Err(TrainingError::runtime(format!(
            "indices {:?} do not share the batch dimension of {source_name} {:?}",
            shape,
            source.dims()
        )));
    }
    let per_sample: usize = shape[1..].iter().product();
    if per_sample == 0 {
        return Ok(indices.to_dtype(source.dtype())?);
    }

    let flat = indices
        .to_device(source.device())?
        .to_dtype(DType::U32)?
        .reshape((batch, per_sample))?;
    let largest = flat.max_keepdim(1)?.max(0)?.to_vec1::<u32>()?;
    if let Some(&largest) = largest.first() {
        if largest as usize >= entries {
            return Err(TrainingError::runtime(format!(
                "index {largest} is out of range for {entries} {source_name} entries"
            )));
        }
    }

    Ok(source.gather(&flat.contiguous()?, 1)?.reshape(shape)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

    fn u32_tensor(values: Vec<u32>, shape: &[usize]) -> Tensor {
        Tensor::from_vec(values, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn realignment_matches_permutation_lookup() {
        let mut rng = StdRng::seed_from_u64(7);
        let (batch, refs, windows) = (3, 6, 9);

        let mut permutation = Vec::new();
        for _ in 0..batch {
            let mut row: Vec<u32> = (0..refs as u32).collect();
            row.shuffle(&mut rng);
            permutation.push(row);
        }
        let max_indices: Vec<u32> = (0..batch * windows)
            .map(|_| rng.gen_range(0..refs as u32))
            .collect();

        let corrected = correct_max_indices(
            &u32_tensor(max_indices.clone(), &[batch, windows]),
            &u32_tensor(permutation.concat(), &[batch, refs]),
        )
        .unwrap();
        assert_eq!(corrected.dims(), &[batch, windows]);

        let corrected = corrected.to_vec2::<u32>().unwrap();
        for b in 0..batch {
            for w in 0..windows {
                let attended = max_indices[b * windows + w] as usize;
                assert_eq!(corrected[b][w], permutation[b][attended]);
            }
        }
    }

    #[test]
    fn realignment_keeps_trailing_shape() {
        let max_indices = u32_tensor(vec![0, 1, 1, 0, 2, 2, 0, 1], &[2, 2, 2]);
        let reference_idx = u32_tensor(vec![5, 6, 7, 8, 9, 4], &[2, 3]);
        let corrected = correct_max_indices(&max_indices, &reference_idx).unwrap();
        assert_eq!(corrected.dims(), &[2, 2, 2]);
        assert_eq!(
            corrected.flatten_all().unwrap().to_vec1::<u32>().unwrap(),
            vec![5, 6, 6, 5, 4, 4, 8, 9]
        );
    }

    #[test]
    fn realignment_rejects_out_of_range_index() {
        let max_indices = u32_tensor(vec![0, 3], &[1, 2]);
        let reference_idx = u32_tensor(vec![2, 1, 0], &[1, 3]);
        assert!(correct_max_indices(&max_indices, &reference_idx).is_err());
    }

    #[test]
    fn ibd_requires_ancestry_agreement() {
        let predictions = u32_tensor(vec![0, 0, 1, 1], &[1, 4]);
        let corrected = u32_tensor(vec![7, 7, 3, 2], &[1, 4]);
        let attended = u32_tensor(vec![0, 1, 1, 1], &[1, 4]);
        let ibd = compute_ibd(&predictions, &corrected, &attended).unwrap();
        assert_eq!(ibd.dtype(), DType::I64);
        assert_eq!(ibd.to_vec2::<i64>().unwrap(), vec![vec![7, NO_IBD, 3, 2]]);
    }

    #[test]
    fn attended_labels_use_shuffled_positions() {
        let ref_labels = u32_tensor(vec![2, 0, 1], &[1, 3]);
        let max_indices = u32_tensor(vec![2, 0, 0], &[1, 3]);
        let labels = attended_labels(&ref_labels, &max_indices).unwrap();
        assert_eq!(labels.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 2]]);
    }

    #[test]
    fn segments_are_maximal_runs() {
        let ibd = Tensor::from_vec(
            vec![4i64, 4, 4, -1, 4, 2, 2, -1, -1, 9, 9, 9],
            (2, 6),
            &Device::Cpu,
        )
        .unwrap();
        let segments = ibd_segments(&ibd, 2).unwrap();
        assert_eq!(
            segments,
            vec![
                IbdSegment {
                    sample: 0,
                    reference: 4,
                    start_window: 0,
                    end_window: 3
                },
                IbdSegment {
                    sample: 1,
                    reference: 9,
                    start_window: 3,
                    end_window: 6
                },
            ]
        );
        assert_eq!(ibd_segments(&ibd, 1).unwrap().len(), 5);
    }
}
