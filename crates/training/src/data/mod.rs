use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use futures::future::BoxFuture;

use crate::TrainingError;

pub mod reference_panel;

pub use reference_panel::{ReferencePanelDataLoader, ReferencePanelDataset};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Query haplotypes, `(batch, positions)` f32.
pub const MIXED_VCF: &str = "mixed_vcf";
/// Per-position ancestry labels of the query, `(batch, positions)` u32.
pub const MIXED_LABELS: &str = "mixed_labels";
/// Shuffled reference haplotypes, `(batch, refs, positions)` f32.
pub const REF_PANEL: &str = "ref_panel";
/// Ancestry of each shuffled reference entry, `(batch, refs)` u32.
pub const REF_LABELS: &str = "ref_labels";
/// Canonical reference identity of each shuffled entry, `(batch, refs)` u32.
pub const REFERENCE_IDX: &str = "reference_idx";
/// Dataset row of each sample.
pub const SAMPLE_IDX: &str = "sample_idx";

#[derive(Debug, Clone)]
pub enum BatchValue {
    Tensor(Tensor),
    Indices(Vec<usize>),
}

impl BatchValue {
    fn leading_dim(&self) -> Result<usize> {
        match self {
            BatchValue::Tensor(tensor) => tensor.dims().first().copied().ok_or_else(|| {
                TrainingError::runtime("batch tensor fields must have a sample dimension")
            }),
            BatchValue::Indices(indices) => Ok(indices.len()),
        }
    }
}

/// Named fields of one batch; every field shares the leading sample dimension.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    fields: BTreeMap<String, BatchValue>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tensor(mut self, name: &str, tensor: Tensor) -> Self {
        self.insert(name, BatchValue::Tensor(tensor));
        self
    }

    pub fn with_indices(mut self, name: &str, indices: Vec<usize>) -> Self {
        self.insert(name, BatchValue::Indices(indices));
        self
    }

    pub fn insert(&mut self, name: &str, value: BatchValue) -> Option<BatchValue> {
        self.fields.insert(name.to_string(), value)
    }

    pub fn get(&self, name: &str) -> Option<&BatchValue> {
        self.fields.get(name)
    }

    pub fn tensor(&self, name: &str) -> Result<&Tensor> {
        match self.fields.get(name) {
            Some(BatchValue::Tensor(tensor)) => Ok(tensor),
            Some(_) => Err(TrainingError::runtime(format!(
                "batch field '{name}' is not a tensor"
            ))),
            None => Err(TrainingError::runtime(format!(
                "batch is missing required field '{name}'"
            ))),
        }
    }

    pub fn indices(&self, name: &str) -> Option<&[usize]> {
        match self.fields.get(name) {
            Some(BatchValue::Indices(indices)) => Some(indices),
            _ => None,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Shared leading dimension of every field.
    pub fn sample_count(&self) -> Result<usize> {
        let mut count = None;
        for (name, value) in &self.fields {
            let dim = value.leading_dim()?;
            match count {
                None => count = Some(dim),
                Some(expected) if expected != dim => {
                    return Err(TrainingError::runtime(format!(
                        "batch field '{name}' has {dim} samples, expected {expected}"
                    )))
                }
                Some(_) => {}
            }
        }
        count.ok_or_else(|| TrainingError::runtime("batch has no fields"))
    }

    /// Copy of the batch with every tensor on `device`; other fields are cloned as is.
    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        let mut fields = BTreeMap::new();
        for (name, value) in &self.fields {
            let moved = match value {
                BatchValue::Tensor(tensor) => {
                    BatchValue::Tensor(tensor.to_device(device).map_err(|err| {
                        TrainingError::runtime(format!(
                            "failed to move batch field '{name}' to device: {err}"
                        ))
                    })?)
                }
                other => other.clone(),
            };
            fields.insert(name.clone(), moved);
        }
        Ok(Batch { fields })
    }
}

/// Asynchronous-compatible loader abstraction.
///
/// A loader is iterated once per epoch; `start_epoch` rewinds it and fixes the
/// randomness of that epoch so resumed runs see the same batches.
pub trait DataLoader: Send {
    fn start_epoch(&mut self, epoch: usize);

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>>;

    /// Number of samples produced per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn start_epoch(&mut self, epoch: usize) {
        self.inner.start_epoch(epoch);
    }

    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn sample_batch() -> Batch {
        Batch::new()
            .with_tensor(
                MIXED_VCF,
                Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap(),
            )
            .with_tensor(
                REFERENCE_IDX,
                Tensor::from_vec(vec![1u32, 0, 0, 1], (2, 2), &Device::Cpu).unwrap(),
            )
            .with_indices(SAMPLE_IDX, vec![5, 9])
    }

    #[test]
    fn relocation_copies_every_field() {
        let batch = sample_batch();
        let moved = batch.to_device(&Device::Cpu).unwrap();

        assert_eq!(
            moved.field_names().collect::<Vec<_>>(),
            batch.field_names().collect::<Vec<_>>()
        );
        assert_eq!(moved.indices(SAMPLE_IDX), Some(&[5usize, 9][..]));
        assert_eq!(
            moved.tensor(REFERENCE_IDX).unwrap().to_vec2::<u32>().unwrap(),
            vec![vec![1, 0], vec![0, 1]]
        );
        assert!(moved.tensor(MIXED_VCF).unwrap().device().is_cpu());
    }

    #[test]
    fn relocation_leaves_source_usable() {
        let batch = sample_batch();
        let mut moved = batch.to_device(&Device::Cpu).unwrap();
        moved.insert(SAMPLE_IDX, BatchValue::Indices(vec![0, 0]));

        assert_eq!(batch.indices(SAMPLE_IDX), Some(&[5usize, 9][..]));
    }

    #[test]
    fn sample_count_checks_leading_dimension() {
        let batch = sample_batch();
        assert_eq!(batch.sample_count().unwrap(), 2);

        let broken = batch.with_indices(SAMPLE_IDX, vec![1, 2, 3]);
        assert!(broken.sample_count().is_err());
    }

    #[test]
    fn missing_field_is_reported() {
        let batch = sample_batch();
        assert!(batch.tensor(REF_PANEL).is_err());
        assert!(batch.tensor(SAMPLE_IDX).is_err());
    }
}
