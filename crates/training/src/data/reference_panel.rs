use std::{collections::BTreeMap, path::Path, sync::Arc};

use candle_core::{DType, Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{
    Batch, DataLoader, Result, MIXED_LABELS, MIXED_VCF, REFERENCE_IDX, REF_LABELS, REF_PANEL,
    SAMPLE_IDX,
};
use crate::{config::DataConfig, TrainingError};

const SNPS_KEY: &str = "snps";
const LABELS_KEY: &str = "labels";

/// Query samples plus the labeled reference panel they are compared against.
///
/// Haplotypes are stored row-major as f32 (`+1` / `-1` allele encoding is typical);
/// labels are ancestry class ids.
#[derive(Debug)]
pub struct ReferencePanelDataset {
    seq_len: usize,
    n_samples: usize,
    mixed_snps: Vec<f32>,
    mixed_labels: Option<Vec<u32>>,
    reference_snps: Vec<f32>,
    reference_labels: Vec<u32>,
    references_by_class: BTreeMap<u32, Vec<usize>>,
}

impl ReferencePanelDataset {
    pub fn new(
        seq_len: usize,
        mixed_snps: Vec<f32>,
        mixed_labels: Option<Vec<u32>>,
        reference_snps: Vec<f32>,
        reference_labels: Vec<u32>,
    ) -> Result<Self> {
        if seq_len == 0 {
            return Err(TrainingError::initialization(
                "dataset sequence length must be greater than zero",
            ));
        }
        if mixed_snps.len() % seq_len != 0 {
            return Err(TrainingError::initialization(format!(
                "mixed haplotypes ({} values) are not a multiple of seq_len {}",
                mixed_snps.len(),
                seq_len
            )));
        }
        if let Some(labels) = mixed_labels.as_ref() {
            if labels.len() != mixed_snps.len() {
                return Err(TrainingError::initialization(
                    "mixed labels must have one entry per haplotype position",
                ));
            }
        }
        if reference_labels.is_empty() {
            return Err(TrainingError::initialization(
                "reference panel must contain at least one haplotype",
            ));
        }
        if reference_snps.len() != reference_labels.len() * seq_len {
            return Err(TrainingError::initialization(format!(
                "reference panel has {} values, expected {} haplotypes of {} positions",
                reference_snps.len(),
                reference_labels.len(),
                seq_len
            )));
        }

        let mut references_by_class: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (idx, label) in reference_labels.iter().enumerate() {
            references_by_class.entry(*label).or_default().push(idx);
        }

        Ok(Self {
            seq_len,
            n_samples: mixed_snps.len() / seq_len,
            mixed_snps,
            mixed_labels,
            reference_snps,
            reference_labels,
            references_by_class,
        })
    }

    /// Loads `snps (N, L)` / `labels (N, L)` and `snps (R, L)` / `labels (R)` tensors.
    ///
    /// The mixed file may omit `labels` when it is only used for inference.
    pub fn from_safetensors(mixed_path: &Path, reference_path: &Path) -> Result<Self> {
        let mut mixed = load_tensors(mixed_path)?;
        let mut reference = load_tensors(reference_path)?;

        let mixed_snps = take_tensor(&mut mixed, SNPS_KEY, mixed_path)?;
        let (_, seq_len) = mixed_snps.dims2().map_err(|err| {
            TrainingError::initialization(format!(
                "{}: '{SNPS_KEY}' must be (samples, positions): {err}",
                mixed_path.display()
            ))
        })?;
        let mixed_labels = match mixed.remove(LABELS_KEY) {
            Some(labels) => Some(flatten_u32(&labels, mixed_path)?),
            None => None,
        };

        let reference_snps = take_tensor(&mut reference, SNPS_KEY, reference_path)?;
        let reference_labels = take_tensor(&mut reference, LABELS_KEY, reference_path)?;

        Self::new(
            seq_len,
            flatten_f32(&mixed_snps, mixed_path)?,
            mixed_labels,
            flatten_f32(&reference_snps, reference_path)?,
            flatten_u32(&reference_labels, reference_path)?,
        )
    }

    pub fn len(&self) -> usize {
        self.n_samples
    }

    pub fn is_empty(&self) -> bool {
        self.n_samples == 0
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn has_labels(&self) -> bool {
        self.mixed_labels.is_some()
    }

    pub fn reference_labels(&self) -> &[u32] {
        &self.reference_labels
    }

    /// Ancestry classes present in the reference panel, ascending.
    pub fn classes(&self) -> Vec<u32> {
        self.references_by_class.keys().copied().collect()
    }

    fn mixed_row(&self, sample: usize) -> &[f32] {
        &self.mixed_snps[sample * self.seq_len..(sample + 1) * self.seq_len]
    }

    fn reference_row(&self, reference: usize) -> &[f32] {
        &self.reference_snps[reference * self.seq_len..(reference + 1) * self.seq_len]
    }
}

/// Batches query samples with a freshly drawn, shuffled reference subset per sample.
///
/// Each sample gets up to `n_refs` references of every ancestry in random order; the
/// canonical identity of each drawn reference is reported in `reference_idx`.
pub struct ReferencePanelDataLoader {
    dataset: Arc<ReferencePanelDataset>,
    device: Device,
    batch_size: usize,
    n_refs: usize,
    shuffle: bool,
    seed: u64,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl ReferencePanelDataLoader {
    pub fn new(
        dataset: Arc<ReferencePanelDataset>,
        device: Device,
        batch_size: usize,
        n_refs: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if n_refs == 0 {
            return Err(TrainingError::initialization(
                "n_refs must be greater than zero",
            ));
        }

        let mut loader = Self {
            order: Vec::with_capacity(dataset.len()),
            dataset,
            device,
            batch_size,
            n_refs,
            shuffle,
            seed,
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        loader.start_epoch(0);
        Ok(loader)
    }

    /// Loader over `mixed_path` against the configured reference panel, producing CPU batches.
    pub fn from_config(
        data: &DataConfig,
        mixed_path: &Path,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        let dataset = ReferencePanelDataset::from_safetensors(mixed_path, &data.reference_panel)?;
        log::info!(
            "loaded {} samples x {} positions from {} ({} references, classes {:?})",
            dataset.len(),
            dataset.seq_len(),
            mixed_path.display(),
            dataset.reference_labels().len(),
            dataset.classes()
        );
        Self::new(
            Arc::new(dataset),
            Device::Cpu,
            data.batch_size,
            data.n_refs,
            shuffle,
            seed,
        )
    }

    pub fn dataset(&self) -> &ReferencePanelDataset {
        &self.dataset
    }

    fn draw_references(&mut self) -> Vec<usize> {
        let mut selection = Vec::new();
        for candidates in self.dataset.references_by_class.values() {
            let mut pool = candidates.clone();
            pool.shuffle(&mut self.rng);
            pool.truncate(self.n_refs);
            selection.extend(pool);
        }
        selection.shuffle(&mut self.rng);
        selection
    }

    fn build_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let samples: Vec<usize> = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let seq_len = self.dataset.seq_len;
        let batch = samples.len();

        let mut mixed = Vec::with_capacity(batch * seq_len);
        let mut labels = Vec::with_capacity(batch * seq_len);
        let mut panel = Vec::new();
        let mut panel_labels = Vec::new();
        let mut reference_idx = Vec::new();
        let mut refs_per_sample = 0;

        for &sample in &samples {
            mixed.extend_from_slice(self.dataset.mixed_row(sample));
            if let Some(all_labels) = self.dataset.mixed_labels.as_ref() {
                labels.extend_from_slice(&all_labels[sample * seq_len..(sample + 1) * seq_len]);
            }

            let selection = self.draw_references();
            refs_per_sample = selection.len();
            for reference in selection {
                panel.extend_from_slice(self.dataset.reference_row(reference));
                panel_labels.push(self.dataset.reference_labels[reference]);
                reference_idx.push(reference as u32);
            }
        }

        let mut out = Batch::new()
            .with_tensor(
                MIXED_VCF,
                materialize(mixed, &[batch, seq_len], &self.device, MIXED_VCF)?,
            )
            .with_tensor(
                REF_PANEL,
                materialize(panel, &[batch, refs_per_sample, seq_len], &self.device, REF_PANEL)?,
            )
            .with_tensor(
                REF_LABELS,
                materialize(panel_labels, &[batch, refs_per_sample], &self.device, REF_LABELS)?,
            )
            .with_tensor(
                REFERENCE_IDX,
                materialize(reference_idx, &[batch, refs_per_sample], &self.device, REFERENCE_IDX)?,
            )
            .with_indices(SAMPLE_IDX, samples);

        if self.dataset.has_labels() {
            out = out.with_tensor(
                MIXED_LABELS,
                materialize(labels, &[batch, seq_len], &self.device, MIXED_LABELS)?,
            );
        }

        Ok(Some(out))
    }
}

impl DataLoader for ReferencePanelDataLoader {
    fn start_epoch(&mut self, epoch: usize) {
        self.rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        self.order = (0..self.dataset.len()).collect();
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        Box::pin(async move { self.build_batch() })
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

fn materialize<T: candle_core::WithDType>(
    data: Vec<T>,
    shape: &[usize],
    device: &Device,
    field: &str,
) -> Result<Tensor> {
    Tensor::from_vec(data, shape, device).map_err(|err| {
        TrainingError::runtime(format!("failed to materialize '{field}' tensor: {err}"))
    })
}

fn load_tensors(path: &Path) -> Result<std::collections::HashMap<String, Tensor>> {
    candle_core::safetensors::load(path, &Device::Cpu).map_err(|err| {
        TrainingError::initialization(format!("failed to read {}: {err}", path.display()))
    })
}

fn take_tensor(
    tensors: &mut std::collections::HashMap<String, Tensor>,
    key: &str,
    path: &Path,
) -> Result<Tensor> {
    tensors.remove(key).ok_or_else(|| {
        TrainingError::initialization(format!("{} has no '{key}' tensor", path.display()))
    })
}

fn flatten_f32(tensor: &Tensor, path: &Path) -> Result<Vec<f32>> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|err| {
            TrainingError::initialization(format!("{}: {err}", path.display()))
        })
}

fn flatten_u32(tensor: &Tensor, path: &Path) -> Result<Vec<u32>> {
    tensor
        .to_dtype(DType::U32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(|err| {
            TrainingError::initialization(format!("{}: {err}", path.display()))
        })
}
