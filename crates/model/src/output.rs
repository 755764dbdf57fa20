use candle_core::{Device, Result, Tensor, Var};

/// Reference haplotypes handed to the model alongside their ancestry labels.
///
/// `haplotypes` is `(batch, refs, positions)` and `labels` is `(batch, refs)`; both are
/// in the per-batch shuffled order.
#[derive(Debug, Clone, Copy)]
pub struct ReferencePanel<'a> {
    pub haplotypes: &'a Tensor,
    pub labels: &'a Tensor,
}

/// Everything a forward pass produces.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Per-position class scores, `(batch, positions, classes)`.
    pub predictions: Tensor,
    /// Smoothed per-window class scores, `(batch, classes, windows)`.
    pub out_smoother: Tensor,
    /// Per-window class scores before smoothing, `(batch, classes, windows)`.
    pub out_base: Tensor,
    /// Index of the most similar reference per window, `(batch, windows)` u32.
    /// Values index the shuffled panel, not the canonical reference order.
    pub max_indices: Tensor,
}

/// Contract between the training driver and an ancestry model.
pub trait LaiModel {
    fn forward(&self, mixed: &Tensor, reference: &ReferencePanel<'_>) -> Result<ModelOutput>;

    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    /// Trainable parameters keyed by a stable name used for checkpoints.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn device(&self) -> &Device;
}
