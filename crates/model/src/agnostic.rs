use std::cell::Cell;

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::AgnosticConfig,
    output::{LaiModel, ModelOutput, ReferencePanel},
};

/// Large negative offset that keeps references of other ancestries out of a class max.
const CLASS_MASK_PENALTY: f64 = 1e4;
const INIT_NOISE: f32 = 0.01;

/// Ancestry-agnostic reference matcher.
///
/// Scores every reference haplotype against the query per window, pools the best score
/// per ancestry, then smooths the class scores across neighbouring windows with a 1-D
/// convolution. The number of reference entries may change from batch to batch.
pub struct AgnosticModel {
    config: AgnosticConfig,
    scale: Var,
    shift: Var,
    smoother_weight: Var,
    smoother_bias: Var,
    position_to_window: Tensor,
    training: Cell<bool>,
}

impl AgnosticModel {
    /// Builds the model with deterministic parameter initialisation from `config.seed`.
    pub fn new(config: AgnosticConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device.clone();
        let mut rng = StdRng::seed_from_u64(config.seed);

        let scale = Var::from_tensor(&Tensor::from_vec(vec![1f32], 1, &device)?)?;
        let shift = Var::from_tensor(&Tensor::zeros(1, DType::F32, &device)?)?;

        // Identity kernel plus noise so an untrained smoother passes class scores through.
        let classes = config.n_classes;
        let kernel = config.smoother_kernel;
        let mut weights = Vec::with_capacity(classes * classes * kernel);
        for out_channel in 0..classes {
            for in_channel in 0..classes {
                for tap in 0..kernel {
                    let base = if out_channel == in_channel && tap == kernel / 2 {
                        1.0
                    } else {
                        0.0
                    };
                    weights.push(base + rng.gen_range(-INIT_NOISE..INIT_NOISE));
                }
            }
        }
        let smoother_weight = Var::from_tensor(&Tensor::from_vec(
            weights,
            (classes, classes, kernel),
            &device,
        )?)?;
        let smoother_bias = Var::from_tensor(&Tensor::zeros(classes, DType::F32, &device)?)?;

        let n_windows = config.n_windows();
        let positions: Vec<u32> = (0..config.seq_len)
            .map(|position| (position / config.window_size).min(n_windows - 1) as u32)
            .collect();
        let position_to_window = Tensor::from_vec(positions, config.seq_len, &device)?;

        Ok(Self {
            config,
            scale,
            shift,
            smoother_weight,
            smoother_bias,
            position_to_window,
            training: Cell::new(true),
        })
    }

    pub fn config(&self) -> &AgnosticConfig {
        &self.config
    }

    fn check_inputs(&self, mixed: &Tensor, reference: &ReferencePanel<'_>) -> Result<(usize, usize)> {
        let (batch, refs, positions) = reference.haplotypes.dims3()?;
        let (mixed_batch, mixed_positions) = mixed.dims2()?;
        if mixed_batch != batch || mixed_positions != positions {
            return Err(Error::Msg(format!(
                "mixed sample shape ({mixed_batch}, {mixed_positions}) does not match reference panel ({batch}, {refs}, {positions})"
            )));
        }
        if positions != self.config.seq_len {
            return Err(Error::Msg(format!(
                "model was built for {} positions but received {}",
                self.config.seq_len, positions
            )));
        }
        if refs == 0 {
            return Err(Error::Msg("reference panel must contain at least one entry".into()));
        }
        if reference.labels.dims() != [batch, refs] {
            return Err(Error::Msg(format!(
                "reference labels expected shape [{batch}, {refs}] got {:?}",
                reference.labels.dims()
            )));
        }
        Ok((batch, refs))
    }
}

impl LaiModel for AgnosticModel {
    fn forward(&self, mixed: &Tensor, reference: &ReferencePanel<'_>) -> Result<ModelOutput> {
        let (batch, refs) = self.check_inputs(mixed, reference)?;
        let positions = self.config.seq_len;
        let window = self.config.window_size;
        let n_windows = self.config.n_windows();
        let classes = self.config.n_classes;

        let similarity = reference
            .haplotypes
            .broadcast_mul(&mixed.unsqueeze(1)?)?;
        let padded_len = n_windows * window;
        let similarity = if padded_len > positions {
            similarity.pad_with_zeros(2, 0, padded_len - positions)?
        } else {
            similarity
        };
        let window_similarity = similarity
            .reshape((batch, refs, n_windows, window))?
            .mean(3)?;
        let scores = window_similarity
            .broadcast_mul(self.scale.as_tensor())?
            .broadcast_add(self.shift.as_tensor())?;

        let max_indices = scores.argmax(1)?;

        let labels = reference.labels.to_dtype(DType::U32)?;
        let mut per_class = Vec::with_capacity(classes);
        for class in 0..classes {
            let member = labels.eq(class as u32)?.to_dtype(DType::F32)?;
            let penalty = member
                .affine(CLASS_MASK_PENALTY, -CLASS_MASK_PENALTY)?
                .unsqueeze(2)?;
            per_class.push(scores.broadcast_add(&penalty)?.max(1)?);
        }
        let out_base = Tensor::stack(&per_class, 1)?;

        let bias = self.smoother_bias.as_tensor().reshape((1, classes, 1))?;
        // Zero padding stays outside conv1d so its backward holds for fewer windows than taps.
        let half = self.config.smoother_kernel / 2;
        let out_smoother = out_base
            .pad_with_zeros(2, half, half)?
            .conv1d(self.smoother_weight.as_tensor(), 0, 1, 1, 1)?
            .broadcast_add(&bias)?;

        let predictions = out_smoother
            .index_select(&self.position_to_window, 2)?
            .transpose(1, 2)?
            .contiguous()?;

        Ok(ModelOutput {
            predictions,
            out_smoother,
            out_base,
            max_indices,
        })
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn is_training(&self) -> bool {
        self.training.get()
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("similarity.scale".to_string(), self.scale.clone()),
            ("similarity.shift".to_string(), self.shift.clone()),
            ("smoother.weight".to_string(), self.smoother_weight.clone()),
            ("smoother.bias".to_string(), self.smoother_bias.clone()),
        ]
    }

    fn device(&self) -> &Device {
        &self.config.device
    }
}
