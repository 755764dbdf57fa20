use std::{collections::HashMap, path::Path};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;
const STEP_KEY: &str = "optimizer.step";
const LEARNING_RATE_KEY: &str = "optimizer.learning_rate";
const FIRST_MOMENT_SUFFIX: &str = "exp_avg";
const SECOND_MOMENT_SUFFIX: &str = "exp_avg_sq";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// Decoupled weight decay (AdamW) instead of an L2 term folded into the gradient.
    pub decoupled_weight_decay: bool,
}

impl From<&config::OptimizerConfig> for AdamConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
            decoupled_weight_decay: matches!(value.algorithm, config::OptimizerType::AdamW),
        }
    }
}

/// Adam / AdamW over named model parameters, with moments kept in f32 on the parameter device.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let first_moment = tensor.zeros_like()?.to_dtype(DType::F32)?;
            let second_moment = first_moment.clone();
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Applies one update from the gradients in `grads` and removes them from the store.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut updates = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                updates.push((index, grad.to_dtype(DType::F32)?));
            }
        }
        if updates.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in updates {
            let slot = &mut self.params[index];
            let dtype = slot.param.as_tensor().dtype();
            let current = slot.param.as_tensor().to_dtype(DType::F32)?;

            let grad = if cfg.weight_decay != 0.0 && !cfg.decoupled_weight_decay {
                (grad + current.affine(cfg.weight_decay, 0.0)?)?
            } else {
                grad
            };

            let new_m = (slot.first_moment.affine(cfg.beta1, 0.0)?
                + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = (slot.second_moment.affine(cfg.beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = new_m
                .affine(scale_m, 0.0)?
                .div(&denom)?
                .affine(cfg.learning_rate, 0.0)?;

            let base = if cfg.weight_decay != 0.0 && cfg.decoupled_weight_decay {
                current.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                current
            };
            let next = base.sub(&update)?.to_dtype(dtype)?;
            slot.param.set(&next)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    /// Drops any accumulated gradients of the tracked parameters.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut moments = HashMap::with_capacity(self.params.len());
        for slot in &self.params {
            moments.insert(
                slot.name.clone(),
                (
                    slot.first_moment.to_device(&Device::Cpu)?,
                    slot.second_moment.to_device(&Device::Cpu)?,
                ),
            );
        }
        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            moments,
        })
    }

    /// Restores moments onto each parameter's device, along with the step and learning rate.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let OptimizerState {
            step,
            learning_rate,
            mut moments,
        } = state;

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let (first, second) = moments.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;
            let dims = slot.param.as_tensor().dims();
            if first.dims() != dims || second.dims() != dims {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let device = slot.param.as_tensor().device();
            restored.push((
                first.to_dtype(DType::F32)?.to_device(device)?,
                second.to_dtype(DType::F32)?.to_device(device)?,
            ));
        }
        if !moments.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        for (slot, (first, second)) in self.params.iter_mut().zip(restored) {
            slot.first_moment = first;
            slot.second_moment = second;
        }
        self.step = step;
        self.config.learning_rate = learning_rate;
        Ok(())
    }
}

/// Serializable optimizer snapshot; tensors live on the CPU.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    /// Parameter name to (first moment, second moment).
    pub moments: HashMap<String, (Tensor, Tensor)>,
}

impl OptimizerState {
    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        let mut tensors = HashMap::with_capacity(self.moments.len() * 2 + 2);
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step as i64], &Device::Cpu)?,
        );
        tensors.insert(
            LEARNING_RATE_KEY.to_string(),
            Tensor::new(&[self.learning_rate], &Device::Cpu)?,
        );
        for (name, (first, second)) in &self.moments {
            tensors.insert(format!("{name}.{FIRST_MOMENT_SUFFIX}"), first.clone());
            tensors.insert(format!("{name}.{SECOND_MOMENT_SUFFIX}"), second.clone());
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, TrainingError> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let step = take_scalar(&mut tensors, STEP_KEY)?
            .to_dtype(DType::I64)?
            .to_vec1::<i64>()?;
        let learning_rate = take_scalar(&mut tensors, LEARNING_RATE_KEY)?
            .to_dtype(DType::F64)?
            .to_vec1::<f64>()?;
        let (Some(&step), Some(&learning_rate)) = (step.first(), learning_rate.first()) else {
            return Err(TrainingError::runtime(
                "optimizer state has empty step or learning rate entries",
            ));
        };

        let mut firsts = HashMap::new();
        let mut seconds = HashMap::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_suffix(&format!(".{SECOND_MOMENT_SUFFIX}")) {
                seconds.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_suffix(&format!(".{FIRST_MOMENT_SUFFIX}")) {
                firsts.insert(name.to_string(), tensor);
            } else {
                return Err(TrainingError::runtime(format!(
                    "unexpected optimizer state entry '{key}'"
                )));
            }
        }

        let mut moments = HashMap::with_capacity(firsts.len());
        for (name, first) in firsts {
            let second = seconds.remove(&name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing second moment of '{name}'"))
            })?;
            moments.insert(name, (first, second));
        }
        if let Some(name) = seconds.keys().next() {
            return Err(TrainingError::runtime(format!(
                "optimizer state missing first moment of '{name}'"
            )));
        }

        Ok(Self {
            step: step.max(0) as usize,
            learning_rate,
            moments,
        })
    }
}

fn take_scalar(tensors: &mut HashMap<String, Tensor>, key: &str) -> Result<Tensor, TrainingError> {
    tensors
        .remove(key)
        .ok_or_else(|| TrainingError::runtime(format!("optimizer state missing '{key}'")))
}
