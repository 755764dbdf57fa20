use crate::{config, optimizer::TrainerOptimizer, TrainingError};

/// Epoch-indexed learning-rate schedule.
pub trait LRScheduler: Send {
    fn learning_rate(&self, epoch: usize) -> f64;
}

/// `base_lr * gamma^(epoch / step_epochs)` with integer division.
///
/// A `step_epochs` of zero disables decay.
pub fn step_decay_lr(base_lr: f64, gamma: f64, step_epochs: usize, epoch: usize) -> f64 {
    if step_epochs == 0 {
        return base_lr;
    }
    let decays = (epoch / step_epochs).min(i32::MAX as usize) as i32;
    base_lr * gamma.powi(decays)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepDecay {
    base_lr: f64,
    gamma: f64,
    step_epochs: usize,
}

impl StepDecay {
    pub fn new(base_lr: f64, gamma: f64, step_epochs: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "step decay requires a positive base learning rate",
            ));
        }
        if step_epochs > 0 && !(gamma > 0.0 && gamma <= 1.0) {
            return Err(TrainingError::initialization(
                "step decay gamma must be in (0, 1]",
            ));
        }
        Ok(Self {
            base_lr,
            gamma,
            step_epochs,
        })
    }

    /// `None` when `scheduler.lr_decay` is zero.
    pub fn from_training_config(
        scheduler: &config::SchedulerConfig,
        base_lr: f64,
    ) -> Result<Option<Self>, TrainingError> {
        if scheduler.lr_decay == 0 {
            return Ok(None);
        }
        Self::new(base_lr, scheduler.gamma, scheduler.lr_decay).map(Some)
    }
}

impl LRScheduler for StepDecay {
    fn learning_rate(&self, epoch: usize) -> f64 {
        step_decay_lr(self.base_lr, self.gamma, self.step_epochs, epoch)
    }
}

/// Sets the optimizer rate for `epoch` and returns it.
pub fn adjust_learning_rate(
    optimizer: &mut TrainerOptimizer,
    scheduler: &dyn LRScheduler,
    epoch: usize,
) -> f64 {
    let lr = scheduler.learning_rate(epoch);
    optimizer.set_learning_rate(lr);
    lr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::AdamConfig;
    use candle_core::{Device, Var};

    #[test]
    fn decays_every_step_epochs() {
        let rates: Vec<f64> = (0..7).map(|epoch| step_decay_lr(1.0, 0.5, 3, epoch)).collect();
        assert_eq!(rates, vec![1.0, 1.0, 1.0, 0.5, 0.5, 0.5, 0.25]);
    }

    #[test]
    fn zero_step_epochs_keeps_base_rate() {
        assert_eq!(step_decay_lr(0.01, 0.1, 0, 500), 0.01);
    }

    #[test]
    fn disabled_in_config_builds_nothing() {
        let config = config::SchedulerConfig {
            lr_decay: 0,
            gamma: 0.1,
        };
        assert!(StepDecay::from_training_config(&config, 1e-3)
            .unwrap()
            .is_none());
    }

    #[test]
    fn rejects_growing_gamma() {
        assert!(StepDecay::new(1e-3, 2.0, 5).is_err());
    }

    #[test]
    fn adjust_sets_optimizer_rate() {
        let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), var)],
            AdamConfig {
                learning_rate: 0.1,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.0,
                decoupled_weight_decay: false,
            },
        )
        .unwrap();
        let schedule = StepDecay::new(0.1, 0.1, 2).unwrap();
        let lr = adjust_learning_rate(&mut optimizer, &schedule, 4);
        assert!((lr - 0.001).abs() < 1e-12);
        assert_eq!(optimizer.learning_rate(), lr);
    }
}
