use std::time::{Duration, Instant};

use candle_core::{backprop::GradStore, Device, Tensor};
use lai_model::{AgnosticConfig, AgnosticModel, LaiModel, ReferencePanel};

use crate::{
    checkpoint::{apply_model_weights, CheckpointStore},
    config::ModelSettings,
    data::{Batch, BlockingDataLoader, DataLoader, MIXED_LABELS, MIXED_VCF, REF_LABELS, REF_PANEL},
    logging::Logger,
    loss::{CrossEntropyLoss, LossOutput},
    metrics::{ancestry_accuracy, AverageMeter, EvaluationSummary},
    optimizer::{AdamConfig, TrainerOptimizer},
    progress::{EpochProgress, ProgressSaver},
    scheduler::{adjust_learning_rate, StepDecay},
    TrainingConfig, TrainingError,
};

/// Where the trainer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    NotStarted,
    Resuming,
    EpochRunning(usize),
    ValidatingEpoch(usize),
    CheckpointingEpoch(usize),
    /// Stopped on request with every finished epoch persisted; holds the next epoch to run.
    Stopped(usize),
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// First epoch this call ran (non-zero after a resume).
    pub first_epoch: usize,
    pub epochs_run: usize,
    pub optimizer_steps: usize,
    pub best_epoch: Option<usize>,
    pub best_val_acc: f64,
    pub best_val_loss: f64,
    /// Stopped by the caller's predicate before `num_epochs` was reached.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy)]
struct BestSoFar {
    epoch: Option<usize>,
    val_acc: f64,
    val_loss: f64,
}

impl Default for BestSoFar {
    fn default() -> Self {
        // accuracy lives in [0, 1], so the first validated epoch always improves on -1
        Self {
            epoch: None,
            val_acc: -1.0,
            val_loss: f64::MAX,
        }
    }
}

pub struct Trainer<M, L>
where
    M: LaiModel,
    L: DataLoader,
{
    config: TrainingConfig,
    device: Device,
    model: M,
    train_loader: BlockingDataLoader<L>,
    valid_loader: BlockingDataLoader<L>,
    optimizer: TrainerOptimizer,
    scheduler: Option<StepDecay>,
    loss: CrossEntropyLoss,
    parameter_tensors: Vec<Tensor>,
    checkpoints: CheckpointStore,
    progress: ProgressSaver,
    logger: Logger,
    state: TrainingState,
    best: BestSoFar,
    elapsed_offset: Duration,
}

impl<M, L> Trainer<M, L>
where
    M: LaiModel,
    L: DataLoader,
{
    pub fn new(
        config: TrainingConfig,
        model: M,
        train_loader: L,
        valid_loader: L,
        device: Device,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let parameters = model.parameters();
        let parameter_tensors = parameters
            .iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect();
        let optimizer = TrainerOptimizer::new(parameters, AdamConfig::from(&config.optimizer))?;
        let scheduler =
            StepDecay::from_training_config(&config.scheduler, config.optimizer.learning_rate)?;
        let logger = Logger::new(&config.runtime.logging)?;

        Ok(Self {
            checkpoints: CheckpointStore::new(&config.experiment.dir),
            progress: ProgressSaver::open(&config.experiment.dir),
            config,
            device,
            model,
            train_loader: BlockingDataLoader::new(train_loader),
            valid_loader: BlockingDataLoader::new(valid_loader),
            optimizer,
            scheduler,
            loss: CrossEntropyLoss::new(),
            parameter_tensors,
            logger,
            state: TrainingState::NotStarted,
            best: BestSoFar::default(),
            elapsed_offset: Duration::ZERO,
        })
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer.steps()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn progress(&self) -> &[EpochProgress] {
        self.progress.records()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn train(&mut self) -> Result<TrainingSummary, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs until `num_epochs` or until `should_stop` returns true between two epochs.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<TrainingSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        if self.state != TrainingState::NotStarted {
            return Err(TrainingError::runtime(
                "a trainer can only run once; build a new one to resume",
            ));
        }

        let first_epoch = if self.config.runtime.resume {
            self.state = TrainingState::Resuming;
            self.resume()?
        } else {
            self.progress = ProgressSaver::create(&self.config.experiment.dir)?;
            0
        };

        log::info!(
            "training epochs {}..{} on {:?} (update_every={}, parameters={})",
            first_epoch,
            self.config.runtime.num_epochs,
            self.device,
            self.config.runtime.update_every,
            self.parameter_tensors.len()
        );

        let clock = Instant::now();
        let mut epochs_run = 0;
        let mut interrupted = false;

        for epoch in first_epoch..self.config.runtime.num_epochs {
            if should_stop() {
                log::info!("stop requested before epoch {epoch}");
                self.state = TrainingState::Stopped(epoch);
                interrupted = true;
                break;
            }

            self.state = TrainingState::EpochRunning(epoch);
            let lr = match self.scheduler.as_ref() {
                Some(schedule) => adjust_learning_rate(&mut self.optimizer, schedule, epoch),
                None => self.optimizer.learning_rate(),
            };
            let train_loss = self.run_epoch(epoch, lr)?;

            self.state = TrainingState::ValidatingEpoch(epoch);
            let summary = validate(
                &self.model,
                &mut self.valid_loader,
                &self.loss,
                &self.device,
            )?;
            self.logger.log_validation(&format!("valid epoch={epoch}"), &summary);

            self.state = TrainingState::CheckpointingEpoch(epoch);
            if summary.accuracy > self.best.val_acc {
                self.best = BestSoFar {
                    epoch: Some(epoch),
                    val_acc: summary.accuracy,
                    val_loss: summary.average_loss,
                };
                self.checkpoints.save_best(
                    &self.model,
                    epoch,
                    self.optimizer.steps(),
                    lr,
                )?;
                log::info!(
                    "new best model at epoch {epoch} (val_acc={:.4})",
                    summary.accuracy
                );
            }
            self.checkpoints
                .save_last(&self.model, &self.optimizer, epoch)?;

            let record = EpochProgress {
                epoch,
                train_loss,
                val_loss: summary.average_loss,
                val_acc: summary.accuracy,
                best_epoch: self.best.epoch.unwrap_or(epoch),
                best_val_acc: self.best.val_acc,
                best_val_loss: self.best.val_loss,
                time: (self.elapsed_offset + clock.elapsed()).as_secs_f64(),
                lr,
            };
            self.progress.update_epoch_progress(record.clone())?;
            self.logger.log_epoch(&record);
            epochs_run += 1;
        }

        if !interrupted {
            self.state = TrainingState::Completed;
        }
        self.logger.flush();

        Ok(TrainingSummary {
            first_epoch,
            epochs_run,
            optimizer_steps: self.optimizer.steps(),
            best_epoch: self.best.epoch,
            best_val_acc: self.best.val_acc,
            best_val_loss: self.best.val_loss,
            interrupted,
        })
    }

    /// Restores model, optimizer and bookkeeping; returns the next epoch to run.
    fn resume(&mut self) -> Result<usize, TrainingError> {
        let mut progress = ProgressSaver::open(&self.config.experiment.dir);
        progress.load_progress()?;
        let stats = progress.resume_stats()?;

        let checkpoint = self.checkpoints.load_last()?;
        if checkpoint.manifest.epoch != stats.last_epoch {
            return Err(TrainingError::resume(format!(
                "last checkpoint holds epoch {} but the progress log ends at epoch {}",
                checkpoint.manifest.epoch, stats.last_epoch
            )));
        }
        if let Some(best) = self.checkpoints.best_manifest()? {
            if best.epoch != stats.best_epoch {
                return Err(TrainingError::resume(format!(
                    "best checkpoint holds epoch {} but the progress log names epoch {}",
                    best.epoch, stats.best_epoch
                )));
            }
        }

        apply_model_weights(&self.model, &checkpoint.model_weights_path)
            .map_err(|err| TrainingError::resume(err.to_string()))?;
        self.optimizer
            .load_state(checkpoint.optimizer_state)
            .map_err(|err| TrainingError::resume(err.to_string()))?;

        self.best = BestSoFar {
            epoch: Some(stats.best_epoch),
            val_acc: stats.best_val_acc,
            val_loss: stats.best_val_loss,
        };
        self.elapsed_offset = stats.elapsed;
        self.progress = progress;

        log::info!(
            "resuming after epoch {} (best epoch {}, val_acc={:.4}, optimizer_steps={}, elapsed={:.1}s)",
            stats.last_epoch,
            stats.best_epoch,
            stats.best_val_acc,
            self.optimizer.steps(),
            stats.elapsed.as_secs_f64()
        );
        Ok(stats.last_epoch + 1)
    }

    /// One pass over the training set; returns the mean batch loss.
    fn run_epoch(&mut self, epoch: usize, lr: f64) -> Result<f64, TrainingError> {
        self.model.set_training(true);
        self.train_loader.start_epoch(epoch);

        let update_every = self.config.runtime.update_every;
        let log_every = self.config.runtime.log_every_n_steps;
        let mut meter = AverageMeter::new();
        let mut accumulated: Option<GradStore> = None;
        let mut batches = 0usize;

        while let Some(batch) = self.train_loader.next_batch()? {
            let batch = batch.to_device(&self.device)?;
            let output = forward_batch(&self.model, &batch)?;
            let LossOutput { loss, metrics } = self
                .loss
                .compute(&output.predictions, batch.tensor(MIXED_LABELS)?)?;

            let batch_loss = metrics.average_loss() as f64;
            if !batch_loss.is_finite() {
                return Err(TrainingError::numeric_divergence(
                    format!("training loss at epoch {epoch}, batch {batches}"),
                    batch_loss,
                ));
            }
            meter.update(batch_loss);

            let grads = loss.backward()?;
            match accumulated.as_mut() {
                Some(existing) => self.merge_gradient_store(existing, grads)?,
                None => accumulated = Some(grads),
            }

            if (batches + 1) % update_every == 0 {
                if let Some(mut grads) = accumulated.take() {
                    self.optimizer.step(&mut grads)?;
                    let step = self.optimizer.steps();
                    if step % log_every == 0 {
                        self.logger.log_training_step(epoch, step, batch_loss, lr);
                    }
                }
            }
            batches += 1;
        }

        // A trailing partial group reaches neither the optimizer nor the next epoch.
        if let Some(mut leftover) = accumulated.take() {
            log::debug!(
                "epoch {epoch}: discarding gradients of {} trailing batches",
                batches % update_every
            );
            self.optimizer.zero_grad(&mut leftover);
        }

        if batches == 0 {
            return Err(TrainingError::runtime(format!(
                "training loader produced no batches in epoch {epoch}"
            )));
        }
        meter.average()
    }

    fn merge_gradient_store(
        &self,
        accum: &mut GradStore,
        mut new_grads: GradStore,
    ) -> Result<(), TrainingError> {
        for tensor in &self.parameter_tensors {
            if let Some(grad) = new_grads.remove(tensor) {
                let combined = match accum.remove(tensor) {
                    Some(existing) => existing.add(&grad)?,
                    None => grad,
                };
                accum.insert(tensor, combined);
            }
        }
        Ok(())
    }
}

/// Evaluates on the full loader with the model in eval mode; the previous mode is restored.
pub fn validate<M, L>(
    model: &M,
    loader: &mut BlockingDataLoader<L>,
    criterion: &CrossEntropyLoss,
    device: &Device,
) -> Result<EvaluationSummary, TrainingError>
where
    M: LaiModel + ?Sized,
    L: DataLoader,
{
    let was_training = model.is_training();
    model.set_training(false);
    let result = evaluate(model, loader, criterion, device);
    model.set_training(was_training);
    result
}

fn evaluate<M, L>(
    model: &M,
    loader: &mut BlockingDataLoader<L>,
    criterion: &CrossEntropyLoss,
    device: &Device,
) -> Result<EvaluationSummary, TrainingError>
where
    M: LaiModel + ?Sized,
    L: DataLoader,
{
    // fixed reference draw so every epoch is scored against the same panels
    loader.start_epoch(0);

    let mut loss_meter = AverageMeter::new();
    let mut accuracy_sum = 0.0;
    let mut samples = 0usize;

    while let Some(batch) = loader.next_batch()? {
        let batch = batch.to_device(device)?;
        let output = forward_batch(model, &batch)?;
        let predictions = output.predictions.detach();
        let labels = batch.tensor(MIXED_LABELS)?;

        accuracy_sum += ancestry_accuracy(&predictions, labels)?;
        let metrics = criterion.compute(&predictions, labels)?.metrics;
        loss_meter.update(metrics.average_loss() as f64);
        samples += batch.sample_count()?;
    }

    if samples == 0 {
        return Err(TrainingError::runtime("validation set is empty"));
    }

    let accuracy = accuracy_sum / samples as f64;
    if !accuracy.is_finite() {
        return Err(TrainingError::numeric_divergence("validation accuracy", accuracy));
    }
    let average_loss = loss_meter.average()?;
    if !average_loss.is_finite() {
        return Err(TrainingError::numeric_divergence("validation loss", average_loss));
    }

    Ok(EvaluationSummary {
        accuracy,
        average_loss,
        samples,
    })
}

pub(crate) fn forward_batch<M: LaiModel + ?Sized>(
    model: &M,
    batch: &Batch,
) -> Result<lai_model::ModelOutput, TrainingError> {
    let reference = ReferencePanel {
        haplotypes: batch.tensor(REF_PANEL)?,
        labels: batch.tensor(REF_LABELS)?,
    };
    Ok(model.forward(batch.tensor(MIXED_VCF)?, &reference)?)
}

/// Builds the reference model for `seq_len`-position haplotypes.
pub fn build_model(
    settings: &ModelSettings,
    seq_len: usize,
    device: &Device,
) -> Result<AgnosticModel, TrainingError> {
    AgnosticModel::new(AgnosticConfig {
        n_classes: settings.n_classes,
        seq_len,
        window_size: settings.window_size,
        smoother_kernel: settings.smoother_kernel,
        seed: settings.seed,
        device: device.clone(),
    })
    .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))
}
