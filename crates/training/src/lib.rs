pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod inference;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod postprocess;
pub mod progress;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{apply_model_weights, save_model_weights, CheckpointManifest, CheckpointStore};
pub use config::{apply_overrides, TrainingConfig, TrainingError};
pub use data::{
    Batch, BatchValue, BlockingDataLoader, DataLoader, ReferencePanelDataLoader,
    ReferencePanelDataset,
};
pub use device::{select_device, try_device, DevicePreference};
pub use inference::{inference, InferenceOutput};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use metrics::{ancestry_accuracy, AverageMeter, EvaluationSummary};
pub use optimizer::{AdamConfig, OptimizerState, TrainerOptimizer};
pub use postprocess::{
    attended_labels, compute_ibd, correct_max_indices, ibd_segments, IbdSegment, NO_IBD,
};
pub use progress::{EpochProgress, ProgressSaver, ResumeStats};
pub use scheduler::{adjust_learning_rate, step_decay_lr, LRScheduler, StepDecay};
pub use trainer::{build_model, validate, Trainer, TrainingState, TrainingSummary};
