use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::TrainingError;

const PROGRESS_FILENAME: &str = "progress.jsonl";

/// One completed epoch. Written once, never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochProgress {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    pub best_epoch: usize,
    pub best_val_acc: f64,
    pub best_val_loss: f64,
    /// Cumulative training time in seconds, across resumes.
    pub time: f64,
    pub lr: f64,
}

/// What a resumed run needs from the log; the next epoch to run is `last_epoch + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeStats {
    pub last_epoch: usize,
    pub best_val_loss: f64,
    pub best_val_acc: f64,
    pub best_epoch: usize,
    pub elapsed: Duration,
}

/// Append-only per-epoch log at `<exp>/progress.jsonl`, one JSON record per line.
#[derive(Debug)]
pub struct ProgressSaver {
    path: PathBuf,
    records: Vec<EpochProgress>,
}

impl ProgressSaver {
    /// Starts a fresh log, discarding any previous one.
    pub fn create(experiment_dir: &Path) -> Result<Self, TrainingError> {
        fs::create_dir_all(experiment_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create experiment directory {}: {err}",
                experiment_dir.display()
            ))
        })?;
        let path = experiment_dir.join(PROGRESS_FILENAME);
        File::create(&path)
            .and_then(|file| file.sync_all())
            .map_err(|err| {
                TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
            })?;
        Ok(Self {
            path,
            records: Vec::new(),
        })
    }

    /// Binds to an existing log; call [`ProgressSaver::load_progress`] to read it.
    pub fn open(experiment_dir: &Path) -> Self {
        Self {
            path: experiment_dir.join(PROGRESS_FILENAME),
            records: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[EpochProgress] {
        &self.records
    }

    /// Appends `record` in memory and durably on disk.
    pub fn update_epoch_progress(&mut self, record: EpochProgress) -> Result<(), TrainingError> {
        if let Some(last) = self.records.last() {
            if record.epoch <= last.epoch {
                return Err(TrainingError::runtime(format!(
                    "progress record for epoch {} follows epoch {}",
                    record.epoch, last.epoch
                )));
            }
        }

        let line = serde_json::to_string(&record)
            .map_err(|err| TrainingError::runtime(format!("failed to encode progress: {err}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| {
                TrainingError::runtime(format!("failed to open {}: {err}", self.path.display()))
            })?;
        writeln!(file, "{line}")
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data())
            .map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to append to {}: {err}",
                    self.path.display()
                ))
            })?;

        self.records.push(record);
        Ok(())
    }

    /// Reads the whole log back into memory.
    pub fn load_progress(&mut self) -> Result<&[EpochProgress], TrainingError> {
        let file = File::open(&self.path).map_err(|err| {
            TrainingError::resume(format!(
                "progress log {} is unreadable: {err}",
                self.path.display()
            ))
        })?;

        let mut records: Vec<EpochProgress> = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| {
                TrainingError::resume(format!("failed to read {}: {err}", self.path.display()))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: EpochProgress = serde_json::from_str(&line).map_err(|err| {
                TrainingError::resume(format!(
                    "{} line {} is malformed: {err}",
                    self.path.display(),
                    number + 1
                ))
            })?;
            if let Some(previous) = records.last() {
                if record.epoch <= previous.epoch {
                    return Err(TrainingError::resume(format!(
                        "{} line {}: epoch {} follows epoch {}",
                        self.path.display(),
                        number + 1,
                        record.epoch,
                        previous.epoch
                    )));
                }
            }
            records.push(record);
        }

        if records.is_empty() {
            return Err(TrainingError::resume(format!(
                "progress log {} has no completed epochs",
                self.path.display()
            )));
        }

        self.records = records;
        Ok(&self.records)
    }

    pub fn resume_stats(&self) -> Result<ResumeStats, TrainingError> {
        let last = self
            .records
            .last()
            .ok_or_else(|| TrainingError::resume("no progress loaded to resume from"))?;
        let elapsed = Duration::try_from_secs_f64(last.time).map_err(|err| {
            TrainingError::resume(format!("recorded time {} is invalid: {err}", last.time))
        })?;
        Ok(ResumeStats {
            last_epoch: last.epoch,
            best_val_loss: last.best_val_loss,
            best_val_acc: last.best_val_acc,
            best_epoch: last.best_epoch,
            elapsed,
        })
    }
}
