use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::LoggingConfig, metrics::EvaluationSummary, progress::EpochProgress, TrainingError,
};

/// Metric sink: one stdout line per event and, when configured, TensorBoard scalars.
///
/// Steps are tagged `train/*`, epochs `train/*` and `val/*` keyed by epoch index.
pub struct Logger {
    enable_stdout: bool,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(config: &LoggingConfig) -> Result<Self, TrainingError> {
        let tensorboard = match config.tensorboard.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                config.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            enable_stdout: config.enable_stdout,
            tensorboard,
        })
    }

    pub fn log_training_step(&mut self, epoch: usize, step: usize, loss: f64, lr: f64) {
        if self.enable_stdout {
            println!(
                "train epoch={} step={} loss={:.4} lr={:.5e}",
                epoch, step, loss, lr
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step_i64 = step as i64;
            if let Err(err) = writer
                .write_scalar("train/step_loss", step_i64, loss)
                .and_then(|_| writer.write_scalar("train/learning_rate", step_i64, lr))
            {
                log::warn!("{err}");
            }
        }
    }

    pub fn log_validation(&mut self, label: &str, summary: &EvaluationSummary) {
        if self.enable_stdout {
            println!(
                "{} loss={:.4} acc={:.2}% samples={}",
                label,
                summary.average_loss,
                summary.accuracy * 100.0,
                summary.samples
            );
        }
    }

    pub fn log_epoch(&mut self, progress: &EpochProgress) {
        if self.enable_stdout {
            println!(
                "epoch={} train_loss={:.4} val_loss={:.4} val_acc={:.2}% best_epoch={} best_val_acc={:.2}% lr={:.5e} time={:.1}s",
                progress.epoch,
                progress.train_loss,
                progress.val_loss,
                progress.val_acc * 100.0,
                progress.best_epoch,
                progress.best_val_acc * 100.0,
                progress.lr,
                progress.time
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let epoch = progress.epoch as i64;
            let result = writer
                .write_scalar("train/loss", epoch, progress.train_loss)
                .and_then(|_| writer.write_scalar("train/lr", epoch, progress.lr))
                .and_then(|_| writer.write_scalar("val/loss", epoch, progress.val_loss))
                .and_then(|_| writer.write_scalar("val/accuracy", epoch, progress.val_acc))
                .and_then(|_| writer.write_scalar("val/best_accuracy", epoch, progress.best_val_acc))
                .and_then(|_| writer.flush());
            if let Err(err) = result {
                log::warn!("{err}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let timestamp = current_unix_timestamp();
        let hostname = hostname();
        let filename = format!("events.out.tfevents.{}.{}", timestamp, hostname);
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let wall_time = current_wall_time();
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time,
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len = data.len() as u64;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&len.to_le_bytes());
        let len_crc = masked_crc32(&len_bytes);
        let data_crc = masked_crc32(data.as_ref());

        let len_crc_bytes = len_crc.to_le_bytes();
        let data_crc_bytes = data_crc.to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn masked_crc_matches_known_value() {
        // a zero checksum reduces to the mask delta
        let crc = masked_crc32(&[]);
        assert_eq!(crc, 0xa282_ead8);
    }

    #[test]
    fn epoch_scalars_are_framed_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(&LoggingConfig {
            enable_stdout: false,
            tensorboard: Some(dir.path().to_path_buf()),
            tensorboard_flush_every_n: 100,
        })
        .unwrap();
        logger.log_epoch(&EpochProgress {
            epoch: 0,
            train_loss: 0.7,
            val_loss: 0.6,
            val_acc: 0.8,
            best_epoch: 0,
            best_val_acc: 0.8,
            best_val_loss: 0.6,
            time: 1.0,
            lr: 1e-3,
        });
        drop(logger);

        let entry = fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let mut bytes = Vec::new();
        File::open(entry.path())
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();

        let mut offset = 0;
        let mut records = 0;
        while offset < bytes.len() {
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&bytes[offset..offset + 8]);
            let len = u64::from_le_bytes(len_bytes) as usize;
            let payload = &bytes[offset + 12..offset + 12 + len];
            let event = Event::decode(payload).unwrap();
            assert_eq!(event.step, 0);
            offset += 12 + len + 4;
            records += 1;
        }
        assert_eq!(records, 5);
    }
}
