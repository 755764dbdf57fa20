use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use hex::encode as hex_encode;
use lai_model::LaiModel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    optimizer::{OptimizerState, TrainerOptimizer},
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODELS_DIR: &str = "models";
const LAST_MODEL_FILENAME: &str = "last_model.safetensors";
const LAST_OPTIMIZER_FILENAME: &str = "last_optim.safetensors";
const LAST_MANIFEST_FILENAME: &str = "last_manifest.json";
const BEST_MODEL_FILENAME: &str = "best_model.safetensors";
const BEST_MANIFEST_FILENAME: &str = "best_manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    /// Epoch whose end state the files hold.
    pub epoch: usize,
    pub optimizer_step: usize,
    pub learning_rate: f64,
    pub model: FileRecord,
    pub optimizer: Option<FileRecord>,
}

/// "last" checkpoint read back for resuming.
#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub manifest: CheckpointManifest,
    pub model_weights_path: PathBuf,
    pub optimizer_state: OptimizerState,
}

/// The `last` and `best` checkpoint slots under `<exp>/models`.
///
/// Each file is written under a temporary name and renamed into place on its own, manifest
/// last. The renames are not atomic as a group: a crash between them leaves the previous
/// manifest beside newer files, and [`CheckpointStore::load_last`] then rejects the slot
/// on checksum.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(experiment_dir: &Path) -> Self {
        Self {
            dir: experiment_dir.join(MODELS_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_model_path(&self) -> PathBuf {
        self.dir.join(LAST_MODEL_FILENAME)
    }

    pub fn best_model_path(&self) -> PathBuf {
        self.dir.join(BEST_MODEL_FILENAME)
    }

    pub fn save_last<M: LaiModel + ?Sized>(
        &self,
        model: &M,
        optimizer: &TrainerOptimizer,
        epoch: usize,
    ) -> Result<CheckpointManifest, TrainingError> {
        self.ensure_dir()?;

        let model_path = self.dir.join(LAST_MODEL_FILENAME);
        write_atomically(&model_path, |tmp| save_model_weights(model, tmp))?;

        let optimizer_path = self.dir.join(LAST_OPTIMIZER_FILENAME);
        let state = optimizer.state()?;
        write_atomically(&optimizer_path, |tmp| state.save(tmp))?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            epoch,
            optimizer_step: optimizer.steps(),
            learning_rate: optimizer.learning_rate(),
            model: file_record(&model_path)?,
            optimizer: Some(file_record(&optimizer_path)?),
        };
        let manifest_path = self.dir.join(LAST_MANIFEST_FILENAME);
        write_atomically(&manifest_path, |tmp| write_json(tmp, &manifest))?;
        Ok(manifest)
    }

    pub fn save_best<M: LaiModel + ?Sized>(
        &self,
        model: &M,
        epoch: usize,
        optimizer_step: usize,
        learning_rate: f64,
    ) -> Result<CheckpointManifest, TrainingError> {
        self.ensure_dir()?;

        let model_path = self.dir.join(BEST_MODEL_FILENAME);
        write_atomically(&model_path, |tmp| save_model_weights(model, tmp))?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            epoch,
            optimizer_step,
            learning_rate,
            model: file_record(&model_path)?,
            optimizer: None,
        };
        let manifest_path = self.dir.join(BEST_MANIFEST_FILENAME);
        write_atomically(&manifest_path, |tmp| write_json(tmp, &manifest))?;
        Ok(manifest)
    }

    /// Reads and checksums the `last` slot; every failure is a resume error.
    pub fn load_last(&self) -> Result<LoadedCheckpoint, TrainingError> {
        let manifest_path = self.dir.join(LAST_MANIFEST_FILENAME);
        let manifest: CheckpointManifest = read_manifest(&manifest_path)
            .map_err(|err| TrainingError::resume(err.to_string()))?;
        ensure_version_supported(manifest.version)?;

        let model_path = self.dir.join(&manifest.model.filename);
        validate_file(&model_path, &manifest.model)?;

        let record = manifest.optimizer.as_ref().ok_or_else(|| {
            TrainingError::resume("last checkpoint manifest has no optimizer state")
        })?;
        let optimizer_path = self.dir.join(&record.filename);
        validate_file(&optimizer_path, record)?;
        let optimizer_state = OptimizerState::load(&optimizer_path).map_err(|err| {
            TrainingError::resume(format!(
                "failed to read optimizer state {}: {err}",
                optimizer_path.display()
            ))
        })?;

        Ok(LoadedCheckpoint {
            manifest,
            model_weights_path: model_path,
            optimizer_state,
        })
    }

    /// Manifest of the `best` slot, or `None` if no best model was saved yet.
    pub fn best_manifest(&self) -> Result<Option<CheckpointManifest>, TrainingError> {
        let path = self.dir.join(BEST_MANIFEST_FILENAME);
        if !path.is_file() {
            return Ok(None);
        }
        read_manifest(&path).map(Some)
    }

    /// Checksummed path of the best model weights.
    pub fn verified_best_model(&self) -> Result<PathBuf, TrainingError> {
        let manifest = self.best_manifest()?.ok_or_else(|| {
            TrainingError::runtime(format!(
                "no best model recorded under {}",
                self.dir.display()
            ))
        })?;
        let path = self.dir.join(&manifest.model.filename);
        validate_file(&path, &manifest.model)?;
        Ok(path)
    }

    fn ensure_dir(&self) -> Result<(), TrainingError> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.dir.display()
            ))
        })
    }
}

pub fn save_model_weights<M: LaiModel + ?Sized>(
    model: &M,
    path: &Path,
) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        tensors.insert(name, var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

/// Loads weights onto the model's device; names and shapes must match exactly.
pub fn apply_model_weights<M: LaiModel + ?Sized>(
    model: &M,
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let mut params_by_name = candle_core::safetensors::load(weights_path, model.device())
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to read model weights {}: {err}",
                weights_path.display()
            ))
        })?;

    for (name, var) in model.parameters() {
        let tensor = params_by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype)?
        };
        var.set(&tensor)?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

fn write_atomically<F>(path: &Path, write: F) -> Result<(), TrainingError>
where
    F: FnOnce(&Path) -> Result<(), TrainingError>,
{
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    write(&tmp)?;
    fs::rename(&tmp, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move {} into place: {err}",
            path.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn read_manifest(path: &Path) -> Result<CheckpointManifest, TrainingError> {
    if !path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            path.display()
        )));
    }
    read_json(path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::resume(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, record: &FileRecord) -> Result<(), TrainingError> {
    let actual = sha256_file(path).map_err(|err| TrainingError::resume(err.to_string()))?;
    if actual != record.sha256 {
        return Err(TrainingError::resume(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
