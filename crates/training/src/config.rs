use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::device::DevicePreference;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub experiment: ExperimentConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.experiment.dir.as_os_str().is_empty() {
            errors.push("experiment.dir must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.n_refs == 0 {
            errors.push("data.n_refs must be greater than 0".to_string());
        }

        if self.model.n_classes < 2 {
            errors.push("model.n_classes must be at least 2".to_string());
        }

        if self.model.window_size == 0 {
            errors.push("model.window_size must be greater than 0".to_string());
        }

        if self.model.smoother_kernel % 2 == 0 {
            errors.push("model.smoother_kernel must be odd".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if self.scheduler.lr_decay > 0 && !(0.0 < self.scheduler.gamma && self.scheduler.gamma <= 1.0) {
            errors.push("scheduler.gamma must be in (0, 1] when lr_decay is enabled".to_string());
        }

        if self.runtime.num_epochs == 0 {
            errors.push("runtime.num_epochs must be greater than 0".to_string());
        }

        if self.runtime.update_every == 0 {
            errors.push("runtime.update_every must be greater than 0".to_string());
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Ensures the dataset files referenced by the config exist on disk.
    pub fn ensure_prerequisites(&self) -> Result<(), TrainingError> {
        let mut missing = Vec::new();
        for (label, path) in [
            ("data.train_mixed", Some(&self.data.train_mixed)),
            ("data.valid_mixed", Some(&self.data.valid_mixed)),
            ("data.reference_panel", Some(&self.data.reference_panel)),
            ("data.test_mixed", self.data.test_mixed.as_ref()),
        ] {
            if let Some(path) = path {
                if !path.is_file() {
                    missing.push(format!("{} ({})", label, path.display()));
                }
            }
        }

        if !missing.is_empty() {
            return Err(TrainingError::initialization(format!(
                "missing required artifacts: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.experiment.dir, base);
        self.data.apply_base_path(base);
        if let Some(dir) = self.runtime.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_mixed: PathBuf,
    pub valid_mixed: PathBuf,
    #[serde(default)]
    pub test_mixed: Option<PathBuf>,
    pub reference_panel: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_n_refs")]
    pub n_refs: usize,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train_mixed, base);
        absolutize_in_place(&mut self.valid_mixed, base);
        absolutize_in_place(&mut self.reference_panel, base);
        if let Some(test) = self.test_mixed.as_mut() {
            absolutize_in_place(test, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_n_classes")]
    pub n_classes: usize,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_smoother_kernel")]
    pub smoother_kernel: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            n_classes: default_n_classes(),
            window_size: default_window_size(),
            smoother_kernel: default_smoother_kernel(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Adam,
    AdamW,
}

/// Step decay: the rate is multiplied by `gamma` every `lr_decay` epochs; 0 disables it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub lr_decay: usize,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lr_decay: 0,
            gamma: default_gamma(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_update_every")]
    pub update_every: usize,
    #[serde(default)]
    pub resume: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default)]
    pub device_ordinal: usize,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_epochs: default_num_epochs(),
            update_every: default_update_every(),
            resume: false,
            seed: default_seed(),
            device: DevicePreference::default(),
            device_ordinal: 0,
            log_every_n_steps: default_log_every_n_steps(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    16
}

fn default_n_refs() -> usize {
    16
}

fn default_shuffle() -> bool {
    true
}

fn default_n_classes() -> usize {
    4
}

fn default_window_size() -> usize {
    200
}

fn default_smoother_kernel() -> usize {
    3
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_gamma() -> f64 {
    0.1
}

fn default_num_epochs() -> usize {
    100
}

fn default_update_every() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_steps() -> usize {
    100
}

fn default_enable_stdout() -> bool {
    true
}

fn default_tensorboard_flush() -> usize {
    10
}

/// Applies `key.path=value` overrides on top of a loaded config and re-validates it.
pub fn apply_overrides(
    config: TrainingConfig,
    overrides: &[(String, String)],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for (path, raw) in overrides {
        let new_value = parse_override_value(raw);
        set_value_at_path(&mut value, path, new_value)?;
    }

    let config: TrainingConfig = serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })?;
    config.validate()?;
    Ok(config)
}

/// Splits a `key=value` command-line argument.
pub fn parse_override_arg(arg: &str) -> Result<(String, String), String> {
    let (path, value) = arg
        .split_once('=')
        .ok_or_else(|| "override must be in the form key=value".to_string())?;
    if path.trim().is_empty() {
        return Err("override key must not be empty".into());
    }
    Ok((path.trim().to_string(), value.trim().to_string()))
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "override path '{}' contains an empty segment",
            path
        )));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::runtime("override path must not be empty"));
    };

    let mut current = target;
    for segment in parents {
        let map = current.as_object_mut().ok_or_else(|| {
            TrainingError::runtime(format!(
                "override path segment '{}' points to non-object value",
                segment
            ))
        })?;
        let entry = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if entry.is_null() {
            *entry = Value::Object(serde_json::Map::new());
        }
        current = entry;
    }

    let map = current.as_object_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override path '{}' does not end in an object field",
            path
        ))
    })?;
    map.insert(last.to_string(), new_value);
    Ok(())
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Resume(String),
    DeviceUnavailable(String),
    NumericDivergence { context: String, value: f64 },
    EmptyAccumulator,
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn resume(message: impl Into<String>) -> Self {
        Self::Resume(message.into())
    }

    pub fn numeric_divergence(context: impl Into<String>, value: f64) -> Self {
        Self::NumericDivergence {
            context: context.into(),
            value,
        }
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::Resume(msg) => write!(f, "cannot resume training: {}", msg),
            TrainingError::DeviceUnavailable(msg) => {
                write!(f, "compute device unavailable: {}", msg)
            }
            TrainingError::NumericDivergence { context, value } => {
                write!(f, "non-finite {} ({})", context, value)
            }
            TrainingError::EmptyAccumulator => {
                write!(f, "average requested before any value was recorded")
            }
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [experiment]
        dir = "runs/exp1"

        [data]
        train_mixed = "data/train.safetensors"
        valid_mixed = "data/valid.safetensors"
        reference_panel = "data/ref.safetensors"
    "#;

    fn minimal() -> TrainingConfig {
        toml::from_str(MINIMAL).unwrap()
    }

    #[test]
    fn fills_defaults() {
        let config = minimal();
        assert_eq!(config.runtime.update_every, 1);
        assert_eq!(config.scheduler.lr_decay, 0);
        assert_eq!(config.optimizer.algorithm, OptimizerType::Adam);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn resolves_paths_against_config_directory() {
        let mut config = minimal();
        config.apply_base_path(Path::new("/srv/lai"));
        assert_eq!(config.experiment.dir, PathBuf::from("/srv/lai/runs/exp1"));
        assert_eq!(
            config.data.reference_panel,
            PathBuf::from("/srv/lai/data/ref.safetensors")
        );
    }

    #[test]
    fn collects_every_validation_error() {
        let mut config = minimal();
        config.runtime.update_every = 0;
        config.optimizer.learning_rate = 0.0;
        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn overrides_nested_fields() {
        let overrides = vec![
            parse_override_arg("runtime.num_epochs=3").unwrap(),
            parse_override_arg("scheduler.lr_decay=10").unwrap(),
            parse_override_arg("runtime.resume=true").unwrap(),
        ];
        let config = apply_overrides(minimal(), &overrides).unwrap();
        assert_eq!(config.runtime.num_epochs, 3);
        assert_eq!(config.scheduler.lr_decay, 10);
        assert!(config.runtime.resume);
    }

    #[test]
    fn override_rejects_invalid_result() {
        let overrides = vec![parse_override_arg("runtime.update_every=0").unwrap()];
        assert!(apply_overrides(minimal(), &overrides).is_err());
    }

    #[test]
    fn override_argument_requires_equals() {
        assert!(parse_override_arg("runtime.num_epochs").is_err());
        assert!(parse_override_arg("=3").is_err());
    }
}
