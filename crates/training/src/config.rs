use std::{
    fs,
    path::{Path, PathBuf},
};

use cifar_model::ModelVariant;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{Result, TrainingError};

/// Full run configuration. Every section is defaulted so a run needs no file at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
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

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Some(p) = self.model.dropout {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("model.dropout must be in [0, 1) (got {})", p));
            }
        }

        if !(0.0..1.0).contains(&self.data.validation_fraction) {
            errors.push("data.validation_fraction must be in [0, 1)".to_string());
        }
        for (label, size) in [
            ("data.batch_size", self.data.batch_size),
            ("data.eval_batch_size", self.data.eval_batch_size),
            ("data.test_batch_size", self.data.test_batch_size),
        ] {
            if size == 0 {
                errors.push(format!("{label} must be greater than 0"));
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if self.optimizer.nesterov
            && (self.optimizer.momentum <= 0.0 || self.optimizer.dampening != 0.0)
        {
            errors.push("optimizer.nesterov requires momentum > 0 and zero dampening".to_string());
        }
        if let Some(clip) = self.optimizer.grad_clip_value {
            if clip <= 0.0 {
                errors.push("optimizer.grad_clip_value must be greater than 0".to_string());
            }
        }
        if let Some(norm) = self.optimizer.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.scheduler.min_lr < 0.0 {
            errors.push("scheduler.min_lr must be >= 0".to_string());
        }
        if self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
        }
        if let Some(0) = self.scheduler.t_max {
            errors.push("scheduler.t_max must be greater than 0".to_string());
        }
        if matches!(self.scheduler.strategy, LearningRateSchedule::Step) {
            if self.scheduler.step_size.unwrap_or(0) == 0 {
                errors.push("scheduler.step_size must be set for the step strategy".to_string());
            }
            if !(self.scheduler.gamma > 0.0 && self.scheduler.gamma <= 1.0) {
                errors.push("scheduler.gamma must be in (0, 1]".to_string());
            }
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }
        if let Some(0) = self.runtime.checkpoint.max_keep {
            errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
        }

        if let Some(threshold) = self.report.accuracy_threshold {
            if !(0.0..=100.0).contains(&threshold) {
                errors.push("report.accuracy_threshold must be a percentage in [0, 100]".to_string());
            }
        }
        for milestone in &self.report.milestones {
            if milestone.epoch == 0 {
                errors.push("report.milestones entries must use epochs >= 1".to_string());
            }
            if milestone.actions.is_empty() {
                errors.push(format!(
                    "report.milestones entry for epoch {} has no actions",
                    milestone.epoch
                ));
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Applies `key.path=value` overrides by round-tripping through JSON.
    pub fn with_overrides<S: AsRef<str>>(self, overrides: &[(S, S)]) -> Result<Self> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let mut value = serde_json::to_value(&self)?;
        for (path, raw) in overrides {
            set_value_at_path(&mut value, path.as_ref(), parse_override_value(raw.as_ref()))?;
        }
        serde_json::from_value(value).map_err(|err| {
            TrainingError::ConfigFormat(format!("failed to apply overrides: {err}"))
        })
    }

    /// Short descriptions of the run used to caption plots and name files.
    pub fn hyperparameter_tags(&self) -> Vec<String> {
        if !self.report.tags.is_empty() {
            return self.report.tags.clone();
        }
        let dropout = self
            .model
            .dropout
            .or_else(|| self.model.variant.default_dropout())
            .unwrap_or(0.0);
        vec![
            self.model.variant.display_name().to_string(),
            format!(
                "{} {}",
                self.scheduler.strategy.display_name(),
                self.optimizer.learning_rate
            ),
            format!("SGD WD {}", self.optimizer.weight_decay),
            format!("dropout {}", dropout),
            format!("bs {}", self.data.batch_size),
            format!("gc {}", self.optimizer.grad_clip_value.unwrap_or(0.0)),
        ]
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.directory, base);
        absolutize_in_place(&mut self.runtime.checkpoint.directory, base);
        if let Some(path) = self.runtime.checkpoint.resume_from.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.runtime.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(path, base);
        }
        absolutize_in_place(&mut self.report.output_dir, base);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default)]
    pub variant: ModelVariant,
    #[serde(default)]
    pub dropout: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_directory")]
    pub directory: PathBuf,
    /// Resolved against `directory` when relative.
    #[serde(default = "default_test_file")]
    pub test_file: PathBuf,
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f64,
    #[serde(default = "default_seed")]
    pub split_seed: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub eval_batch_size: usize,
    #[serde(default = "default_test_batch_size")]
    pub test_batch_size: usize,
    #[serde(default = "default_true")]
    pub augment: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            directory: default_data_directory(),
            test_file: default_test_file(),
            validation_fraction: default_validation_fraction(),
            split_seed: default_seed(),
            batch_size: default_batch_size(),
            eval_batch_size: default_batch_size(),
            test_batch_size: default_test_batch_size(),
            augment: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default)]
    pub dampening: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub nesterov: bool,
    #[serde(default)]
    pub grad_clip_value: Option<f64>,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            dampening: 0.0,
            weight_decay: default_weight_decay(),
            nesterov: false,
            grad_clip_value: None,
            max_grad_norm: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default)]
    pub t_max: Option<usize>,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default)]
    pub step_size: Option<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            t_max: None,
            min_lr: 0.0,
            step_size: None,
            gamma: default_gamma(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant,
    CosineAnnealing,
    Step,
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        Self::CosineAnnealing
    }
}

impl LearningRateSchedule {
    pub fn display_name(self) -> &'static str {
        match self {
            LearningRateSchedule::Constant => "ConstantLR",
            LearningRateSchedule::CosineAnnealing => "CosineAnnealingLR",
            LearningRateSchedule::Step => "StepLR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            seed: default_seed(),
            device: DevicePreference::default(),
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub resume_from: Option<PathBuf>,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_directory(),
            resume_from: None,
            max_keep: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub progress_bar: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            progress_bar: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_flush_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_milestones")]
    pub milestones: Vec<MilestoneConfig>,
    #[serde(default = "default_accuracy_threshold")]
    pub accuracy_threshold: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            milestones: default_milestones(),
            accuracy_threshold: default_accuracy_threshold(),
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneConfig {
    pub epoch: usize,
    pub actions: Vec<MilestoneAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneAction {
    /// Write test-set predictions to `predictions{epoch}.csv`.
    Predict,
    /// Render loss, accuracy and learning-rate curves.
    Plot,
    /// Log the full metric trends.
    Summary,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("data/cifar-10-batches-bin")
}

fn default_test_file() -> PathBuf {
    PathBuf::from("cifar_test_nolabels.bin")
}

fn default_validation_fraction() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    42
}

fn default_batch_size() -> usize {
    128
}

fn default_test_batch_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_momentum() -> f64 {
    0.9
}

fn default_weight_decay() -> f64 {
    5e-4
}

fn default_gamma() -> f64 {
    0.1
}

fn default_epochs() -> usize {
    200
}

fn default_checkpoint_directory() -> PathBuf {
    PathBuf::from("./checkpoint")
}

fn default_flush_every() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_accuracy_threshold() -> Option<f64> {
    Some(99.0)
}

fn default_milestones() -> Vec<MilestoneConfig> {
    use MilestoneAction::{Plot, Predict, Summary};

    let mut milestones = vec![MilestoneConfig {
        epoch: 2,
        actions: vec![Plot, Summary],
    }];
    let predict_epochs = [10, 20, 25]
        .into_iter()
        .chain((50..=200).step_by(10));
    milestones.extend(predict_epochs.map(|epoch| MilestoneConfig {
        epoch,
        actions: vec![Predict, Plot, Summary],
    }));
    milestones
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
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::ConfigFormat(format!(
            "invalid override path '{path}'"
        )));
    }

    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| TrainingError::ConfigFormat("override path must not be empty".into()))?;

    let mut current = target;
    for segment in parents {
        let map = as_object_mut(current, segment)?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object_mut(current, last)?.insert(last.to_string(), new_value);
    Ok(())
}

fn as_object_mut<'a>(value: &'a mut Value, segment: &str) -> Result<&'a mut Map<String, Value>> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        TrainingError::ConfigFormat(format!(
            "override segment '{segment}' points into a non-object value"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_run() {
        let config = TrainingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.runtime.epochs, 200);
        assert_eq!(config.optimizer.learning_rate, 0.1);
        assert_eq!(config.optimizer.momentum, 0.9);
        assert_eq!(config.optimizer.weight_decay, 5e-4);
        assert_eq!(config.data.batch_size, 128);
        assert_eq!(config.data.test_batch_size, 100);
        assert_eq!(config.scheduler.t_max, None);
        assert_eq!(config.report.accuracy_threshold, Some(99.0));
    }

    #[test]
    fn default_milestones_cover_reference_epochs() {
        let epochs: Vec<usize> = default_milestones().iter().map(|m| m.epoch).collect();
        assert_eq!(epochs.first(), Some(&2));
        assert!(epochs.contains(&25));
        assert!(epochs.contains(&200));
        assert!(!epochs.contains(&30));
        assert!(!epochs.contains(&40));
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = TrainingConfig::default();
        config.optimizer.learning_rate = 0.0;
        config.data.batch_size = 0;
        config.runtime.epochs = 0;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 3),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn toml_sections_are_optional() {
        let config: TrainingConfig = toml::from_str(
            r#"
            [model]
            variant = "tiny"

            [optimizer]
            learning_rate = 0.01
            "#,
        )
        .unwrap();
        assert_eq!(config.model.variant, ModelVariant::Tiny);
        assert_eq!(config.optimizer.learning_rate, 0.01);
        assert_eq!(config.optimizer.momentum, 0.9);
        assert_eq!(config.runtime.epochs, 200);
    }

    #[test]
    fn overrides_reach_nested_fields() {
        let config = TrainingConfig::default()
            .with_overrides(&[
                ("runtime.epochs", "5"),
                ("model.variant", "tiny"),
                ("data.augment", "false"),
            ])
            .unwrap();
        assert_eq!(config.runtime.epochs, 5);
        assert_eq!(config.model.variant, ModelVariant::Tiny);
        assert!(!config.data.augment);
    }

    #[test]
    fn derived_tags_describe_run() {
        let tags = TrainingConfig::default().hyperparameter_tags();
        assert_eq!(tags[0], "ResNet5M");
        assert_eq!(tags[1], "CosineAnnealingLR 0.1");
    }
}
