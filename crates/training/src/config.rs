use model::GaitNetConfig;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::{optimizer::OptimizerKind, scheduler::ScheduleConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    pub model: GaitNetConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default = "default_groups")]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
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

        if let Err(err) = self.model.validate() {
            errors.push(format!("model: {}", err));
        }

        if self.data.batch_identities == 0 {
            errors.push("data.batch_identities must be greater than 0".to_string());
        }
        if self.data.samples_per_identity == 0 {
            errors.push("data.samples_per_identity must be greater than 0".to_string());
        }
        if self.data.test_batch_size == 0 {
            errors.push("data.test_batch_size must be greater than 0".to_string());
        }

        if let Err(err) = self.optimizer.kind.parse::<OptimizerKind>() {
            errors.push(err.to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
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

        if self.groups.is_empty() {
            errors.push("at least one optimizer group must be configured".to_string());
        }
        for (idx, group) in self.groups.iter().enumerate() {
            if group.name.trim().is_empty() {
                errors.push(format!("groups[{}].name must not be empty", idx));
            }
            if group.submodules.is_empty() {
                errors.push(format!("groups[{}].submodules must not be empty", idx));
            }
            errors.extend(
                group
                    .learning_rate
                    .problems(&format!("groups[{}].learning_rate", idx)),
            );
        }

        if self.loss.margin < 0.0 {
            errors.push("loss.margin must be >= 0".to_string());
        }
        errors.extend(self.loss.early_weight.problems("loss.early_weight"));
        errors.extend(self.loss.local_weight.problems("loss.local_weight"));

        if self.evaluation.gallery.is_empty() {
            errors.push("evaluation.gallery must list at least one condition".to_string());
        }
        if self.evaluation.probes.is_empty() {
            errors.push("evaluation.probes must list at least one probe set".to_string());
        }
        for (idx, probe) in self.evaluation.probes.iter().enumerate() {
            if probe.conditions.is_empty() {
                errors.push(format!("evaluation.probes[{}].conditions must not be empty", idx));
            }
        }

        if self.runtime.num_iter == 0 {
            errors.push("runtime.num_iter must be greater than 0".to_string());
        }
        if self.runtime.log_interval == 0 {
            errors.push("runtime.log_interval must be greater than 0".to_string());
        }
        if self.runtime.test_interval == 0 {
            errors.push("runtime.test_interval must be greater than 0".to_string());
        }

        if let Some(checkpoint) = &self.runtime.checkpoint {
            if checkpoint.directory.as_os_str().is_empty() {
                errors.push("runtime.checkpoint.directory must not be empty".to_string());
            }
            if checkpoint.every_n_iters == 0 {
                errors.push("runtime.checkpoint.every_n_iters must be greater than 0".to_string());
            }
            if let Some(0) = checkpoint.max_keep {
                errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
            }
        }

        if self.runtime.resume.is_some() && self.runtime.checkpoint.is_none() {
            errors.push("runtime.resume requires runtime.checkpoint".to_string());
        }

        if self.runtime.logging.tensorboard_flush_every_n == 0 {
            errors.push("runtime.logging.tensorboard_flush_every_n must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the training feature set.
    pub train: PathBuf,
    /// Directory holding the held-out feature set.
    pub test: PathBuf,
    #[serde(default = "default_batch_identities")]
    pub batch_identities: usize,
    #[serde(default = "default_samples_per_identity")]
    pub samples_per_identity: usize,
    #[serde(default = "default_test_batch_size")]
    pub test_batch_size: usize,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train, base);
        absolutize_in_place(&mut self.test, base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// `sgd` or `adam`, case-insensitive.
    #[serde(default = "default_optimizer_kind")]
    pub kind: String,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default)]
    pub nesterov: bool,
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
            kind: default_optimizer_kind(),
            momentum: default_momentum(),
            nesterov: false,
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

/// One optimizer group: a named set of model submodules sharing a
/// learning-rate schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub submodules: Vec<String>,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: ScheduleConfig,
}

impl GroupConfig {
    pub fn new(name: &str, submodules: &[&str], learning_rate: ScheduleConfig) -> Self {
        Self {
            name: name.to_string(),
            submodules: submodules.iter().map(|s| s.to_string()).collect(),
            learning_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default = "default_margin")]
    pub margin: f64,
    #[serde(default = "default_loss_weight")]
    pub early_weight: ScheduleConfig,
    #[serde(default = "default_loss_weight")]
    pub local_weight: ScheduleConfig,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            margin: default_margin(),
            early_weight: default_loss_weight(),
            local_weight: default_loss_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_gallery")]
    pub gallery: Vec<String>,
    #[serde(default = "default_probes")]
    pub probes: Vec<ProbeSetConfig>,
    #[serde(default = "default_true")]
    pub exclude_identical_view: bool,
    #[serde(default)]
    pub metric: DistanceKind,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            gallery: default_gallery(),
            probes: default_probes(),
            exclude_identical_view: true,
            metric: DistanceKind::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSetConfig {
    pub name: String,
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceKind {
    #[default]
    Euclidean,
    Cosine,
}

/// Which embedding's accuracy drives best-score tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetEmbedding {
    #[default]
    Full,
    Local,
}

impl TargetEmbedding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetEmbedding::Full => "full",
            TargetEmbedding::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_num_iter")]
    pub num_iter: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_test_interval")]
    pub test_interval: usize,
    #[serde(default)]
    pub target_acc: TargetEmbedding,
    #[serde(default)]
    pub test_before_train: bool,
    #[serde(default)]
    pub print_model: bool,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub resume: Option<ResumeConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            num_iter: default_num_iter(),
            log_interval: default_log_interval(),
            test_interval: default_test_interval(),
            target_acc: TargetEmbedding::default(),
            test_before_train: false,
            print_model: false,
            work_dir: None,
            checkpoint: None,
            resume: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(work_dir) = self.work_dir.as_mut() {
            absolutize_in_place(work_dir, base);
        }
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            absolutize_in_place(&mut checkpoint.directory, base);
        }
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    /// Save cadence in iterations. `1` saves after every iteration.
    #[serde(default = "default_every_n_iters")]
    pub every_n_iters: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
    /// Also keep the best-scoring checkpoint under `<directory>/best`.
    #[serde(default)]
    pub save_best: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeConfig {
    /// Iteration to restore. The latest checkpoint is used when absent.
    #[serde(default)]
    pub iteration: Option<usize>,
    #[serde(default = "default_true")]
    pub restore_optimizer: bool,
    /// Continue counting from the restored iteration instead of zero.
    #[serde(default = "default_true")]
    pub keep_iteration: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
    /// Emit per-group parameter norms alongside each interval report.
    #[serde(default)]
    pub parameter_norms: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
            parameter_norms: false,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_groups() -> Vec<GroupConfig> {
    vec![
        GroupConfig::new("backbone", &["backbone"], default_learning_rate()),
        GroupConfig::new(
            "top",
            &["spatial_pool", "temporal_pool", "hpm"],
            default_learning_rate(),
        ),
        GroupConfig::new("local", &["local"], default_learning_rate()),
    ]
}

fn default_learning_rate() -> ScheduleConfig {
    ScheduleConfig::Constant { value: 1e-4 }
}

fn default_loss_weight() -> ScheduleConfig {
    ScheduleConfig::Constant { value: 1.0 }
}

fn default_gallery() -> Vec<String> {
    ["nm-01", "nm-02", "nm-03", "nm-04"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_probes() -> Vec<ProbeSetConfig> {
    [
        ("NM", ["nm-05", "nm-06"]),
        ("BG", ["bg-01", "bg-02"]),
        ("CL", ["cl-01", "cl-02"]),
    ]
    .iter()
    .map(|(name, conditions)| ProbeSetConfig {
        name: name.to_string(),
        conditions: conditions.iter().map(|s| s.to_string()).collect(),
    })
    .collect()
}

fn default_optimizer_kind() -> String {
    "adam".to_string()
}

fn default_momentum() -> f64 {
    0.9
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

fn default_margin() -> f64 {
    0.2
}

fn default_batch_identities() -> usize {
    8
}

fn default_samples_per_identity() -> usize {
    4
}

fn default_test_batch_size() -> usize {
    16
}

fn default_seed() -> u64 {
    42
}

fn default_num_iter() -> usize {
    80_000
}

fn default_log_interval() -> usize {
    100
}

fn default_test_interval() -> usize {
    10_000
}

fn default_every_n_iters() -> usize {
    1
}

fn default_tensorboard_flush() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Configuration(String),
    Initialization(String),
    Runtime(String),
    SchemaMismatch(String),
    NotFound(String),
    CorruptData(String),
    DivisionByZero(String),
    OverlappingPartition {
        parameter: String,
        first: String,
        second: String,
    },
    IncompletePartition(Vec<String>),
}

impl TrainingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptData(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::SchemaMismatch(msg) => write!(f, "schema mismatch: {}", msg),
            TrainingError::NotFound(msg) => write!(f, "not found: {}", msg),
            TrainingError::CorruptData(msg) => write!(f, "corrupt data: {}", msg),
            TrainingError::DivisionByZero(msg) => write!(f, "division by zero: {}", msg),
            TrainingError::OverlappingPartition {
                parameter,
                first,
                second,
            } => write!(
                f,
                "parameter '{}' is claimed by both '{}' and '{}'",
                parameter, first, second
            ),
            TrainingError::IncompletePartition(missing) => write!(
                f,
                "parameters not assigned to any optimizer group: {}",
                missing.join(", ")
            ),
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
