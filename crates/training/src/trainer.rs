use std::{
    fs,
    sync::Arc,
    time::{Duration, Instant},
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor, Var,
};
use model::{GaitModel, GaitNet};

use crate::{
    checkpoint::{self, CheckpointId, CheckpointStore, SaveRequest},
    data::{BlockingDataLoader, DataLoader, GaitFeatureSet, RecyclingLoader},
    evaluation::{EvaluationReport, Evaluator},
    logging::{IntervalReport, Logger, LoggingSettings},
    loss::{BatchAllTripletLoss, EmbeddingLoss, LossTerm},
    metrics::{Meter, MeterAggregator, TrainingState},
    optimizer::{GroupSpec, MultiOptimizerGroup, OptimizerConfig},
    scheduler::ScheduledValue,
    TrainingConfig, TrainingError,
};

const BEST_CHECKPOINT_DIR: &str = "best";
const RESOLVED_CONFIG_FILENAME: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Init,
    Running,
    Terminated,
}

/// What happened during one call to [`Trainer::step`].
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Iteration counter after the step.
    pub iteration: usize,
    pub total_loss: f64,
    pub early_loss: f64,
    pub local_loss: f64,
    pub early_weight: f64,
    pub local_weight: f64,
    pub learning_rates: Vec<(String, f64)>,
    pub checkpoint: Option<CheckpointId>,
    /// Target-embedding scores when this step ran an evaluation.
    pub evaluation: Option<Vec<f64>>,
    pub phase: CoordinatorPhase,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationPoint {
    pub iteration: usize,
    pub scores: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub iterations: usize,
    pub best_score: Vec<f64>,
    pub best_iteration: Option<usize>,
    pub elapsed: Duration,
    pub evaluations: Vec<EvaluationPoint>,
}

struct LossWeights {
    early: Box<dyn ScheduledValue>,
    local: Box<dyn ScheduledValue>,
}

impl LossWeights {
    fn at(&self, term: LossTerm, iteration: usize) -> f64 {
        match term {
            LossTerm::Early => self.early.value_at(iteration),
            LossTerm::Local => self.local.value_at(iteration),
        }
    }
}

struct CheckpointSettings {
    store: CheckpointStore,
    every_n_iters: usize,
    best: Option<CheckpointStore>,
}

/// Drives the staged training loop: sampling, the two-term triplet
/// objective, per-group optimizer steps, periodic logging, checkpointing
/// and evaluation.
pub struct Trainer<M: GaitModel> {
    config: TrainingConfig,
    device: Device,
    model: M,
    parameters: Vec<(String, Var)>,
    loss: Box<dyn EmbeddingLoss>,
    loss_weights: LossWeights,
    optimizers: MultiOptimizerGroup,
    data_loader: BlockingDataLoader<Box<dyn DataLoader>>,
    test_set: GaitFeatureSet,
    evaluator: Evaluator,
    checkpoints: Option<CheckpointSettings>,
    logger: Logger,
    meters: MeterAggregator,
    state: TrainingState,
    phase: CoordinatorPhase,
    config_sha256: String,
    started: Option<Instant>,
    evaluations: Vec<EvaluationPoint>,
}

impl Trainer<GaitNet> {
    /// Loads both feature sets, builds the reference network on the best
    /// available device and applies any configured resume.
    pub fn from_config(config: TrainingConfig) -> Result<Self, TrainingError> {
        let device = select_device();
        if let Err(err) = device.set_seed(config.runtime.seed) {
            log::debug!("device RNG not seeded: {err}");
        }

        let train_set = Arc::new(GaitFeatureSet::load(&config.data.train)?);
        let test_set = GaitFeatureSet::load(&config.data.test)?;
        for (split, set) in [("train", train_set.as_ref()), ("test", &test_set)] {
            if set.feature_dim() != config.model.input_dim {
                return Err(TrainingError::configuration(format!(
                    "{split} features have width {} but model.input_dim is {}",
                    set.feature_dim(),
                    config.model.input_dim
                )));
            }
        }

        let model = GaitNet::new(config.model.clone(), &device).map_err(|err| {
            TrainingError::initialization(format!("failed to build model: {err}"))
        })?;
        let loader = RecyclingLoader::new(
            train_set,
            config.data.batch_identities,
            config.data.samples_per_identity,
            config.runtime.seed,
            device.clone(),
        )?;

        Self::new(config, model, Box::new(loader), test_set, device)
    }
}

impl<M: GaitModel> Trainer<M> {
    pub fn new(
        config: TrainingConfig,
        model: M,
        train_loader: Box<dyn DataLoader>,
        test_set: GaitFeatureSet,
        device: Device,
    ) -> Result<Self, TrainingError> {
        let optimizer_config = OptimizerConfig::try_from(&config.optimizer)?;
        config.validate()?;

        let parameters = model.named_parameters();
        if parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }

        let mut specs = Vec::with_capacity(config.groups.len());
        for group in &config.groups {
            let mut group_parameters = Vec::new();
            for submodule in &group.submodules {
                let owned = model.submodule_parameters(submodule);
                if owned.is_empty() {
                    return Err(TrainingError::configuration(format!(
                        "optimizer group '{}' names unknown submodule '{}'",
                        group.name, submodule
                    )));
                }
                group_parameters.extend(owned);
            }
            specs.push(GroupSpec {
                name: group.name.clone(),
                parameters: group_parameters,
                optimizer: optimizer_config,
                learning_rate: group.learning_rate.build()?,
            });
        }
        let optimizers = MultiOptimizerGroup::new(&parameters, specs)?;
        log::info!(
            "{} optimizer over groups [{}]",
            optimizer_config.kind(),
            optimizers.group_names().join(", ")
        );

        let loss_weights = LossWeights {
            early: config.loss.early_weight.build()?,
            local: config.loss.local_weight.build()?,
        };
        let loss: Box<dyn EmbeddingLoss> = Box::new(BatchAllTripletLoss::new(config.loss.margin)?);

        let checkpoints = match &config.runtime.checkpoint {
            Some(cfg) => {
                let store = CheckpointStore::open(&cfg.directory, cfg.max_keep, device.clone())?;
                let best = if cfg.save_best {
                    Some(CheckpointStore::open(
                        cfg.directory.join(BEST_CHECKPOINT_DIR),
                        Some(1),
                        device.clone(),
                    )?)
                } else {
                    None
                };
                Some(CheckpointSettings {
                    store,
                    every_n_iters: cfg.every_n_iters,
                    best,
                })
            }
            None => None,
        };

        if let Some(work_dir) = &config.runtime.work_dir {
            fs::create_dir_all(work_dir)?;
            let resolved = serde_json::to_vec_pretty(&config)?;
            fs::write(work_dir.join(RESOLVED_CONFIG_FILENAME), resolved)?;
        }

        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;
        let evaluator = Evaluator::from_config(&config.evaluation);
        let config_sha256 = checkpoint::fingerprint_config(&config)?;

        model.set_training(true);
        let mut trainer = Self {
            config,
            device,
            model,
            parameters,
            loss,
            loss_weights,
            optimizers,
            data_loader: BlockingDataLoader::new(train_loader),
            test_set,
            evaluator,
            checkpoints,
            logger,
            meters: MeterAggregator::new(),
            state: TrainingState::default(),
            phase: CoordinatorPhase::Init,
            config_sha256,
            started: None,
            evaluations: Vec::new(),
        };

        if trainer.config.runtime.print_model {
            trainer.print_model();
        }
        trainer.apply_resume_config()?;
        Ok(trainer)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizers(&self) -> &MultiOptimizerGroup {
        &self.optimizers
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    pub fn checkpoint_store(&self) -> Option<&CheckpointStore> {
        self.checkpoints.as_ref().map(|settings| &settings.store)
    }

    fn print_model(&self) {
        log::info!(
            "model has {} parameters in {} tensors",
            self.model.parameter_count(),
            self.parameters.len()
        );
        for (group, count) in self.optimizers.parameter_counts() {
            log::info!("  group {group}: {count} parameters");
        }
        for (name, var) in &self.parameters {
            log::debug!("  {name}: {:?}", var.as_tensor().dims());
        }
    }

    fn apply_resume_config(&mut self) -> Result<(), TrainingError> {
        let Some(resume) = self.config.runtime.resume.clone() else {
            return Ok(());
        };
        let id = match resume.iteration {
            Some(iteration) => CheckpointId::new(iteration),
            None => match self.latest_checkpoint()? {
                Some(id) => id,
                None => {
                    log::info!("no checkpoint to resume from; starting fresh");
                    return Ok(());
                }
            },
        };
        self.resume(id, resume.restore_optimizer, resume.keep_iteration)
    }

    fn latest_checkpoint(&self) -> Result<Option<CheckpointId>, TrainingError> {
        match &self.checkpoints {
            Some(settings) => settings.store.latest(),
            None => Ok(None),
        }
    }

    /// Restores model weights and, when asked, optimizer state from a
    /// checkpoint. With `keep_iteration` counting continues from the
    /// checkpoint; otherwise it restarts at zero.
    pub fn resume(
        &mut self,
        id: CheckpointId,
        restore_optimizers: bool,
        keep_iteration: bool,
    ) -> Result<(), TrainingError> {
        let settings = self.checkpoints.as_ref().ok_or_else(|| {
            TrainingError::configuration("resuming requires runtime.checkpoint to be configured")
        })?;
        let loaded = settings.store.load(id, restore_optimizers)?;

        if loaded.manifest.config_sha256.as_deref() != Some(self.config_sha256.as_str()) {
            log::warn!("checkpoint {id} was written with a different configuration");
        }

        // Validate weights and optimizer states before either is installed.
        let weights = checkpoint::match_model_weights(&self.parameters, loaded.model)?;
        let optimizer_states = match loaded.optimizer_states {
            Some(states) => Some(self.optimizers.prepare_state(states)?),
            None => None,
        };
        weights.apply()?;
        if let Some(prepared) = optimizer_states {
            self.optimizers.commit_state(prepared);
        }

        self.state = if keep_iteration {
            TrainingState {
                iteration: loaded.iteration,
                best_score: if loaded.manifest.best_score.is_empty() {
                    TrainingState::default().best_score
                } else {
                    loaded.manifest.best_score
                },
                best_iteration: loaded.manifest.best_iteration,
            }
        } else {
            TrainingState::default()
        };
        self.meters.reset_all();

        log::info!(
            "resumed from {id} (optimizers {}, continuing at iteration {})",
            if restore_optimizers { "restored" } else { "fresh" },
            self.state.iteration
        );
        Ok(())
    }

    pub fn resume_from_latest(&mut self) -> Result<Option<CheckpointId>, TrainingError> {
        let Some(id) = self.latest_checkpoint()? else {
            return Ok(None);
        };
        self.resume(id, true, true)?;
        Ok(Some(id))
    }

    /// Scores the current model on the held-out set without touching
    /// the training state.
    pub fn evaluate(&mut self) -> Result<EvaluationReport, TrainingError> {
        let batches = self
            .test_set
            .batches(self.config.data.test_batch_size, &self.device);
        self.evaluator.evaluate(&self.model, batches)
    }

    /// Runs until the iteration budget is spent.
    pub fn train(&mut self) -> Result<TrainingSummary, TrainingError> {
        if self.config.runtime.test_before_train {
            let report = self.evaluate()?;
            self.logger.log_evaluation(self.state.iteration, &report);
        }

        while self.phase != CoordinatorPhase::Terminated {
            if self.state.iteration >= self.config.runtime.num_iter {
                self.finish();
                break;
            }
            self.step()?;
        }
        Ok(self.summary())
    }

    pub fn step(&mut self) -> Result<StepOutcome, TrainingError> {
        match self.phase {
            CoordinatorPhase::Terminated => {
                return Err(TrainingError::runtime("training has already terminated"))
            }
            CoordinatorPhase::Init => {
                self.phase = CoordinatorPhase::Running;
                self.started.get_or_insert_with(Instant::now);
                log::info!(
                    "training from iteration {} to {}",
                    self.state.iteration,
                    self.config.runtime.num_iter
                );
            }
            CoordinatorPhase::Running => {}
        }

        let data_start = Instant::now();
        let batch = self
            .data_loader
            .next_batch()?
            .ok_or_else(|| TrainingError::runtime("training stream is exhausted"))?;
        let data_time = data_start.elapsed().as_secs_f64();

        // Schedules see the iteration before it is counted.
        let schedule_iteration = self.state.iteration;
        let early_weight = self.loss_weights.at(LossTerm::Early, schedule_iteration);
        let local_weight = self.loss_weights.at(LossTerm::Local, schedule_iteration);
        self.state.iteration += 1;
        let iteration = self.state.iteration;

        let model_start = Instant::now();
        let embeddings = self
            .model
            .forward(&batch.sequences)
            .map_err(to_runtime_error)?;
        let early = self.loss.compute(&embeddings.global, &batch.identities)?;
        let local = self.loss.compute(&embeddings.local, &batch.identities)?;
        let total = weighted_sum(&early.loss, early_weight, &local.loss, local_weight)?;
        let total_loss = f64::from(total.to_vec0::<f32>().map_err(to_runtime_error)?);
        if !total_loss.is_finite() {
            return Err(TrainingError::runtime(format!(
                "loss became non-finite ({total_loss}) at iteration {iteration}"
            )));
        }

        self.optimizers.zero_all_gradients();
        self.optimizers.backward(&total)?;
        let learning_rates = self.optimizers.step_all(schedule_iteration)?;
        let model_time = model_start.elapsed().as_secs_f64();

        self.meters.update(Meter::DataTime, data_time);
        self.meters.update(Meter::ModelTime, model_time);
        self.meters
            .update(Meter::EarlyLoss, f64::from(early.metrics.value()));
        self.meters
            .update(Meter::LocalLoss, f64::from(local.metrics.value()));
        self.meters
            .update(Meter::EarlyActive, early.metrics.active_triplets() as f64);
        self.meters
            .update(Meter::LocalActive, local.metrics.active_triplets() as f64);

        if iteration % self.config.runtime.log_interval == 0 {
            self.report_interval(IntervalReport {
                iteration,
                learning_rates: learning_rates.clone(),
                early_weight,
                local_weight,
                averages: Vec::new(),
            })?;
        }

        let checkpoint = self.maybe_checkpoint(iteration)?;

        let evaluation = if iteration % self.config.runtime.test_interval == 0 {
            Some(self.evaluate_and_record(iteration)?)
        } else {
            None
        };

        if iteration >= self.config.runtime.num_iter {
            self.finish();
        }

        Ok(StepOutcome {
            iteration,
            total_loss,
            early_loss: f64::from(early.metrics.value()),
            local_loss: f64::from(local.metrics.value()),
            early_weight,
            local_weight,
            learning_rates,
            checkpoint,
            evaluation,
            phase: self.phase,
        })
    }

    fn report_interval(&mut self, mut report: IntervalReport) -> Result<(), TrainingError> {
        report.averages = Meter::ALL
            .iter()
            .filter_map(|meter| {
                self.meters
                    .average(*meter)
                    .ok()
                    .map(|value| (*meter, value))
            })
            .collect();
        self.logger.log_interval(&report);

        if self.config.runtime.logging.parameter_norms {
            let norms = self.optimizers.parameter_norms()?;
            self.logger.log_parameter_norms(report.iteration, &norms);
        }
        self.meters.reset_all();
        Ok(())
    }

    fn maybe_checkpoint(&self, iteration: usize) -> Result<Option<CheckpointId>, TrainingError> {
        let Some(settings) = &self.checkpoints else {
            return Ok(None);
        };
        if iteration % settings.every_n_iters != 0 {
            return Ok(None);
        }
        let optimizer_states = self.optimizers.save_state()?;
        let descriptor = settings.store.save(SaveRequest {
            state: &self.state,
            parameters: &self.parameters,
            optimizer_states: &optimizer_states,
            config_sha256: Some(self.config_sha256.clone()),
        })?;
        Ok(Some(descriptor.id))
    }

    fn evaluate_and_record(&mut self, iteration: usize) -> Result<Vec<f64>, TrainingError> {
        let report = self.evaluate()?;
        self.logger.log_evaluation(iteration, &report);

        let scores = report.scores(self.config.runtime.target_acc);
        if self.state.record_evaluation(iteration, &scores) {
            log::info!("new best {} accuracy {:?}", self.config.runtime.target_acc.as_str(), scores);
            if let Some(best) = self.checkpoints.as_ref().and_then(|s| s.best.as_ref()) {
                let optimizer_states = self.optimizers.save_state()?;
                best.save(SaveRequest {
                    state: &self.state,
                    parameters: &self.parameters,
                    optimizer_states: &optimizer_states,
                    config_sha256: Some(self.config_sha256.clone()),
                })?;
            }
        }
        log::info!(
            "Best Acc: {:?} (iteration {})",
            self.state.best_score,
            self.state
                .best_iteration
                .map_or_else(|| "none".to_string(), |it| it.to_string())
        );

        self.evaluations.push(EvaluationPoint {
            iteration,
            scores: scores.clone(),
        });
        Ok(scores)
    }

    fn finish(&mut self) {
        self.phase = CoordinatorPhase::Terminated;
        self.logger.flush();
        let elapsed = self.elapsed();
        log::info!(
            "training finished at iteration {}: best {:?} at {:?}, work dir {}, elapsed {:.1}s",
            self.state.iteration,
            self.state.best_score,
            self.state.best_iteration,
            self.config
                .runtime
                .work_dir
                .as_ref()
                .map_or_else(|| "-".to_string(), |dir| dir.display().to_string()),
            elapsed.as_secs_f64()
        );
    }

    fn elapsed(&self) -> Duration {
        self.started.map(|start| start.elapsed()).unwrap_or_default()
    }

    pub fn summary(&self) -> TrainingSummary {
        TrainingSummary {
            iterations: self.state.iteration,
            best_score: self.state.best_score.clone(),
            best_iteration: self.state.best_iteration,
            elapsed: self.elapsed(),
            evaluations: self.evaluations.clone(),
        }
    }
}

fn weighted_sum(
    early: &Tensor,
    early_weight: f64,
    local: &Tensor,
    local_weight: f64,
) -> Result<Tensor, TrainingError> {
    let early = early.affine(early_weight, 0.0).map_err(to_runtime_error)?;
    let local = local.affine(local_weight, 0.0).map_err(to_runtime_error)?;
    early.add(&local).map_err(to_runtime_error)
}

fn select_device() -> Device {
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("device: using Metal GPU #0");
                return device;
            }
            Err(err) => log::warn!("failed to initialize metal device, falling back to CPU: {err}"),
        }
    } else if cuda_is_available() {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                log::info!("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => log::warn!("cuda reported available but initialization failed: {err}"),
        }
    }
    log::info!("device: using CPU");
    Device::Cpu
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CheckpointConfig,
        data::SampleLabel,
        scheduler::ScheduleConfig,
    };
    use tempfile::tempdir;

    const FEATURE_DIM: usize = 6;

    fn feature_set(identities: usize, conditions: &[&str], views: &[&str]) -> GaitFeatureSet {
        let mut values = Vec::new();
        let mut labels = Vec::new();
        for identity in 0..identities {
            for (c, condition) in conditions.iter().enumerate() {
                for (v, view) in views.iter().enumerate() {
                    for frame in 0..3 {
                        for d in 0..FEATURE_DIM {
                            let signal = if d == identity % FEATURE_DIM { 1.0 } else { 0.0 };
                            let jitter = ((identity + c + v + frame + d) % 5) as f32 * 0.01;
                            values.push(signal + jitter);
                        }
                    }
                    labels.push(SampleLabel::new(
                        format!("{identity:03}"),
                        *view,
                        *condition,
                    ));
                }
            }
        }
        let sequences =
            Tensor::from_vec(values, (labels.len(), 3, FEATURE_DIM), &Device::Cpu).unwrap();
        GaitFeatureSet::new(sequences, labels).unwrap()
    }

    fn config(num_iter: usize) -> TrainingConfig {
        let mut config: TrainingConfig = toml::from_str(
            r#"
[data]
train = "unused/train"
test = "unused/test"
batch_identities = 2
samples_per_identity = 2
test_batch_size = 5

[model]
input_dim = 6
hidden_dim = 8
embedding_dim = 4
num_parts = 2
"#,
        )
        .unwrap();
        config.runtime.num_iter = num_iter;
        config.runtime.log_interval = 1;
        config.runtime.test_interval = num_iter;
        config.runtime.logging.enable_stdout = false;
        config
    }

    fn weights(trainer: &Trainer<GaitNet>) -> Vec<Vec<f32>> {
        trainer
            .model()
            .named_parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect()
    }

    fn trainer(config: TrainingConfig) -> Trainer<GaitNet> {
        let train = Arc::new(feature_set(4, &["nm-01", "nm-02"], &["000", "090"]));
        let test = feature_set(3, &["nm-01", "nm-05"], &["000", "090"]);
        let model = GaitNet::new(config.model.clone(), &Device::Cpu).unwrap();
        let loader = RecyclingLoader::new(train, 2, 2, 3, Device::Cpu).unwrap();
        Trainer::new(config, model, Box::new(loader), test, Device::Cpu).unwrap()
    }

    #[test]
    fn single_step_budget_uses_only_the_early_term() {
        let mut config = config(1);
        config.loss.early_weight = ScheduleConfig::Constant { value: 1.0 };
        config.loss.local_weight = ScheduleConfig::Constant { value: 0.0 };
        let mut trainer = trainer(config);
        assert_eq!(trainer.phase(), CoordinatorPhase::Init);

        let outcome = trainer.step().unwrap();
        assert_eq!(outcome.iteration, 1);
        assert_eq!(outcome.total_loss, outcome.early_loss);
        assert_eq!(outcome.local_weight, 0.0);
        assert_eq!(outcome.phase, CoordinatorPhase::Terminated);
        assert_eq!(trainer.phase(), CoordinatorPhase::Terminated);
        assert!(trainer.step().is_err());
    }

    #[test]
    fn schedules_are_queried_before_the_counter_moves() {
        let mut config = config(3);
        config.loss.early_weight = ScheduleConfig::LinearRamp {
            start: 0.0,
            end: 2.0,
            from: 0,
            to: 2,
        };
        config.groups[0].learning_rate = ScheduleConfig::StepDecay {
            base: 0.1,
            gamma: 0.5,
            milestones: vec![1],
        };
        let mut trainer = trainer(config);

        let first = trainer.step().unwrap();
        assert_eq!(first.early_weight, 0.0);
        assert_eq!(first.learning_rates[0], ("backbone".to_string(), 0.1));
        let second = trainer.step().unwrap();
        assert_eq!(second.early_weight, 1.0);
        assert_eq!(second.learning_rates[0], ("backbone".to_string(), 0.05));
    }

    #[test]
    fn evaluation_runs_on_the_test_interval() {
        let mut config = config(10);
        config.runtime.test_interval = 5;
        config.runtime.log_interval = 3;
        let mut trainer = trainer(config);

        let summary = trainer.train().unwrap();
        assert_eq!(summary.iterations, 10);
        let iterations: Vec<usize> = summary.evaluations.iter().map(|e| e.iteration).collect();
        assert_eq!(iterations, vec![5, 10]);
        for point in &summary.evaluations {
            assert_eq!(point.scores.len(), 3);
        }
        assert_eq!(trainer.phase(), CoordinatorPhase::Terminated);
        assert!(trainer.model().is_training());
    }

    #[test]
    fn unknown_submodules_are_rejected() {
        let mut config = config(1);
        config.groups[2].submodules = vec!["decoder".to_string()];
        let test = feature_set(2, &["nm-01"], &["000"]);
        let train = Arc::new(feature_set(2, &["nm-01"], &["000"]));
        let model = GaitNet::new(config.model.clone(), &Device::Cpu).unwrap();
        let loader = RecyclingLoader::new(train, 2, 1, 0, Device::Cpu).unwrap();
        assert!(matches!(
            Trainer::new(config, model, Box::new(loader), test, Device::Cpu),
            Err(TrainingError::Configuration(_))
        ));
    }

    #[test]
    fn unknown_optimizer_kind_is_a_configuration_error() {
        let mut config = config(1);
        config.optimizer.kind = "lamb".to_string();
        let test = feature_set(2, &["nm-01"], &["000"]);
        let train = Arc::new(feature_set(2, &["nm-01"], &["000"]));
        let model = GaitNet::new(config.model.clone(), &Device::Cpu).unwrap();
        let loader = RecyclingLoader::new(train, 2, 1, 0, Device::Cpu).unwrap();
        assert!(matches!(
            Trainer::new(config, model, Box::new(loader), test, Device::Cpu),
            Err(TrainingError::Configuration(_))
        ));
    }

    #[test]
    fn resume_restores_weights_and_iteration() {
        let dir = tempdir().unwrap();
        let mut config = config(4);
        config.runtime.checkpoint = Some(CheckpointConfig {
            directory: dir.path().to_path_buf(),
            every_n_iters: 2,
            max_keep: None,
            save_best: false,
        });

        let mut first = trainer(config.clone());
        first.train().unwrap();
        let ids: Vec<usize> = first
            .checkpoint_store()
            .unwrap()
            .list()
            .unwrap()
            .iter()
            .map(CheckpointId::iteration)
            .collect();
        assert_eq!(ids, vec![2, 4]);
        let trained: Vec<Vec<f32>> = first
            .model()
            .named_parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();

        let mut second = trainer(config.clone());
        assert_eq!(second.resume_from_latest().unwrap(), Some(CheckpointId::new(4)));
        assert_eq!(second.state().iteration, 4);
        let restored: Vec<Vec<f32>> = second
            .model()
            .named_parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        assert_eq!(trained, restored);

        // Budget already spent: train terminates without stepping.
        let summary = second.train().unwrap();
        assert_eq!(summary.iterations, 4);

        let mut third = trainer(config);
        third.resume(CheckpointId::new(2), false, false).unwrap();
        assert_eq!(third.state().iteration, 0);
    }

    #[test]
    fn resuming_with_other_groups_is_a_schema_mismatch() {
        let dir = tempdir().unwrap();
        let mut config = config(1);
        config.runtime.checkpoint = Some(CheckpointConfig {
            directory: dir.path().to_path_buf(),
            every_n_iters: 1,
            max_keep: None,
            save_best: false,
        });
        trainer(config.clone()).train().unwrap();

        let lr = ScheduleConfig::Constant { value: 1e-3 };
        config.groups = vec![crate::config::GroupConfig::new(
            "all",
            &["backbone", "spatial_pool", "temporal_pool", "hpm", "local"],
            lr,
        )];
        let mut other = trainer(config);
        let before = weights(&other);
        assert!(matches!(
            other.resume(CheckpointId::new(1), true, true),
            Err(TrainingError::SchemaMismatch(_))
        ));
        assert_eq!(weights(&other), before);
        assert_eq!(other.state().iteration, 0);
    }

    #[test]
    fn restarting_from_zero_keeps_new_checkpoints() {
        let dir = tempdir().unwrap();
        let mut config = config(4);
        config.runtime.checkpoint = Some(CheckpointConfig {
            directory: dir.path().to_path_buf(),
            every_n_iters: 1,
            max_keep: Some(2),
            save_best: false,
        });
        trainer(config.clone()).train().unwrap();

        let mut restarted = trainer(config.clone());
        restarted.resume(CheckpointId::new(4), true, false).unwrap();
        let outcome = restarted.step().unwrap();
        assert_eq!(outcome.checkpoint, Some(CheckpointId::new(1)));
        let store = restarted.checkpoint_store().unwrap();
        assert_eq!(store.list().unwrap(), vec![CheckpointId::new(1), CheckpointId::new(4)]);
        assert_eq!(store.latest().unwrap(), Some(CheckpointId::new(1)));

        let mut next = trainer(config);
        assert_eq!(next.resume_from_latest().unwrap(), Some(CheckpointId::new(1)));
        assert_eq!(next.state().iteration, 1);
    }
}
