pub mod checkpoint;
pub mod config;
pub mod data;
pub mod evaluation;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointId, CheckpointStore};
pub use config::{TrainingConfig, TrainingError};
pub use data::{BlockingDataLoader, DataLoader, GaitBatch, GaitFeatureSet, RecyclingLoader};
pub use evaluation::{EvaluationReport, Evaluator};
pub use loss::{BatchAllTripletLoss, EmbeddingLoss, LossMetrics, LossOutput, LossTerm};
pub use metrics::{Meter, MeterAggregator, TrainingState};
pub use optimizer::{MultiOptimizerGroup, OptimizerKind, OptimizerState, TrainerOptimizer};
pub use scheduler::{ScheduleConfig, ScheduledValue};
pub use trainer::{CoordinatorPhase, StepOutcome, Trainer, TrainingSummary};
