use std::{collections::HashMap, fmt, hash::Hash};

use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Running statistics collected between two interval reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Meter {
    DataTime,
    ModelTime,
    EarlyLoss,
    LocalLoss,
    /// Triplets with a non-zero hinge in the early term.
    EarlyActive,
    LocalActive,
}

impl Meter {
    pub const ALL: [Meter; 6] = [
        Meter::DataTime,
        Meter::ModelTime,
        Meter::EarlyLoss,
        Meter::LocalLoss,
        Meter::EarlyActive,
        Meter::LocalActive,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Meter::DataTime => "train/data_time",
            Meter::ModelTime => "train/model_time",
            Meter::EarlyLoss => "train/early_loss",
            Meter::LocalLoss => "train/local_loss",
            Meter::EarlyActive => "train/early_active",
            Meter::LocalActive => "train/local_active",
        }
    }
}

impl fmt::Display for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Accumulator {
    sum: f64,
    count: u64,
}

/// Keyed running sums and counts. Keys are created on first update.
#[derive(Debug, Clone)]
pub struct MeterAggregator<K = Meter> {
    meters: HashMap<K, Accumulator>,
}

impl<K> Default for MeterAggregator<K> {
    fn default() -> Self {
        Self {
            meters: HashMap::new(),
        }
    }
}

impl<K> MeterAggregator<K>
where
    K: Copy + Eq + Hash + fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, key: K, value: f64) {
        let meter = self.meters.entry(key).or_default();
        meter.sum += value;
        meter.count += 1;
    }

    pub fn sum(&self, key: K) -> f64 {
        self.meters.get(&key).map_or(0.0, |meter| meter.sum)
    }

    pub fn count(&self, key: K) -> u64 {
        self.meters.get(&key).map_or(0, |meter| meter.count)
    }

    pub fn average(&self, key: K) -> Result<f64, TrainingError> {
        match self.meters.get(&key) {
            Some(meter) if meter.count > 0 => Ok(meter.sum / meter.count as f64),
            _ => Err(TrainingError::DivisionByZero(format!(
                "meter {:?} has no samples",
                key
            ))),
        }
    }

    /// Zeroes every key; keys stay registered.
    pub fn reset_all(&mut self) {
        for meter in self.meters.values_mut() {
            *meter = Accumulator::default();
        }
    }
}

/// Coordinator progress that survives across iterations and checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub iteration: usize,
    pub best_score: Vec<f64>,
    pub best_iteration: Option<usize>,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            iteration: 0,
            best_score: vec![0.0],
            best_iteration: None,
        }
    }
}

impl TrainingState {
    /// Replaces the best score when `scores` strictly beats it on macro average.
    pub fn record_evaluation(&mut self, iteration: usize, scores: &[f64]) -> bool {
        if macro_average(scores) > macro_average(&self.best_score) {
            self.best_score = scores.to_vec();
            self.best_iteration = Some(iteration);
            true
        } else {
            false
        }
    }
}

pub fn macro_average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
