use std::collections::{BTreeSet, HashSet};

use candle_core::Tensor;
use model::GaitModel;

use crate::{
    config::{DistanceKind, EvaluationConfig, ProbeSetConfig, TargetEmbedding},
    data::GaitBatch,
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorPhase {
    Idle,
    Collecting,
    Scoring,
}

/// Embeddings and metadata of one held-out sequence.
#[derive(Debug, Clone)]
pub struct EvaluationRecord {
    pub embedding_full: Vec<f32>,
    pub embedding_local: Vec<f32>,
    pub identity: String,
    pub view: String,
    pub condition: String,
}

/// Gallery conditions plus an ordered list of probe sets.
#[derive(Debug, Clone)]
pub struct EvaluationProtocol {
    pub gallery: Vec<String>,
    pub probes: Vec<ProbeSetConfig>,
    pub exclude_identical_view: bool,
}

impl EvaluationProtocol {
    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self {
            gallery: config.gallery.clone(),
            probes: config.probes.clone(),
            exclude_identical_view: config.exclude_identical_view,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionScore {
    pub name: String,
    /// Rank-1 accuracy in `[0, 1]`.
    pub accuracy: f64,
    /// Probe comparisons that contributed to `accuracy`.
    pub probes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub full: Vec<ConditionScore>,
    pub local: Vec<ConditionScore>,
    pub samples: usize,
}

impl EvaluationReport {
    /// Accuracies of the selected embedding, in protocol order.
    pub fn scores(&self, target: TargetEmbedding) -> Vec<f64> {
        let source = match target {
            TargetEmbedding::Full => &self.full,
            TargetEmbedding::Local => &self.local,
        };
        source.iter().map(|score| score.accuracy).collect()
    }
}

pub trait DistanceMetric: Send + Sync {
    fn distance(&self, a: &[f32], b: &[f32]) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Euclidean;

impl DistanceMetric for Euclidean {
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| {
                let d = f64::from(*x) - f64::from(*y);
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }
}

/// `1 - cos(a, b)`; zero vectors are treated as maximally distant.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl DistanceMetric for Cosine {
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        let mut dot = 0.0;
        let mut norm_a = 0.0;
        let mut norm_b = 0.0;
        for (x, y) in a.iter().zip(b) {
            let (x, y) = (f64::from(*x), f64::from(*y));
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }
        let denom = (norm_a * norm_b).sqrt();
        if denom == 0.0 {
            return 2.0;
        }
        1.0 - dot / denom
    }
}

impl DistanceKind {
    pub fn build(&self) -> Box<dyn DistanceMetric> {
        match self {
            DistanceKind::Euclidean => Box::new(Euclidean),
            DistanceKind::Cosine => Box::new(Cosine),
        }
    }
}

/// Runs one read-only pass over a held-out stream and scores rank-1
/// identification accuracy per probe set.
pub struct Evaluator {
    protocol: EvaluationProtocol,
    metric: Box<dyn DistanceMetric>,
    phase: EvaluatorPhase,
}

impl Evaluator {
    pub fn new(protocol: EvaluationProtocol, metric: Box<dyn DistanceMetric>) -> Self {
        Self {
            protocol,
            metric,
            phase: EvaluatorPhase::Idle,
        }
    }

    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self::new(EvaluationProtocol::from_config(config), config.metric.build())
    }

    pub fn phase(&self) -> EvaluatorPhase {
        self.phase
    }

    pub fn protocol(&self) -> &EvaluationProtocol {
        &self.protocol
    }

    /// The model is put in inference mode for the pass and returned to its
    /// previous mode afterwards, whether or not the pass succeeds.
    pub fn evaluate<M, I>(&mut self, model: &M, batches: I) -> Result<EvaluationReport, TrainingError>
    where
        M: GaitModel + ?Sized,
        I: IntoIterator<Item = Result<GaitBatch, TrainingError>>,
    {
        let was_training = model.is_training();
        model.set_training(false);
        let result = self.run(model, batches);
        model.set_training(was_training);
        self.phase = EvaluatorPhase::Idle;
        result
    }

    fn run<M, I>(&mut self, model: &M, batches: I) -> Result<EvaluationReport, TrainingError>
    where
        M: GaitModel + ?Sized,
        I: IntoIterator<Item = Result<GaitBatch, TrainingError>>,
    {
        self.phase = EvaluatorPhase::Collecting;
        let records = collect_records(model, batches)?;
        log::debug!("collected {} evaluation records", records.len());

        self.phase = EvaluatorPhase::Scoring;
        let full = self.score(&records, |record| &record.embedding_full);
        let local = self.score(&records, |record| &record.embedding_local);

        Ok(EvaluationReport {
            full,
            local,
            samples: records.len(),
        })
    }

    fn score<F>(&self, records: &[EvaluationRecord], embedding: F) -> Vec<ConditionScore>
    where
        F: Fn(&EvaluationRecord) -> &[f32],
    {
        let views: BTreeSet<&str> = records.iter().map(|r| r.view.as_str()).collect();
        let gallery_conditions: HashSet<&str> =
            self.protocol.gallery.iter().map(String::as_str).collect();

        self.protocol
            .probes
            .iter()
            .map(|probe_set| {
                let probe_conditions: HashSet<&str> =
                    probe_set.conditions.iter().map(String::as_str).collect();
                let mut pair_accuracies = Vec::new();
                let mut probes = 0;

                for probe_view in &views {
                    for gallery_view in &views {
                        if self.protocol.exclude_identical_view && probe_view == gallery_view {
                            continue;
                        }
                        let gallery: Vec<&EvaluationRecord> = records
                            .iter()
                            .filter(|r| {
                                r.view == *gallery_view
                                    && gallery_conditions.contains(r.condition.as_str())
                            })
                            .collect();
                        let probe: Vec<&EvaluationRecord> = records
                            .iter()
                            .filter(|r| {
                                r.view == *probe_view
                                    && probe_conditions.contains(r.condition.as_str())
                            })
                            .collect();
                        if gallery.is_empty() || probe.is_empty() {
                            continue;
                        }

                        let hits = probe
                            .iter()
                            .filter(|p| {
                                let p: &EvaluationRecord = p;
                                self.nearest(embedding(p), &gallery, &embedding)
                                    .is_some_and(|g| g.identity == p.identity)
                            })
                            .count();
                        pair_accuracies.push(hits as f64 / probe.len() as f64);
                        probes += probe.len();
                    }
                }

                let accuracy = if pair_accuracies.is_empty() {
                    0.0
                } else {
                    pair_accuracies.iter().sum::<f64>() / pair_accuracies.len() as f64
                };
                ConditionScore {
                    name: probe_set.name.clone(),
                    accuracy,
                    probes,
                }
            })
            .collect()
    }

    fn nearest<'a, F>(
        &self,
        query: &[f32],
        gallery: &[&'a EvaluationRecord],
        embedding: &F,
    ) -> Option<&'a EvaluationRecord>
    where
        F: Fn(&EvaluationRecord) -> &[f32],
    {
        let mut best: Option<(f64, &'a EvaluationRecord)> = None;
        for &candidate in gallery {
            let distance = self.metric.distance(query, embedding(candidate));
            // A non-finite distance can never be a match.
            if !distance.is_finite() {
                continue;
            }
            if best.map_or(true, |(current, _)| distance < current) {
                best = Some((distance, candidate));
            }
        }
        best.map(|(_, record)| record)
    }
}

fn collect_records<M, I>(model: &M, batches: I) -> Result<Vec<EvaluationRecord>, TrainingError>
where
    M: GaitModel + ?Sized,
    I: IntoIterator<Item = Result<GaitBatch, TrainingError>>,
{
    let mut records = Vec::new();
    for batch in batches {
        let batch = batch?;
        let embeddings = model.forward(&batch.sequences).map_err(to_runtime_error)?;
        let full = flatten_rows(&embeddings.global)?;
        let local = flatten_rows(&embeddings.local)?;
        if full.len() != batch.len() || local.len() != batch.len() {
            return Err(TrainingError::runtime(format!(
                "model returned {} embeddings for a batch of {}",
                full.len(),
                batch.len()
            )));
        }
        for ((label, embedding_full), embedding_local) in
            batch.labels.into_iter().zip(full).zip(local)
        {
            records.push(EvaluationRecord {
                embedding_full,
                embedding_local,
                identity: label.identity,
                view: label.view,
                condition: label.condition,
            });
        }
    }
    Ok(records)
}

fn flatten_rows(embeddings: &Tensor) -> Result<Vec<Vec<f32>>, TrainingError> {
    embeddings
        .flatten_from(1)
        .and_then(|t| t.to_dtype(candle_core::DType::F32))
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{GaitFeatureSet, SampleLabel};
    use candle_core::{Device, Var};
    use model::GaitEmbeddings;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Embeds a sequence as its mean frame.
    struct MeanFrame {
        training: AtomicBool,
        fail: bool,
    }

    impl MeanFrame {
        fn new() -> Self {
            Self {
                training: AtomicBool::new(true),
                fail: false,
            }
        }
    }

    impl GaitModel for MeanFrame {
        fn forward(&self, sequences: &Tensor) -> candle_core::Result<GaitEmbeddings> {
            if self.fail {
                return Err(candle_core::Error::Msg("broken".into()));
            }
            assert!(!self.is_training());
            let mean = sequences.mean_keepdim(1)?;
            Ok(GaitEmbeddings {
                global: mean.clone(),
                local: mean.neg()?,
            })
        }

        fn set_training(&self, training: bool) {
            self.training.store(training, Ordering::Relaxed);
        }

        fn is_training(&self) -> bool {
            self.training.load(Ordering::Relaxed)
        }

        fn named_parameters(&self) -> Vec<(String, Var)> {
            Vec::new()
        }
    }

    fn test_set(entries: &[(&str, &str, &str, [f32; 2])]) -> GaitFeatureSet {
        let values: Vec<f32> = entries
            .iter()
            .flat_map(|(_, _, _, v)| [v[0], v[1], v[0], v[1]])
            .collect();
        let sequences = Tensor::from_vec(values, (entries.len(), 2, 2), &Device::Cpu).unwrap();
        let labels = entries
            .iter()
            .map(|(id, view, cond, _)| SampleLabel::new(*id, *view, *cond))
            .collect();
        GaitFeatureSet::new(sequences, labels).unwrap()
    }

    fn two_identity_set() -> GaitFeatureSet {
        test_set(&[
            ("001", "000", "nm-01", [1.0, 0.0]),
            ("002", "000", "nm-01", [0.0, 1.0]),
            ("001", "090", "nm-01", [1.1, 0.0]),
            ("002", "090", "nm-01", [0.0, 1.1]),
            ("001", "000", "nm-05", [0.9, 0.1]),
            ("002", "000", "nm-05", [0.1, 0.9]),
            ("001", "090", "nm-05", [0.95, 0.0]),
            ("002", "090", "nm-05", [0.0, 0.95]),
            ("001", "000", "bg-01", [0.0, 1.0]),
            ("002", "090", "bg-01", [0.0, 1.0]),
        ])
    }

    #[test]
    fn scores_follow_protocol_order() {
        let set = two_identity_set();
        let model = MeanFrame::new();
        let mut evaluator = Evaluator::from_config(&EvaluationConfig::default());

        let report = evaluator
            .evaluate(&model, set.batches(3, &Device::Cpu))
            .unwrap();
        assert_eq!(report.samples, 10);

        let names: Vec<&str> = report.full.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["NM", "BG", "CL"]);
        assert_eq!(report.full[0].accuracy, 1.0);
        assert_eq!(report.full[0].probes, 4);
        // bg probes: identity 001 matches 002's gallery, 002 matches its own.
        assert_eq!(report.full[1].accuracy, 0.5);
        // No cl-* sequences at all.
        assert_eq!(report.full[2].accuracy, 0.0);
        assert_eq!(report.full[2].probes, 0);

        assert_eq!(report.scores(TargetEmbedding::Full), vec![1.0, 0.5, 0.0]);
        assert_eq!(report.scores(TargetEmbedding::Local).len(), 3);
    }

    #[test]
    fn identical_views_can_be_included() {
        let set = test_set(&[
            ("001", "000", "nm-01", [1.0, 0.0]),
            ("002", "000", "nm-01", [0.0, 1.0]),
            ("001", "000", "nm-05", [0.9, 0.1]),
            ("002", "000", "nm-05", [0.1, 0.9]),
        ]);
        let model = MeanFrame::new();

        let mut excluded = Evaluator::from_config(&EvaluationConfig::default());
        let report = excluded.evaluate(&model, set.batches(8, &Device::Cpu)).unwrap();
        assert_eq!(report.full[0].accuracy, 0.0);

        let config = EvaluationConfig {
            exclude_identical_view: false,
            metric: DistanceKind::Cosine,
            ..EvaluationConfig::default()
        };
        let mut included = Evaluator::from_config(&config);
        let report = included.evaluate(&model, set.batches(8, &Device::Cpu)).unwrap();
        assert_eq!(report.full[0].accuracy, 1.0);
    }

    #[test]
    fn non_finite_distances_never_match() {
        let set = test_set(&[
            ("002", "000", "nm-01", [f32::NAN, 0.0]),
            ("001", "000", "nm-01", [1.0, 0.0]),
            ("001", "090", "nm-05", [0.9, 0.0]),
        ]);
        let model = MeanFrame::new();
        let mut evaluator = Evaluator::from_config(&EvaluationConfig::default());

        let report = evaluator.evaluate(&model, set.batches(8, &Device::Cpu)).unwrap();
        assert_eq!(report.full[0].probes, 1);
        assert_eq!(report.full[0].accuracy, 1.0);
    }

    #[test]
    fn failures_restore_mode_and_phase() {
        let set = two_identity_set();
        let model = MeanFrame {
            training: AtomicBool::new(true),
            fail: true,
        };
        let mut evaluator = Evaluator::from_config(&EvaluationConfig::default());

        assert!(evaluator
            .evaluate(&model, set.batches(4, &Device::Cpu))
            .is_err());
        assert_eq!(evaluator.phase(), EvaluatorPhase::Idle);
        assert!(model.is_training());
    }

    #[test]
    fn metrics_measure_distance() {
        assert!((Euclidean.distance(&[0.0, 3.0], &[4.0, 0.0]) - 5.0).abs() < 1e-12);
        assert!(Cosine.distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-12);
        assert!((Cosine.distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-12);
    }
}
