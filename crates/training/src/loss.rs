use std::fmt;

use candle_core::{DType, Tensor};

use crate::TrainingError;

/// Offset under the square root so coincident embeddings keep a finite gradient.
const DISTANCE_EPSILON: f64 = 1e-12;

/// The two weighted terms of the training objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossTerm {
    /// Loss on the pyramid head embeddings.
    Early,
    /// Loss on the local branch embeddings.
    Local,
}

impl LossTerm {
    pub const ALL: [LossTerm; 2] = [LossTerm::Early, LossTerm::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            LossTerm::Early => "early",
            LossTerm::Local => "local",
        }
    }
}

impl fmt::Display for LossTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric-learning loss over a labelled batch of embeddings.
pub trait EmbeddingLoss: Send + Sync {
    /// `embeddings` is `[batch, parts, dim]` or `[batch, dim]`; `labels` holds
    /// one identity per batch row.
    fn compute(&self, embeddings: &Tensor, labels: &[u32]) -> Result<LossOutput, TrainingError>;
}

/// Batch-all triplet loss with a fixed margin.
///
/// Every (anchor, positive, negative) triple in the batch contributes
/// `max(0, margin + d(a, p) - d(a, n))` per part. Each part is averaged over
/// its active (non-zero) triplets, and the parts are then averaged.
#[derive(Debug, Clone)]
pub struct BatchAllTripletLoss {
    margin: f64,
}

impl BatchAllTripletLoss {
    pub fn new(margin: f64) -> Result<Self, TrainingError> {
        if !(margin.is_finite() && margin >= 0.0) {
            return Err(TrainingError::initialization(
                "triplet margin must be a finite non-negative number",
            ));
        }
        Ok(Self { margin })
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }
}

impl EmbeddingLoss for BatchAllTripletLoss {
    fn compute(&self, embeddings: &Tensor, labels: &[u32]) -> Result<LossOutput, TrainingError> {
        let embeddings = match embeddings.rank() {
            2 => embeddings.unsqueeze(1).map_err(to_runtime_error)?,
            3 => embeddings.clone(),
            rank => {
                return Err(TrainingError::runtime(format!(
                    "triplet loss expects embeddings of rank 2 or 3, got rank {rank}"
                )))
            }
        };
        let (batch, parts, _dim) = embeddings.dims3().map_err(to_runtime_error)?;
        if batch != labels.len() {
            return Err(TrainingError::runtime(format!(
                "embedding batch of {batch} rows does not match {} labels",
                labels.len()
            )));
        }
        if batch == 0 || parts == 0 {
            return Err(TrainingError::runtime(
                "triplet loss requires a non-empty batch",
            ));
        }

        let device = embeddings.device();
        // [parts, batch, dim]
        let per_part = embeddings
            .to_dtype(DType::F32)
            .and_then(|t| t.transpose(0, 1))
            .and_then(|t| t.contiguous())
            .map_err(to_runtime_error)?;
        let distances = pairwise_distances(&per_part).map_err(to_runtime_error)?;

        let (mask, triplets_per_part) = triplet_mask(labels);
        let mask = Tensor::from_vec(mask, (1, batch, batch, batch), device)
            .map_err(to_runtime_error)?;

        // hinge[p, a, pos, neg] = margin + d[p, a, pos] - d[p, a, neg]
        let anchor_positive = distances.unsqueeze(3).map_err(to_runtime_error)?;
        let anchor_negative = distances.unsqueeze(2).map_err(to_runtime_error)?;
        let hinge = anchor_positive
            .broadcast_sub(&anchor_negative)
            .and_then(|t| t.affine(1.0, self.margin))
            .and_then(|t| t.relu())
            .and_then(|t| t.broadcast_mul(&mask))
            .map_err(to_runtime_error)?;

        let hinge = hinge.flatten_from(1).map_err(to_runtime_error)?;
        let active_per_part = hinge
            .gt(0f32)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.sum(1))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(to_runtime_error)?;
        let active_triplets: usize = active_per_part.iter().map(|c| c.round() as usize).sum();

        let divisors: Vec<f32> = active_per_part.iter().map(|c| c.max(1.0)).collect();
        let divisors = Tensor::from_vec(divisors, parts, device).map_err(to_runtime_error)?;
        let loss = hinge
            .sum(1)
            .and_then(|t| t.div(&divisors))
            .and_then(|t| t.mean_all())
            .map_err(to_runtime_error)?;
        let value = loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                value,
                active_triplets,
                total_triplets: triplets_per_part * parts,
            },
        })
    }
}

/// Euclidean distances between every pair of rows, per part: `[parts, n, n]`.
fn pairwise_distances(x: &Tensor) -> candle_core::Result<Tensor> {
    let squared = x.sqr()?.sum_keepdim(2)?;
    let dot = x.matmul(&x.transpose(1, 2)?.contiguous()?)?;
    let squared_t = squared.transpose(1, 2)?;
    squared
        .broadcast_add(&squared_t)?
        .sub(&dot.affine(2.0, 0.0)?)?
        .relu()?
        .affine(1.0, DISTANCE_EPSILON)?
        .sqrt()
}

/// Flattened `[anchor, positive, negative]` validity mask and its number of ones.
fn triplet_mask(labels: &[u32]) -> (Vec<f32>, usize) {
    let n = labels.len();
    let mut mask = vec![0f32; n * n * n];
    let mut count = 0;
    for (a, anchor) in labels.iter().enumerate() {
        for (p, positive) in labels.iter().enumerate() {
            if a == p || anchor != positive {
                continue;
            }
            for (m, negative) in labels.iter().enumerate() {
                if anchor != negative {
                    mask[(a * n + p) * n + m] = 1.0;
                    count += 1;
                }
            }
        }
    }
    (mask, count)
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    value: f32,
    active_triplets: usize,
    total_triplets: usize,
}

impl LossMetrics {
    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn active_triplets(&self) -> usize {
        self.active_triplets
    }

    pub fn total_triplets(&self) -> usize {
        self.total_triplets
    }

    pub fn active_fraction(&self) -> f32 {
        if self.total_triplets == 0 {
            0.0
        } else {
            self.active_triplets as f32 / self.total_triplets as f32
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
