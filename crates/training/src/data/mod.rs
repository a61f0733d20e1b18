use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
    sync::Arc,
};

use candle_core::{safetensors, DType, Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

pub const SEQUENCES_FILENAME: &str = "sequences.safetensors";
pub const LABELS_FILENAME: &str = "labels.json";
const SEQUENCES_TENSOR: &str = "sequences";

/// Metadata of one recorded gait sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleLabel {
    pub identity: String,
    /// Camera angle, e.g. `090`.
    pub view: String,
    /// Walking condition, e.g. `nm-01` or `cl-02`.
    pub condition: String,
}

impl SampleLabel {
    pub fn new(identity: impl Into<String>, view: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            view: view.into(),
            condition: condition.into(),
        }
    }
}

/// Batch returned by dataset loaders.
#[derive(Debug)]
pub struct GaitBatch {
    /// `[batch, frames, feature_dim]`.
    pub sequences: Tensor,
    /// Dense identity index per row, stable within one feature set.
    pub identities: Vec<u32>,
    pub labels: Vec<SampleLabel>,
}

impl GaitBatch {
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Pre-extracted per-frame features of a gait dataset split.
///
/// On disk a feature set is a directory holding `sequences.safetensors`
/// (tensor `sequences`, `[N, frames, dim]`) and `labels.json` (one
/// [`SampleLabel`] per row).
#[derive(Debug, Clone)]
pub struct GaitFeatureSet {
    sequences: Tensor,
    labels: Vec<SampleLabel>,
    identity_ids: Vec<u32>,
    identity_count: usize,
}

impl GaitFeatureSet {
    pub fn new(sequences: Tensor, labels: Vec<SampleLabel>) -> Result<Self> {
        let (rows, frames, feature_dim) = sequences.dims3().map_err(|err| {
            TrainingError::initialization(format!(
                "feature sequences must be [samples, frames, dim]: {err}"
            ))
        })?;
        if rows != labels.len() {
            return Err(TrainingError::initialization(format!(
                "feature set has {rows} sequences but {} labels",
                labels.len()
            )));
        }
        if frames == 0 || feature_dim == 0 {
            return Err(TrainingError::initialization(
                "feature sequences must have at least one frame and one feature",
            ));
        }

        let sequences = sequences
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;

        let mut index: HashMap<&str, u32> = HashMap::new();
        let mut identity_ids = Vec::with_capacity(labels.len());
        for label in &labels {
            let next = index.len() as u32;
            identity_ids.push(*index.entry(label.identity.as_str()).or_insert(next));
        }
        let identity_count = index.len();

        Ok(Self {
            sequences,
            labels,
            identity_ids,
            identity_count,
        })
    }

    pub fn load(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref();
        let sequences_path = directory.join(SEQUENCES_FILENAME);
        let labels_path = directory.join(LABELS_FILENAME);
        for path in [&sequences_path, &labels_path] {
            if !path.is_file() {
                return Err(TrainingError::not_found(format!(
                    "feature set file {} does not exist",
                    path.display()
                )));
            }
        }

        let mut tensors = safetensors::load(&sequences_path, &Device::Cpu).map_err(|err| {
            TrainingError::corrupt(format!(
                "failed to read {}: {err}",
                sequences_path.display()
            ))
        })?;
        let sequences = tensors.remove(SEQUENCES_TENSOR).ok_or_else(|| {
            TrainingError::corrupt(format!(
                "{} has no '{SEQUENCES_TENSOR}' tensor",
                sequences_path.display()
            ))
        })?;

        let raw = fs::read(&labels_path)?;
        let labels: Vec<SampleLabel> = serde_json::from_slice(&raw).map_err(|err| {
            TrainingError::corrupt(format!("failed to parse {}: {err}", labels_path.display()))
        })?;

        let set = Self::new(sequences, labels)?;
        log::info!(
            "loaded {} sequences of {} identities from {}",
            set.len(),
            set.identity_count(),
            directory.display()
        );
        Ok(set)
    }

    pub fn save(&self, directory: impl AsRef<Path>) -> Result<()> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;
        let mut tensors = HashMap::new();
        tensors.insert(SEQUENCES_TENSOR.to_string(), self.sequences.clone());
        safetensors::save(&tensors, directory.join(SEQUENCES_FILENAME))
            .map_err(to_runtime_error)?;
        let labels = serde_json::to_vec_pretty(&self.labels)?;
        fs::write(directory.join(LABELS_FILENAME), labels)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn frames(&self) -> usize {
        self.sequences.dims()[1]
    }

    pub fn feature_dim(&self) -> usize {
        self.sequences.dims()[2]
    }

    pub fn labels(&self) -> &[SampleLabel] {
        &self.labels
    }

    pub fn identity_count(&self) -> usize {
        self.identity_count
    }

    /// Row indices grouped by dense identity index.
    pub fn rows_by_identity(&self) -> Vec<Vec<usize>> {
        let mut grouped: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (row, id) in self.identity_ids.iter().enumerate() {
            grouped.entry(*id).or_default().push(row);
        }
        grouped.into_values().collect()
    }

    pub fn batch_from_indices(&self, rows: &[usize], device: &Device) -> Result<GaitBatch> {
        if let Some(bad) = rows.iter().find(|&&row| row >= self.len()) {
            return Err(TrainingError::runtime(format!(
                "row {bad} is out of range for a feature set of {} sequences",
                self.len()
            )));
        }
        let index: Vec<u32> = rows.iter().map(|&row| row as u32).collect();
        let index = Tensor::from_vec(index, rows.len(), &Device::Cpu).map_err(to_runtime_error)?;
        let sequences = self
            .sequences
            .index_select(&index, 0)
            .and_then(|t| t.to_device(device))
            .map_err(to_runtime_error)?;

        Ok(GaitBatch {
            sequences,
            identities: rows.iter().map(|&row| self.identity_ids[row]).collect(),
            labels: rows.iter().map(|&row| self.labels[row].clone()).collect(),
        })
    }

    /// Streams the whole set once, in row order.
    pub fn batches<'a>(
        &'a self,
        batch_size: usize,
        device: &'a Device,
    ) -> impl Iterator<Item = Result<GaitBatch>> + 'a {
        let batch_size = batch_size.max(1);
        let rows: Vec<usize> = (0..self.len()).collect();
        let chunks: Vec<Vec<usize>> = rows.chunks(batch_size).map(<[usize]>::to_vec).collect();
        chunks
            .into_iter()
            .map(move |chunk| self.batch_from_indices(&chunk, device))
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<GaitBatch>>>;
}

impl<L: DataLoader + ?Sized> DataLoader for Box<L> {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<GaitBatch>>> {
        (**self).next_batch()
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<GaitBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Endless identity-balanced sampler.
///
/// Every batch holds `identities_per_batch` distinct identities with
/// `samples_per_identity` sequences each. Identities with fewer sequences
/// than requested are sampled with replacement.
pub struct RecyclingLoader {
    set: Arc<GaitFeatureSet>,
    by_identity: Vec<Vec<usize>>,
    identities_per_batch: usize,
    samples_per_identity: usize,
    device: Device,
    rng: StdRng,
    batches_served: usize,
}

impl RecyclingLoader {
    pub fn new(
        set: Arc<GaitFeatureSet>,
        identities_per_batch: usize,
        samples_per_identity: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        if identities_per_batch == 0 || samples_per_identity == 0 {
            return Err(TrainingError::initialization(
                "batch identities and samples per identity must be greater than zero",
            ));
        }
        let by_identity = set.rows_by_identity();
        if by_identity.len() < identities_per_batch {
            return Err(TrainingError::initialization(format!(
                "training set has {} identities but batches need {}",
                by_identity.len(),
                identities_per_batch
            )));
        }

        Ok(Self {
            set,
            by_identity,
            identities_per_batch,
            samples_per_identity,
            device,
            rng: StdRng::seed_from_u64(seed),
            batches_served: 0,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.identities_per_batch * self.samples_per_identity
    }

    pub fn batches_served(&self) -> usize {
        self.batches_served
    }

    fn sample_rows(&mut self) -> Vec<usize> {
        let mut rows = Vec::with_capacity(self.batch_size());
        let chosen: Vec<&Vec<usize>> = self
            .by_identity
            .choose_multiple(&mut self.rng, self.identities_per_batch)
            .collect();
        for group in chosen {
            if group.len() >= self.samples_per_identity {
                rows.extend(
                    group
                        .choose_multiple(&mut self.rng, self.samples_per_identity)
                        .copied(),
                );
            } else {
                for _ in 0..self.samples_per_identity {
                    if let Some(row) = group.choose(&mut self.rng) {
                        rows.push(*row);
                    }
                }
            }
        }
        rows
    }

    fn build_batch(&mut self) -> Result<Option<GaitBatch>> {
        let rows = self.sample_rows();
        let batch = self.set.batch_from_indices(&rows, &self.device)?;
        self.batches_served += 1;
        Ok(Some(batch))
    }
}

impl DataLoader for RecyclingLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<GaitBatch>>> {
        Box::pin(async move { self.build_batch() })
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn feature_set(identities: usize, per_identity: usize) -> GaitFeatureSet {
        let rows = identities * per_identity;
        let values: Vec<f32> = (0..rows * 2 * 3).map(|v| v as f32).collect();
        let sequences = Tensor::from_vec(values, (rows, 2, 3), &Device::Cpu).unwrap();
        let labels = (0..rows)
            .map(|row| {
                SampleLabel::new(
                    format!("{:03}", row / per_identity),
                    "090",
                    format!("nm-{:02}", row % per_identity + 1),
                )
            })
            .collect();
        GaitFeatureSet::new(sequences, labels).unwrap()
    }

    #[test]
    fn identities_get_dense_indices_in_order() {
        let set = feature_set(3, 2);
        assert_eq!(set.identity_count(), 3);
        assert_eq!(set.rows_by_identity(), vec![vec![0, 1], vec![2, 3], vec![4, 5]]);

        let batch = set.batch_from_indices(&[5, 0], &Device::Cpu).unwrap();
        assert_eq!(batch.identities, vec![2, 0]);
        assert_eq!(batch.sequences.dims(), &[2, 2, 3]);
        assert_eq!(batch.labels[0].condition, "nm-02");
    }

    #[test]
    fn test_batches_cover_every_row_once() {
        let set = feature_set(3, 3);
        let batches: Vec<GaitBatch> = set
            .batches(4, &Device::Cpu)
            .collect::<Result<_>>()
            .unwrap();
        let sizes: Vec<usize> = batches.iter().map(GaitBatch::len).collect();
        assert_eq!(sizes, vec![4, 4, 1]);
    }

    #[test]
    fn recycling_batches_are_identity_balanced() {
        let set = Arc::new(feature_set(5, 3));
        let mut loader = BlockingDataLoader::new(
            RecyclingLoader::new(set, 2, 4, 7, Device::Cpu).unwrap(),
        );

        for _ in 0..20 {
            let batch = loader.next_batch().unwrap().unwrap();
            assert_eq!(batch.len(), 8);
            let distinct: HashSet<u32> = batch.identities.iter().copied().collect();
            assert_eq!(distinct.len(), 2);
            for chunk in batch.identities.chunks(4) {
                assert!(chunk.iter().all(|id| *id == chunk[0]));
            }
        }
        assert_eq!(loader.into_inner().batches_served(), 20);
    }

    #[test]
    fn sampling_is_reproducible_for_a_seed() {
        let set = Arc::new(feature_set(6, 2));
        let mut a = RecyclingLoader::new(set.clone(), 3, 2, 11, Device::Cpu).unwrap();
        let mut b = RecyclingLoader::new(set, 3, 2, 11, Device::Cpu).unwrap();
        for _ in 0..5 {
            assert_eq!(a.sample_rows(), b.sample_rows());
        }
    }

    #[test]
    fn too_few_identities_is_rejected() {
        let set = Arc::new(feature_set(2, 2));
        assert!(matches!(
            RecyclingLoader::new(set, 3, 2, 0, Device::Cpu),
            Err(TrainingError::Initialization(_))
        ));
    }

    #[test]
    fn feature_sets_round_trip_through_disk() {
        let dir = tempdir().unwrap();
        let set = feature_set(2, 2);
        set.save(dir.path()).unwrap();

        let loaded = GaitFeatureSet::load(dir.path()).unwrap();
        assert_eq!(loaded.labels(), set.labels());
        assert_eq!(loaded.frames(), 2);
        assert_eq!(loaded.feature_dim(), 3);

        let missing = tempdir().unwrap();
        assert!(matches!(
            GaitFeatureSet::load(missing.path()),
            Err(TrainingError::NotFound(_))
        ));

        fs::write(dir.path().join(LABELS_FILENAME), b"[{").unwrap();
        assert!(matches!(
            GaitFeatureSet::load(dir.path()),
            Err(TrainingError::CorruptData(_))
        ));
    }
}
