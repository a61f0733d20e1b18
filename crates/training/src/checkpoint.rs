use std::{
    collections::HashMap,
    fmt,
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors, Device, Tensor, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{metrics::TrainingState, optimizer::GroupStates, TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizers.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const CHECKPOINT_PREFIX: &str = "iter_";
const STAGING_SUFFIX: &str = ".partial";
const REPLACED_SUFFIX: &str = ".replaced";

/// Identifies a published checkpoint by the iteration it captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointId(usize);

impl CheckpointId {
    pub fn new(iteration: usize) -> Self {
        Self(iteration)
    }

    pub fn iteration(&self) -> usize {
        self.0
    }

    fn dir_name(&self) -> String {
        format!("{}{:08}", CHECKPOINT_PREFIX, self.0)
    }

    fn parse(name: &str) -> Option<Self> {
        name.strip_prefix(CHECKPOINT_PREFIX)?
            .parse::<usize>()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    /// Publish order within the store. Grows by one per save.
    #[serde(default)]
    pub sequence: u64,
    pub iteration: usize,
    #[serde(default)]
    pub best_score: Vec<f64>,
    #[serde(default)]
    pub best_iteration: Option<usize>,
    #[serde(default)]
    pub config_sha256: Option<String>,
    pub groups: Vec<String>,
    pub model: FileRecord,
    pub optimizers: FileRecord,
}

pub struct SaveRequest<'a> {
    pub state: &'a TrainingState,
    pub parameters: &'a [(String, Var)],
    pub optimizer_states: &'a GroupStates,
    pub config_sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub id: CheckpointId,
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub manifest: CheckpointManifest,
    pub iteration: usize,
    pub model: HashMap<String, Tensor>,
    /// `None` when optimizer restoration was not requested.
    pub optimizer_states: Option<GroupStates>,
}

/// Directory of checkpoints named `iter_<iteration>`.
///
/// A checkpoint is written into a hidden staging directory and published by a
/// single rename, so readers only ever observe complete checkpoints. Pruning
/// and [`CheckpointStore::latest`] follow publish order, not iteration order,
/// so a run restarted from iteration zero never loses its fresh checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    directory: PathBuf,
    max_keep: Option<usize>,
    device: Device,
}

impl CheckpointStore {
    pub fn open(
        directory: impl Into<PathBuf>,
        max_keep: Option<usize>,
        device: Device,
    ) -> Result<Self, TrainingError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                directory.display()
            ))
        })?;

        let store = Self {
            directory,
            max_keep,
            device,
        };
        store.remove_stale_staging()?;
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn save(&self, request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
        let id = CheckpointId::new(request.state.iteration);
        let sequence = self
            .publish_order()?
            .last()
            .map_or(1, |(sequence, _)| sequence + 1);
        let staging = self.directory.join(format!(".{}{}", id, STAGING_SUFFIX));
        if staging.exists() {
            remove_dir(&staging)?;
        }
        fs::create_dir(&staging).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create staging directory {}: {err}",
                staging.display()
            ))
        })?;

        let model_path = staging.join(MODEL_FILENAME);
        save_model_weights(request.parameters, &model_path)?;
        let model_record = file_record(&model_path)?;

        let optimizer_path = staging.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, request.optimizer_states)?;
        let optimizer_record = file_record(&optimizer_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            sequence,
            iteration: request.state.iteration,
            best_score: request.state.best_score.clone(),
            best_iteration: request.state.best_iteration,
            config_sha256: request.config_sha256,
            groups: request.optimizer_states.keys().cloned().collect(),
            model: model_record,
            optimizers: optimizer_record,
        };
        write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

        let target = self.directory.join(id.dir_name());
        self.publish(&staging, &target, id)?;
        log::debug!("saved checkpoint {} to {}", id, target.display());

        self.prune(id)?;

        Ok(CheckpointDescriptor {
            id,
            directory: target,
            manifest,
        })
    }

    fn publish(&self, staging: &Path, target: &Path, id: CheckpointId) -> Result<(), TrainingError> {
        let replaced = if target.exists() {
            let replaced = self.directory.join(format!(".{}{}", id, REPLACED_SUFFIX));
            if replaced.exists() {
                remove_dir(&replaced)?;
            }
            fs::rename(target, &replaced).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to move aside checkpoint {}: {err}",
                    target.display()
                ))
            })?;
            Some(replaced)
        } else {
            None
        };

        fs::rename(staging, target).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to publish checkpoint {}: {err}",
                target.display()
            ))
        })?;

        if let Some(replaced) = replaced {
            remove_dir(&replaced)?;
        }
        Ok(())
    }

    /// Published checkpoints in ascending iteration order.
    pub fn list(&self) -> Result<Vec<CheckpointId>, TrainingError> {
        let mut ids = Vec::new();
        for entry in read_dir(&self.directory)? {
            if !entry.is_dir {
                continue;
            }
            if let Some(id) = CheckpointId::parse(&entry.name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// The most recently published checkpoint.
    pub fn latest(&self) -> Result<Option<CheckpointId>, TrainingError> {
        Ok(self.publish_order()?.pop().map(|(_, id)| id))
    }

    /// `(sequence, id)` pairs, oldest publish first. Checkpoints whose
    /// manifest cannot be read sort before everything else.
    fn publish_order(&self) -> Result<Vec<(u64, CheckpointId)>, TrainingError> {
        let mut ordered = Vec::new();
        for id in self.list()? {
            let sequence = match load_manifest(&self.directory.join(id.dir_name())) {
                Ok(manifest) => manifest.sequence,
                Err(err) => {
                    log::warn!("checkpoint {id} has an unreadable manifest: {err}");
                    0
                }
            };
            ordered.push((sequence, id));
        }
        ordered.sort();
        Ok(ordered)
    }

    pub fn describe(&self, id: CheckpointId) -> Result<CheckpointDescriptor, TrainingError> {
        let directory = self.checkpoint_dir(id)?;
        let manifest = load_manifest(&directory)?;
        Ok(CheckpointDescriptor {
            id,
            directory,
            manifest,
        })
    }

    pub fn load(
        &self,
        id: CheckpointId,
        restore_optimizers: bool,
    ) -> Result<LoadedCheckpoint, TrainingError> {
        let directory = self.checkpoint_dir(id)?;
        let manifest = load_manifest(&directory)?;
        if manifest.version != CHECKPOINT_VERSION {
            return Err(TrainingError::schema_mismatch(format!(
                "unsupported checkpoint version {} (expected {})",
                manifest.version, CHECKPOINT_VERSION
            )));
        }
        if manifest.iteration != id.iteration() {
            return Err(TrainingError::corrupt(format!(
                "checkpoint {} records iteration {}",
                id, manifest.iteration
            )));
        }

        let model_path = directory.join(&manifest.model.filename);
        validate_file(&model_path, &manifest.model.sha256)?;
        let model = safetensors::load(&model_path, &self.device).map_err(|err| {
            TrainingError::corrupt(format!(
                "failed to read model weights {}: {err}",
                model_path.display()
            ))
        })?;

        let optimizer_states = if restore_optimizers {
            let path = directory.join(&manifest.optimizers.filename);
            validate_file(&path, &manifest.optimizers.sha256)?;
            let states: GroupStates = read_json(&path)?;
            Some(states)
        } else {
            None
        };

        Ok(LoadedCheckpoint {
            iteration: manifest.iteration,
            manifest,
            model,
            optimizer_states,
        })
    }

    fn checkpoint_dir(&self, id: CheckpointId) -> Result<PathBuf, TrainingError> {
        let directory = self.directory.join(id.dir_name());
        if !directory.is_dir() {
            return Err(TrainingError::not_found(format!(
                "checkpoint {} does not exist in {}",
                id,
                self.directory.display()
            )));
        }
        Ok(directory)
    }

    /// Drops the oldest publishes until `max_keep` remain. `keep` is the
    /// checkpoint just written and always survives.
    fn prune(&self, keep: CheckpointId) -> Result<(), TrainingError> {
        let Some(limit) = self.max_keep else {
            return Ok(());
        };
        if limit == 0 {
            return Ok(());
        }
        let mut older: Vec<CheckpointId> = self
            .publish_order()?
            .into_iter()
            .map(|(_, id)| id)
            .filter(|id| *id != keep)
            .collect();
        while older.len() + 1 > limit {
            let victim = older.remove(0);
            log::debug!("pruning checkpoint {victim}");
            remove_dir(&self.directory.join(victim.dir_name()))?;
        }
        Ok(())
    }

    fn remove_stale_staging(&self) -> Result<(), TrainingError> {
        for entry in read_dir(&self.directory)? {
            if !entry.is_dir || !entry.name.starts_with('.') {
                continue;
            }
            if entry.name.ends_with(REPLACED_SUFFIX) {
                if let Some(id) = replaced_id(&entry.name) {
                    let target = self.directory.join(id.dir_name());
                    if !target.exists() {
                        // Interrupted between moving the old copy aside and
                        // publishing its replacement.
                        log::warn!("restoring checkpoint {id} from {}", entry.path.display());
                        fs::rename(&entry.path, &target).map_err(|err| {
                            TrainingError::runtime(format!(
                                "failed to restore checkpoint {}: {err}",
                                target.display()
                            ))
                        })?;
                        continue;
                    }
                }
            } else if !entry.name.ends_with(STAGING_SUFFIX) {
                continue;
            }
            log::warn!("removing interrupted checkpoint write {}", entry.path.display());
            remove_dir(&entry.path)?;
        }
        Ok(())
    }
}

fn replaced_id(name: &str) -> Option<CheckpointId> {
    name.strip_prefix('.')?
        .strip_suffix(REPLACED_SUFFIX)
        .and_then(CheckpointId::parse)
}

/// Checkpoint tensors matched against model parameters. Nothing is written
/// until [`ModelWeights::apply`].
#[derive(Debug)]
pub struct ModelWeights {
    assignments: Vec<(Var, Tensor)>,
}

impl ModelWeights {
    pub fn apply(self) -> Result<(), TrainingError> {
        for (var, tensor) in self.assignments {
            var.set(&tensor).map_err(candle_to_training_error)?;
        }
        Ok(())
    }
}

/// Copies checkpoint tensors into the model parameters. Both sides must
/// name exactly the same parameters with the same shapes.
pub fn apply_model_weights(
    parameters: &[(String, Var)],
    tensors: HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    match_model_weights(parameters, tensors)?.apply()
}

pub fn match_model_weights(
    parameters: &[(String, Var)],
    tensors: HashMap<String, Tensor>,
) -> Result<ModelWeights, TrainingError> {
    let mut params_by_name = tensors;
    let mut assignments = Vec::with_capacity(parameters.len());

    for (name, var) in parameters {
        let tensor = params_by_name.remove(name).ok_or_else(|| {
            TrainingError::schema_mismatch(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::schema_mismatch(format!(
                "parameter {name} has shape {:?} in checkpoint but {:?} in model",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor
                .to_dtype(desired_dtype)
                .map_err(candle_to_training_error)?
        };
        assignments.push((var.clone(), tensor));
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::schema_mismatch(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(ModelWeights { assignments })
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn save_model_weights(parameters: &[(String, Var)], path: &Path) -> Result<(), TrainingError> {
    if parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(parameters.len());
    for (name, var) in parameters {
        tensors.insert(name.clone(), var.as_tensor().clone());
    }
    safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
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

struct DirEntry {
    name: String,
    path: PathBuf,
    is_dir: bool,
}

fn read_dir(base: &Path) -> Result<Vec<DirEntry>, TrainingError> {
    let mut entries = Vec::new();
    if !base.exists() {
        return Ok(entries);
    }
    for entry in fs::read_dir(base).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
        })?;
        let file_type = entry.file_type().map_err(|err| {
            TrainingError::runtime(format!(
                "failed to inspect checkpoint entry {}: {err}",
                entry.path().display()
            ))
        })?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            is_dir: file_type.is_dir(),
        });
    }
    Ok(entries)
}

fn remove_dir(path: &Path) -> Result<(), TrainingError> {
    fs::remove_dir_all(path).map_err(|err| {
        TrainingError::runtime(format!("failed to remove {}: {err}", path.display()))
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::not_found(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::corrupt(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn open_file(path: &Path) -> Result<File, TrainingError> {
    File::open(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => TrainingError::not_found(format!("{} is missing", path.display())),
        _ => TrainingError::runtime(format!("failed to open {}: {err}", path.display())),
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = open_file(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
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

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n").map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.sync_all()
        .map_err(|err| TrainingError::runtime(format!("failed to sync {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = open_file(path)?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::corrupt(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn candle_to_training_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
