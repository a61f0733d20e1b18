use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use candle_nn::{Linear, Module, VarBuilder, VarMap};

use crate::{block::ProjectionBlock, config::GaitNetConfig};

/// Named submodules of [`GaitNet`], in construction order.
pub const SUBMODULES: [&str; 5] = ["backbone", "spatial_pool", "temporal_pool", "hpm", "local"];

/// Pair of embeddings produced by one forward pass.
#[derive(Debug, Clone)]
pub struct GaitEmbeddings {
    /// Output of the pyramid head, `[batch, num_parts, embedding_dim]`.
    pub global: Tensor,
    /// Output of the local branch, same layout as `global`.
    pub local: Tensor,
}

/// Contract the training coordinator relies on.
///
/// Parameter names are dot separated and prefixed with the submodule that
/// owns them, e.g. `backbone.weight`.
pub trait GaitModel {
    fn forward(&self, sequences: &Tensor) -> Result<GaitEmbeddings>;

    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    /// Every trainable parameter, sorted by name.
    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn submodule_parameters(&self, submodule: &str) -> Vec<(String, Var)> {
        let prefix = format!("{submodule}.");
        self.named_parameters()
            .into_iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .collect()
    }

    fn parameter_count(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }
}

/// Small set-level gait network.
///
/// Frames are projected by `backbone`, refined by `spatial_pool`, max-pooled
/// over time and projected by `temporal_pool`, then split into part
/// embeddings by `hpm`. The `local` branch pools the backbone features
/// directly.
pub struct GaitNet {
    config: GaitNetConfig,
    device: Device,
    varmap: VarMap,
    backbone: ProjectionBlock,
    spatial_pool: ProjectionBlock,
    temporal_pool: ProjectionBlock,
    hpm: Linear,
    local: Linear,
    training: AtomicBool,
}

impl GaitNet {
    pub fn new(config: GaitNetConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let hidden = config.hidden_dim;
        let backbone =
            ProjectionBlock::new(config.input_dim, hidden, config.dropout, vb.pp("backbone"))?;
        let spatial_pool =
            ProjectionBlock::new(hidden, hidden, config.dropout, vb.pp("spatial_pool"))?;
        let temporal_pool = ProjectionBlock::new(hidden, hidden, None, vb.pp("temporal_pool"))?;
        let hpm = candle_nn::linear(hidden, config.flat_embedding_dim(), vb.pp("hpm"))?;
        let local = candle_nn::linear(hidden, config.flat_embedding_dim(), vb.pp("local"))?;

        log::debug!(
            "built gait network: input_dim={} hidden_dim={} parts={}x{}",
            config.input_dim,
            hidden,
            config.num_parts,
            config.embedding_dim
        );

        Ok(Self {
            config,
            device: device.clone(),
            varmap,
            backbone,
            spatial_pool,
            temporal_pool,
            hpm,
            local,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &GaitNetConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn split_parts(&self, flat: &Tensor, batch: usize) -> Result<Tensor> {
        flat.reshape((batch, self.config.num_parts, self.config.embedding_dim))
    }
}

impl GaitModel for GaitNet {
    /// `sequences` is `[batch, frames, input_dim]`.
    fn forward(&self, sequences: &Tensor) -> Result<GaitEmbeddings> {
        let (batch, frames, width) = sequences.dims3()?;
        if width != self.config.input_dim {
            return Err(Error::Msg(format!(
                "expected sequences with feature width {} got {}",
                self.config.input_dim, width
            )));
        }
        if frames == 0 {
            return Err(Error::Msg("sequences must contain at least one frame".into()));
        }
        let training = self.is_training();

        let frame_features = self.backbone.forward(sequences, training)?;
        let refined = self.spatial_pool.forward(&frame_features, training)?;
        let pooled = refined.max(1)?;
        let temporal = self.temporal_pool.forward(&pooled, training)?;
        let global = self.split_parts(&self.hpm.forward(&temporal)?, batch)?;

        let local_pooled = frame_features.max(1)?;
        let local = self.split_parts(&self.local.forward(&local_pooled)?, batch)?;

        Ok(GaitEmbeddings { global, local })
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }
}
