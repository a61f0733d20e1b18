use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Shape hyperparameters for the reference gait embedding network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaitNetConfig {
    /// Per-frame feature width of the input sequences.
    pub input_dim: usize,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    /// Number of horizontal bins produced by the pyramid head.
    #[serde(default = "default_num_parts")]
    pub num_parts: usize,
    #[serde(default)]
    pub dropout: Option<f32>,
}

impl GaitNetConfig {
    pub fn new(input_dim: usize) -> Self {
        Self {
            input_dim,
            hidden_dim: default_hidden_dim(),
            embedding_dim: default_embedding_dim(),
            num_parts: default_num_parts(),
            dropout: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::Msg("input_dim must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.embedding_dim == 0 {
            return Err(Error::Msg("embedding_dim must be greater than zero".into()));
        }
        if self.num_parts == 0 {
            return Err(Error::Msg("num_parts must be greater than zero".into()));
        }
        if let Some(p) = self.dropout {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("dropout must be in [0, 1)".into()));
            }
        }
        Ok(())
    }

    /// Flattened width of one embedding: `num_parts * embedding_dim`.
    pub fn flat_embedding_dim(&self) -> usize {
        self.num_parts * self.embedding_dim
    }
}

fn default_hidden_dim() -> usize {
    128
}

fn default_embedding_dim() -> usize {
    64
}

fn default_num_parts() -> usize {
    4
}
