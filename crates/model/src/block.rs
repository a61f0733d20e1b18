use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, Module, VarBuilder};

/// Linear projection followed by ReLU and, in training mode, dropout.
///
/// Accepts `[batch, in]` or `[batch, frames, in]` inputs; the projection is
/// applied to the trailing dimension.
pub struct ProjectionBlock {
    linear: Linear,
    dropout_p: Option<f32>,
}

impl ProjectionBlock {
    pub fn new(in_dim: usize, out_dim: usize, dropout_p: Option<f32>, vb: VarBuilder) -> Result<Self> {
        let linear = candle_nn::linear(in_dim, out_dim, vb)?;
        Ok(Self { linear, dropout_p })
    }

    pub fn forward(&self, xs: &Tensor, training: bool) -> Result<Tensor> {
        let hidden = self.linear.forward(xs)?.relu()?;
        match self.dropout_p {
            Some(p) if training && p > 0.0 => ops::dropout(&hidden, p),
            _ => Ok(hidden),
        }
    }
}
