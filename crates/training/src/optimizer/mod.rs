use std::{collections::HashMap, fmt, str::FromStr};

pub mod group;

pub use group::{GroupSpec, GroupStates, MultiOptimizerGroup, PreparedGroupStates};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(TrainingError::configuration(format!(
                "unknown optimizer kind '{}' (expected SGD or Adam)",
                other
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => f.write_str("SGD"),
            OptimizerKind::Adam => f.write_str("Adam"),
        }
    }
}

/// Update rule plus its hyperparameters, resolved once from configuration.
#[derive(Debug, Clone, Copy)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    Adam(AdamConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl TryFrom<&config::OptimizerConfig> for OptimizerConfig {
    type Error = TrainingError;

    fn try_from(value: &config::OptimizerConfig) -> Result<Self, Self::Error> {
        // The real learning rate comes from each group's schedule on every step.
        match value.kind.parse::<OptimizerKind>()? {
            OptimizerKind::Sgd => Ok(OptimizerConfig::Sgd(SgdConfig {
                learning_rate: 0.0,
                momentum: value.momentum,
                weight_decay: value.weight_decay,
                nesterov: value.nesterov,
            })),
            OptimizerKind::Adam => Ok(OptimizerConfig::Adam(AdamConfig {
                learning_rate: 0.0,
                beta1: value.beta1,
                beta2: value.beta2,
                epsilon: value.epsilon,
                weight_decay: value.weight_decay,
            })),
        }
    }
}

impl OptimizerConfig {
    pub fn kind(&self) -> OptimizerKind {
        match self {
            OptimizerConfig::Sgd(_) => OptimizerKind::Sgd,
            OptimizerConfig::Adam(_) => OptimizerKind::Adam,
        }
    }
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    /// Momentum buffer for SGD, first moment for Adam.
    first_moment: Tensor,
    /// Adam only.
    second_moment: Option<Tensor>,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment = match config {
                OptimizerConfig::Adam(_) => Some(
                    Tensor::zeros(shape.as_slice(), DType::F32, device)
                        .map_err(to_runtime_error)?,
                ),
                OptimizerConfig::Sgd(_) => None,
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.config.kind()
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::Adam(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::Adam(cfg) => cfg.learning_rate = lr,
        }
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    pub fn parameter_count(&self) -> usize {
        self.params
            .iter()
            .map(|slot| slot.param.as_tensor().elem_count())
            .sum()
    }

    /// L2 norm over every parameter this optimizer owns.
    pub fn parameter_norm(&self) -> Result<f64, TrainingError> {
        let mut total = 0.0;
        for slot in &self.params {
            let norm = tensor_l2_norm(slot.param.as_tensor())?;
            total += norm * norm;
        }
        Ok(total.sqrt())
    }

    pub(crate) fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.params.iter().map(|slot| slot.param.as_tensor())
    }

    /// Applies one update to every owned parameter that has a gradient in
    /// `grads`, consuming those gradients.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();

        for (idx, slot) in self.params.iter().enumerate() {
            let grad = match grads.remove(slot.param.as_tensor()) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            processed.push(ProcessedGradient { index: idx, grad });
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        match self.config {
            OptimizerConfig::Sgd(cfg) => self.step_sgd(cfg, processed),
            OptimizerConfig::Adam(cfg) => self.step_adam(cfg, processed),
        }
    }

    fn step_sgd(
        &mut self,
        cfg: SgdConfig,
        processed: Vec<ProcessedGradient>,
    ) -> Result<(), TrainingError> {
        for item in processed {
            let slot = &mut self.params[item.index];
            let base = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let grad = with_weight_decay(item.grad, &base, cfg.weight_decay)?;

            let direction = if cfg.momentum != 0.0 {
                let buffer = slot
                    .first_moment
                    .affine(cfg.momentum, 0.0)
                    .map_err(to_runtime_error)?
                    .add(&grad)
                    .map_err(to_runtime_error)?;
                let direction = if cfg.nesterov {
                    grad.add(&buffer.affine(cfg.momentum, 0.0).map_err(to_runtime_error)?)
                        .map_err(to_runtime_error)?
                } else {
                    buffer.clone()
                };
                slot.first_moment = buffer;
                direction
            } else {
                grad
            };

            let update = direction
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = base.sub(&update).map_err(to_runtime_error)?;
            write_back(slot, next)?;
        }
        Ok(())
    }

    fn step_adam(
        &mut self,
        cfg: AdamConfig,
        processed: Vec<ProcessedGradient>,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];
            let base = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let grad = with_weight_decay(item.grad, &base, cfg.weight_decay)?;
            let second_moment = slot.second_moment.as_ref().ok_or_else(|| {
                TrainingError::runtime(format!("missing second moment for '{}'", slot.name))
            })?;

            let prev_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let prev_v = second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq
                .affine(1.0 - cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let next = base.sub(&update).map_err(to_runtime_error)?;
            write_back(slot, next)?;

            slot.first_moment = new_m;
            slot.second_moment = Some(new_v);
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            let first = flatten_to_vec(&slot.first_moment, numel)?;
            let second = match &slot.second_moment {
                Some(tensor) => Some(flatten_to_vec(tensor, numel)?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: first,
                second_moment: second,
            });
        }

        Ok(OptimizerState {
            kind: self.kind(),
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let prepared = self.prepare_state(state)?;
        self.commit_state(prepared);
        Ok(())
    }

    /// Checks `state` against this optimizer and builds its moment buffers
    /// without touching the live state.
    pub fn prepare_state(&self, state: OptimizerState) -> Result<PreparedState, TrainingError> {
        if state.kind != self.kind() {
            return Err(TrainingError::schema_mismatch(format!(
                "optimizer state was produced by {} but this optimizer is {}",
                state.kind,
                self.kind()
            )));
        }

        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::schema_mismatch(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;

            let dims = slot.param.as_tensor().dims();
            if dims != state.shape.as_slice() {
                return Err(TrainingError::schema_mismatch(format!(
                    "optimizer state shape mismatch for '{}': expected {:?} got {:?}",
                    slot.name, dims, state.shape
                )));
            }
            let expected = numel(dims);
            let second_ok = match (&slot.second_moment, &state.second_moment) {
                (Some(_), Some(values)) => values.len() == expected,
                (None, None) => true,
                _ => false,
            };
            if expected != state.first_moment.len() || !second_ok {
                return Err(TrainingError::schema_mismatch(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device();
            let first = Tensor::from_vec(state.first_moment, dims, device)
                .map_err(to_runtime_error)?;
            let second = match state.second_moment {
                Some(values) => {
                    Some(Tensor::from_vec(values, dims, device).map_err(to_runtime_error)?)
                }
                None => None,
            };
            restored.push((first, second));
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::schema_mismatch(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        Ok(PreparedState {
            step: state.step,
            moments: restored,
        })
    }

    pub fn commit_state(&mut self, prepared: PreparedState) {
        for (slot, (first, second)) in self.params.iter_mut().zip(prepared.moments) {
            slot.first_moment = first;
            slot.second_moment = second;
        }
        self.step = prepared.step;
    }
}

/// Optimizer state that passed validation and only needs to be installed.
#[derive(Debug)]
pub struct PreparedState {
    step: usize,
    moments: Vec<(Tensor, Option<Tensor>)>,
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
}

fn with_weight_decay(grad: Tensor, param: &Tensor, weight_decay: f64) -> Result<Tensor, TrainingError> {
    if weight_decay == 0.0 {
        return Ok(grad);
    }
    let decay = param.affine(weight_decay, 0.0).map_err(to_runtime_error)?;
    grad.add(&decay).map_err(to_runtime_error)
}

fn write_back(slot: &ParameterSlot, next: Tensor) -> Result<(), TrainingError> {
    let cast = if slot.dtype == DType::F32 {
        next
    } else {
        next.to_dtype(slot.dtype).map_err(to_runtime_error)?
    };
    slot.param.set(&cast).map_err(to_runtime_error)
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_moment: Option<Vec<f32>>,
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sgd(momentum: f64) -> OptimizerConfig {
        OptimizerConfig::Sgd(SgdConfig {
            learning_rate: 0.1,
            momentum,
            weight_decay: 0.0,
            nesterov: false,
        })
    }

    fn adam() -> OptimizerConfig {
        OptimizerConfig::Adam(AdamConfig {
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        })
    }

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn unknown_kind_is_a_configuration_error() {
        let settings = config::OptimizerConfig {
            kind: "rmsprop".into(),
            ..Default::default()
        };
        assert!(matches!(
            OptimizerConfig::try_from(&settings),
            Err(TrainingError::Configuration(_))
        ));

        let settings = config::OptimizerConfig {
            kind: "SGD".into(),
            ..Default::default()
        };
        let resolved = OptimizerConfig::try_from(&settings).unwrap();
        assert_eq!(resolved.kind(), OptimizerKind::Sgd);
    }

    #[test]
    fn sgd_step_follows_gradient() {
        let p = var(&[1.0, -2.0]);
        let mut optimizer = TrainerOptimizer::new(vec![("p".into(), p.clone())], sgd(0.0)).unwrap();
        optimizer.set_learning_rate(0.5);

        // d/dp sum(p^2) = 2p
        let loss = p.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let values = p.as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![0.0, 0.0]);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn missing_gradients_leave_parameters_untouched() {
        let p = var(&[0.5, 0.25]);
        let mut optimizer = TrainerOptimizer::new(vec![("p".into(), p.clone())], adam()).unwrap();
        optimizer.set_learning_rate(0.1);

        let other = var(&[3.0]);
        let loss = other.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        assert_eq!(p.as_tensor().to_vec1::<f32>().unwrap(), vec![0.5, 0.25]);
        assert_eq!(optimizer.step_count(), 0);
    }

    #[test]
    fn state_round_trips_through_json() {
        let p = var(&[1.0, 2.0, 3.0]);
        let mut optimizer = TrainerOptimizer::new(vec![("p".into(), p.clone())], adam()).unwrap();
        optimizer.set_learning_rate(0.01);
        let loss = p.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let state = optimizer.state().unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let decoded: OptimizerState = serde_json::from_str(&json).unwrap();

        let q = var(&[0.0, 0.0, 0.0]);
        let mut restored = TrainerOptimizer::new(vec![("p".into(), q)], adam()).unwrap();
        restored.load_state(decoded).unwrap();
        assert_eq!(restored.state().unwrap(), state);
    }

    #[test]
    fn loading_state_from_another_kind_is_a_schema_mismatch() {
        let p = var(&[1.0]);
        let optimizer = TrainerOptimizer::new(vec![("p".into(), p.clone())], sgd(0.9)).unwrap();
        let state = optimizer.state().unwrap();

        let mut other = TrainerOptimizer::new(vec![("p".into(), p)], adam()).unwrap();
        assert!(matches!(
            other.load_state(state),
            Err(TrainingError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn loading_state_with_wrong_shape_is_a_schema_mismatch() {
        let optimizer =
            TrainerOptimizer::new(vec![("p".into(), var(&[1.0, 2.0]))], sgd(0.9)).unwrap();
        let state = optimizer.state().unwrap();

        let mut other = TrainerOptimizer::new(vec![("p".into(), var(&[1.0]))], sgd(0.9)).unwrap();
        assert!(matches!(
            other.load_state(state),
            Err(TrainingError::SchemaMismatch(_))
        ));
    }
}
