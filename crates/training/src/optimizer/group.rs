use std::collections::{BTreeMap, HashMap, HashSet};

use candle_core::{backprop::GradStore, Tensor, Var};

use super::{to_runtime_error, OptimizerConfig, OptimizerState, PreparedState, TrainerOptimizer};
use crate::{scheduler::ScheduledValue, TrainingError};

/// Optimizer state of every group, keyed by group name.
pub type GroupStates = BTreeMap<String, OptimizerState>;

/// Declaration of one optimizer group before validation.
pub struct GroupSpec {
    pub name: String,
    pub parameters: Vec<(String, Var)>,
    pub optimizer: OptimizerConfig,
    pub learning_rate: Box<dyn ScheduledValue>,
}

struct OptimizerGroup {
    name: String,
    optimizer: TrainerOptimizer,
    learning_rate: Box<dyn ScheduledValue>,
}

/// Independent optimizers over disjoint slices of the model parameters,
/// driven in lockstep.
///
/// Gradients from [`MultiOptimizerGroup::backward`] are buffered until the
/// next [`MultiOptimizerGroup::step_all`] consumes them or
/// [`MultiOptimizerGroup::zero_all_gradients`] discards them.
pub struct MultiOptimizerGroup {
    groups: Vec<OptimizerGroup>,
    gradients: Option<GradStore>,
}

impl MultiOptimizerGroup {
    /// Builds the groups after checking they partition `all_parameters`
    /// exactly: no parameter twice, none left out.
    pub fn new(
        all_parameters: &[(String, Var)],
        specs: Vec<GroupSpec>,
    ) -> Result<Self, TrainingError> {
        if specs.is_empty() {
            return Err(TrainingError::configuration(
                "at least one optimizer group is required",
            ));
        }

        let known: HashSet<&str> = all_parameters.iter().map(|(name, _)| name.as_str()).collect();
        let mut owners: HashMap<&str, &str> = HashMap::new();
        let mut group_names = HashSet::new();

        for spec in &specs {
            if !group_names.insert(spec.name.as_str()) {
                return Err(TrainingError::configuration(format!(
                    "optimizer group '{}' is declared twice",
                    spec.name
                )));
            }
            for (parameter, _) in &spec.parameters {
                if !known.contains(parameter.as_str()) {
                    return Err(TrainingError::configuration(format!(
                        "optimizer group '{}' references unknown parameter '{}'",
                        spec.name, parameter
                    )));
                }
                if let Some(first) = owners.insert(parameter.as_str(), spec.name.as_str()) {
                    return Err(TrainingError::OverlappingPartition {
                        parameter: parameter.clone(),
                        first: first.to_string(),
                        second: spec.name.clone(),
                    });
                }
            }
        }

        let missing: Vec<String> = all_parameters
            .iter()
            .filter(|(name, _)| !owners.contains_key(name.as_str()))
            .map(|(name, _)| name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(TrainingError::IncompletePartition(missing));
        }

        let mut groups = Vec::with_capacity(specs.len());
        for spec in specs {
            let optimizer =
                TrainerOptimizer::new(spec.parameters, spec.optimizer).map_err(|err| match err {
                    TrainingError::Initialization(msg) => TrainingError::initialization(format!(
                        "optimizer group '{}': {}",
                        spec.name, msg
                    )),
                    other => other,
                })?;
            groups.push(OptimizerGroup {
                name: spec.name,
                optimizer,
                learning_rate: spec.learning_rate,
            });
        }

        Ok(Self {
            groups,
            gradients: None,
        })
    }

    /// Group names in declaration order.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|group| group.name.clone()).collect()
    }

    pub fn optimizer(&self, name: &str) -> Option<&TrainerOptimizer> {
        self.groups
            .iter()
            .find(|group| group.name == name)
            .map(|group| &group.optimizer)
    }

    pub fn parameter_counts(&self) -> Vec<(String, usize)> {
        self.groups
            .iter()
            .map(|group| (group.name.clone(), group.optimizer.parameter_count()))
            .collect()
    }

    pub fn parameter_norms(&self) -> Result<Vec<(String, f64)>, TrainingError> {
        self.groups
            .iter()
            .map(|group| Ok((group.name.clone(), group.optimizer.parameter_norm()?)))
            .collect()
    }

    /// Learning rate each group would use at `iteration`.
    pub fn learning_rates_at(&self, iteration: usize) -> Vec<(String, f64)> {
        self.groups
            .iter()
            .map(|group| (group.name.clone(), group.learning_rate.value_at(iteration)))
            .collect()
    }

    pub fn zero_all_gradients(&mut self) {
        if let Some(store) = self.gradients.as_mut() {
            for group in &self.groups {
                group.optimizer.zero_grad(store);
            }
        }
        self.gradients = None;
    }

    /// Backpropagates `loss` once, adding onto any gradients still buffered.
    pub fn backward(&mut self, loss: &Tensor) -> Result<(), TrainingError> {
        let fresh = loss.backward().map_err(to_runtime_error)?;
        match self.gradients.as_mut() {
            None => self.gradients = Some(fresh),
            Some(existing) => {
                for group in &self.groups {
                    for tensor in group.optimizer.tensors() {
                        let Some(grad) = fresh.get(tensor) else {
                            continue;
                        };
                        let merged = match existing.remove(tensor) {
                            Some(previous) => previous.add(grad).map_err(to_runtime_error)?,
                            None => grad.clone(),
                        };
                        existing.insert(tensor, merged);
                    }
                }
            }
        }
        Ok(())
    }

    /// Steps every group in declaration order with its learning rate at
    /// `iteration` and returns `(group, lr)` pairs in the same order.
    pub fn step_all(&mut self, iteration: usize) -> Result<Vec<(String, f64)>, TrainingError> {
        let gradients = &mut self.gradients;
        let mut rates = Vec::with_capacity(self.groups.len());
        for group in self.groups.iter_mut() {
            let lr = group.learning_rate.value_at(iteration);
            group.optimizer.set_learning_rate(lr);
            if let Some(store) = gradients.as_mut() {
                group.optimizer.step(store)?;
            }
            rates.push((group.name.clone(), lr));
        }
        Ok(rates)
    }

    pub fn save_state(&self) -> Result<GroupStates, TrainingError> {
        let mut states = GroupStates::new();
        for group in &self.groups {
            states.insert(group.name.clone(), group.optimizer.state()?);
        }
        Ok(states)
    }

    /// Restores every group. Group names must match exactly.
    pub fn load_state(&mut self, states: GroupStates) -> Result<(), TrainingError> {
        let prepared = self.prepare_state(states)?;
        self.commit_state(prepared);
        Ok(())
    }

    /// Validates the states of every group before any of them is installed.
    pub fn prepare_state(&self, mut states: GroupStates) -> Result<PreparedGroupStates, TrainingError> {
        let expected: Vec<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();
        let mut expected_sorted = expected.clone();
        expected_sorted.sort_unstable();
        let provided: Vec<&str> = states.keys().map(String::as_str).collect();
        if expected_sorted != provided {
            return Err(TrainingError::schema_mismatch(format!(
                "optimizer groups differ: expected [{}] found [{}]",
                expected.join(", "),
                provided.join(", ")
            )));
        }

        let mut prepared = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let state = states.remove(&group.name).ok_or_else(|| {
                TrainingError::schema_mismatch(format!("missing state for group '{}'", group.name))
            })?;
            let ready = group.optimizer.prepare_state(state).map_err(|err| match err {
                TrainingError::SchemaMismatch(msg) => {
                    TrainingError::schema_mismatch(format!("group '{}': {}", group.name, msg))
                }
                other => other,
            })?;
            prepared.push(ready);
        }
        Ok(PreparedGroupStates(prepared))
    }

    pub fn commit_state(&mut self, prepared: PreparedGroupStates) {
        for (group, state) in self.groups.iter_mut().zip(prepared.0) {
            group.optimizer.commit_state(state);
        }
    }
}

/// Per-group optimizer states in declaration order, already validated.
#[derive(Debug)]
pub struct PreparedGroupStates(Vec<PreparedState>);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        optimizer::{AdamConfig, SgdConfig},
        scheduler::ScheduleConfig,
    };
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    fn sgd() -> OptimizerConfig {
        OptimizerConfig::Sgd(SgdConfig {
            learning_rate: 0.0,
            momentum: 0.9,
            weight_decay: 0.0,
            nesterov: false,
        })
    }

    fn adam() -> OptimizerConfig {
        OptimizerConfig::Adam(AdamConfig {
            learning_rate: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        })
    }

    fn constant(value: f64) -> Box<dyn ScheduledValue> {
        ScheduleConfig::Constant { value }.build().unwrap()
    }

    fn spec(name: &str, params: &[(&str, &Var)], optimizer: OptimizerConfig, lr: f64) -> GroupSpec {
        GroupSpec {
            name: name.to_string(),
            parameters: params
                .iter()
                .map(|(n, v)| (n.to_string(), (*v).clone()))
                .collect(),
            optimizer,
            learning_rate: constant(lr),
        }
    }

    fn all(params: &[(&str, &Var)]) -> Vec<(String, Var)> {
        params
            .iter()
            .map(|(n, v)| (n.to_string(), (*v).clone()))
            .collect()
    }

    #[test]
    fn overlapping_groups_are_rejected() {
        let p1 = var(&[1.0]);
        let p2 = var(&[2.0]);
        let result = MultiOptimizerGroup::new(
            &all(&[("p1", &p1), ("p2", &p2)]),
            vec![
                spec("a", &[("p1", &p1), ("p2", &p2)], sgd(), 0.1),
                spec("b", &[("p2", &p2)], sgd(), 0.1),
            ],
        );
        match result {
            Err(TrainingError::OverlappingPartition {
                parameter,
                first,
                second,
            }) => {
                assert_eq!(parameter, "p2");
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected overlap error"),
        }
    }

    #[test]
    fn incomplete_groups_are_rejected() {
        let p1 = var(&[1.0]);
        let p2 = var(&[2.0]);
        let result = MultiOptimizerGroup::new(
            &all(&[("p1", &p1), ("p2", &p2)]),
            vec![spec("a", &[("p1", &p1)], sgd(), 0.1)],
        );
        match result {
            Err(TrainingError::IncompletePartition(missing)) => assert_eq!(missing, vec!["p2"]),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected incomplete partition error"),
        }
    }

    #[test]
    fn zero_gradients_leave_parameters_unchanged() {
        let p1 = var(&[1.0, 2.0]);
        let p2 = var(&[-3.0]);
        let mut groups = MultiOptimizerGroup::new(
            &all(&[("p1", &p1), ("p2", &p2)]),
            vec![
                spec("a", &[("p1", &p1)], sgd(), 0.5),
                spec("b", &[("p2", &p2)], adam(), 0.5),
            ],
        )
        .unwrap();

        // Every gradient of `0 * (p1 + p2)` is exactly zero.
        let loss = p1
            .as_tensor()
            .sum_all()
            .unwrap()
            .add(&p2.as_tensor().sum_all().unwrap())
            .unwrap()
            .affine(0.0, 0.0)
            .unwrap();
        groups.zero_all_gradients();
        groups.backward(&loss).unwrap();
        let rates = groups.step_all(0).unwrap();

        assert_eq!(rates, vec![("a".to_string(), 0.5), ("b".to_string(), 0.5)]);
        assert_eq!(p1.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(p2.as_tensor().to_vec1::<f32>().unwrap(), vec![-3.0]);

        // No backward at all is a no-op as well.
        groups.zero_all_gradients();
        groups.step_all(1).unwrap();
        assert_eq!(p1.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn groups_only_see_their_own_gradients() {
        let p1 = var(&[1.0]);
        let p2 = var(&[1.0]);
        let mut groups = MultiOptimizerGroup::new(
            &all(&[("p1", &p1), ("p2", &p2)]),
            vec![
                spec("a", &[("p1", &p1)], sgd(), 0.1),
                spec("b", &[("p2", &p2)], sgd(), 0.1),
            ],
        )
        .unwrap();

        // Only p1 influences the loss.
        let loss = p1.as_tensor().sqr().unwrap().sum_all().unwrap();
        groups.backward(&loss).unwrap();
        groups.step_all(0).unwrap();

        let state = groups.save_state().unwrap();
        assert_eq!(state["a"].step, 1);
        assert_ne!(state["a"].parameters[0].first_moment, vec![0.0]);
        assert_eq!(state["b"].step, 0);
        assert_eq!(state["b"].parameters[0].first_moment, vec![0.0]);
        assert_eq!(p2.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
        assert_ne!(p1.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
    }

    #[test]
    fn buffered_gradients_accumulate_until_zeroed() {
        let p = var(&[1.0]);
        let mut groups = MultiOptimizerGroup::new(
            &all(&[("p", &p)]),
            vec![spec(
                "a",
                &[("p", &p)],
                OptimizerConfig::Sgd(SgdConfig {
                    learning_rate: 0.0,
                    momentum: 0.0,
                    weight_decay: 0.0,
                    nesterov: false,
                }),
                1.0,
            )],
        )
        .unwrap();

        // Two backward passes of sum(p) leave a gradient of 2.
        let loss = p.as_tensor().sum_all().unwrap();
        groups.backward(&loss).unwrap();
        groups.backward(&loss).unwrap();
        groups.step_all(0).unwrap();
        assert_eq!(p.as_tensor().to_vec1::<f32>().unwrap(), vec![-1.0]);
    }

    #[test]
    fn loading_a_different_group_set_is_a_schema_mismatch() {
        let p1 = var(&[1.0]);
        let p2 = var(&[1.0]);
        let params = all(&[("p1", &p1), ("p2", &p2)]);
        let split = MultiOptimizerGroup::new(
            &params,
            vec![
                spec("a", &[("p1", &p1)], sgd(), 0.1),
                spec("b", &[("p2", &p2)], sgd(), 0.1),
            ],
        )
        .unwrap();
        let mut merged = MultiOptimizerGroup::new(
            &params,
            vec![spec("a", &[("p1", &p1), ("p2", &p2)], sgd(), 0.1)],
        )
        .unwrap();

        let state = split.save_state().unwrap();
        assert!(matches!(
            merged.load_state(state),
            Err(TrainingError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn failed_restore_leaves_every_group_untouched() {
        let p1 = var(&[1.0]);
        let p2 = var(&[1.0]);
        let params = all(&[("p1", &p1), ("p2", &p2)]);
        let mut source = MultiOptimizerGroup::new(
            &params,
            vec![
                spec("a", &[("p1", &p1)], sgd(), 0.1),
                spec("b", &[("p2", &p2)], adam(), 0.1),
            ],
        )
        .unwrap();
        let loss = p1.as_tensor().add(p2.as_tensor()).unwrap().sum_all().unwrap();
        source.backward(&loss).unwrap();
        source.step_all(0).unwrap();
        let state = source.save_state().unwrap();
        assert_eq!(state["a"].step, 1);

        // Group "a" would restore cleanly; group "b" has the wrong kind.
        let mut target = MultiOptimizerGroup::new(
            &params,
            vec![
                spec("a", &[("p1", &p1)], sgd(), 0.1),
                spec("b", &[("p2", &p2)], sgd(), 0.1),
            ],
        )
        .unwrap();
        assert!(matches!(
            target.load_state(state),
            Err(TrainingError::SchemaMismatch(_))
        ));
        assert_eq!(target.optimizer("a").unwrap().step_count(), 0);
        assert_eq!(target.optimizer("b").unwrap().step_count(), 0);
    }

    #[test]
    fn parameter_counts_are_element_counts() {
        let p1 = var(&[1.0, 2.0, 3.0]);
        let p2 = var(&[1.0]);
        let groups = MultiOptimizerGroup::new(
            &all(&[("p1", &p1), ("p2", &p2)]),
            vec![
                spec("a", &[("p1", &p1)], sgd(), 0.1),
                spec("b", &[("p2", &p2)], sgd(), 0.1),
            ],
        )
        .unwrap();
        assert_eq!(
            groups.parameter_counts(),
            vec![("a".to_string(), 3), ("b".to_string(), 1)]
        );
    }
}
