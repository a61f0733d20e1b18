use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Maps an iteration index to a scalar.
///
/// Implementations are pure: `value_at(n)` returns the same value no matter
/// how often or in what order it is queried. The same trait drives both
/// learning rates and loss weights.
pub trait ScheduledValue: Send + Sync {
    fn value_at(&self, iteration: usize) -> f64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Constant {
        value: f64,
    },
    /// Multiplies `base` by `gamma` at every milestone already reached.
    StepDecay {
        base: f64,
        #[serde(default = "default_gamma")]
        gamma: f64,
        #[serde(default)]
        milestones: Vec<usize>,
    },
    LinearWarmupCosine {
        base: f64,
        #[serde(default)]
        min: f64,
        #[serde(default)]
        warmup: usize,
        total: usize,
    },
    Polynomial {
        base: f64,
        #[serde(default)]
        min: f64,
        #[serde(default)]
        warmup: usize,
        total: usize,
        #[serde(default = "default_power")]
        power: f64,
    },
    /// Holds `start` until `from`, moves linearly to `end` at `to`, then holds.
    LinearRamp {
        start: f64,
        end: f64,
        from: usize,
        to: usize,
    },
}

impl ScheduleConfig {
    /// Lists everything wrong with this schedule, each message prefixed by
    /// `label`. Learning rates and loss weights share these rules.
    pub fn problems(&self, label: &str) -> Vec<String> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, message: &str| {
            if !ok {
                errors.push(format!("{}: {}", label, message));
            }
        };

        match self {
            ScheduleConfig::Constant { value } => {
                check(value.is_finite(), "value must be finite");
            }
            ScheduleConfig::StepDecay {
                base,
                gamma,
                milestones,
            } => {
                check(base.is_finite(), "base must be finite");
                check(*gamma >= 0.0 && gamma.is_finite(), "gamma must be >= 0");
                check(
                    milestones.windows(2).all(|pair| pair[0] < pair[1]),
                    "milestones must be strictly increasing",
                );
            }
            ScheduleConfig::LinearWarmupCosine {
                base,
                min,
                warmup,
                total,
            }
            | ScheduleConfig::Polynomial {
                base,
                min,
                warmup,
                total,
                ..
            } => {
                check(*total > 0, "total must be greater than 0");
                check(warmup <= total, "warmup cannot exceed total");
                check(min <= base, "min cannot exceed base");
            }
            ScheduleConfig::LinearRamp { from, to, .. } => {
                check(from <= to, "from cannot exceed to");
            }
        }

        if let ScheduleConfig::Polynomial { power, .. } = self {
            check(*power > 0.0, "power must be greater than 0");
        }

        check(self.lower_bound() >= 0.0, "values must be >= 0");

        errors
    }

    /// Smallest value the schedule can produce over any iteration.
    pub fn lower_bound(&self) -> f64 {
        match self {
            ScheduleConfig::Constant { value } => *value,
            ScheduleConfig::StepDecay {
                base,
                gamma,
                milestones,
            } => {
                let decayed = base * gamma.powi(milestones.len() as i32);
                base.min(decayed)
            }
            ScheduleConfig::LinearWarmupCosine { base, min, .. }
            | ScheduleConfig::Polynomial { base, min, .. } => base.min(*min),
            ScheduleConfig::LinearRamp { start, end, .. } => start.min(*end),
        }
    }

    pub fn build(&self) -> Result<Box<dyn ScheduledValue>, TrainingError> {
        let problems = self.problems("schedule");
        if !problems.is_empty() {
            return Err(TrainingError::initialization(problems.join("; ")));
        }

        Ok(match self.clone() {
            ScheduleConfig::Constant { value } => Box::new(Constant { value }),
            ScheduleConfig::StepDecay {
                base,
                gamma,
                milestones,
            } => Box::new(StepDecay {
                base,
                gamma,
                milestones,
            }),
            ScheduleConfig::LinearWarmupCosine {
                base,
                min,
                warmup,
                total,
            } => Box::new(LinearWarmupCosine {
                base,
                min,
                warmup,
                total,
            }),
            ScheduleConfig::Polynomial {
                base,
                min,
                warmup,
                total,
                power,
            } => Box::new(PolynomialDecay {
                base,
                min,
                warmup,
                total,
                power,
            }),
            ScheduleConfig::LinearRamp {
                start,
                end,
                from,
                to,
            } => Box::new(LinearRamp {
                start,
                end,
                from,
                to,
            }),
        })
    }
}

fn default_gamma() -> f64 {
    0.1
}

fn default_power() -> f64 {
    1.0
}

struct Constant {
    value: f64,
}

impl ScheduledValue for Constant {
    fn value_at(&self, _iteration: usize) -> f64 {
        self.value
    }
}

struct StepDecay {
    base: f64,
    gamma: f64,
    milestones: Vec<usize>,
}

impl ScheduledValue for StepDecay {
    fn value_at(&self, iteration: usize) -> f64 {
        let passed = self
            .milestones
            .iter()
            .take_while(|&&milestone| milestone <= iteration)
            .count();
        self.base * self.gamma.powi(passed as i32)
    }
}

struct LinearWarmupCosine {
    base: f64,
    min: f64,
    warmup: usize,
    total: usize,
}

impl ScheduledValue for LinearWarmupCosine {
    fn value_at(&self, iteration: usize) -> f64 {
        if self.warmup > 0 && iteration < self.warmup {
            let progress = (iteration + 1) as f64 / self.warmup as f64;
            return self.base * progress;
        }

        if self.total <= self.warmup {
            return self.base.max(self.min);
        }

        let effective = iteration.saturating_sub(self.warmup) as f64;
        let denom = (self.total - self.warmup).max(1) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);
        let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
        self.min + (self.base - self.min) * cosine
    }
}

struct PolynomialDecay {
    base: f64,
    min: f64,
    warmup: usize,
    total: usize,
    power: f64,
}

impl ScheduledValue for PolynomialDecay {
    fn value_at(&self, iteration: usize) -> f64 {
        if self.warmup > 0 && iteration < self.warmup {
            let progress = (iteration + 1) as f64 / self.warmup as f64;
            return self.base * progress;
        }

        if self.total <= self.warmup {
            return self.min;
        }

        let denom = (self.total - self.warmup).max(1) as f64;
        let effective = iteration.saturating_sub(self.warmup) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);
        let decay = (1.0 - progress).max(0.0).powf(self.power);
        self.min + (self.base - self.min) * decay
    }
}

struct LinearRamp {
    start: f64,
    end: f64,
    from: usize,
    to: usize,
}

impl ScheduledValue for LinearRamp {
    fn value_at(&self, iteration: usize) -> f64 {
        if iteration <= self.from {
            return self.start;
        }
        if iteration >= self.to {
            return self.end;
        }
        let span = (self.to - self.from) as f64;
        let progress = (iteration - self.from) as f64 / span;
        self.start + (self.end - self.start) * progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn values_do_not_depend_on_query_order() {
        let schedules = [
            ScheduleConfig::StepDecay {
                base: 0.1,
                gamma: 0.1,
                milestones: vec![3, 7],
            },
            ScheduleConfig::LinearWarmupCosine {
                base: 1.0,
                min: 0.1,
                warmup: 2,
                total: 10,
            },
            ScheduleConfig::LinearRamp {
                start: 1.0,
                end: 0.0,
                from: 2,
                to: 6,
            },
        ];

        for config in schedules {
            let schedule = config.build().unwrap();
            let forward: Vec<f64> = (0..12).map(|i| schedule.value_at(i)).collect();
            let backward: Vec<f64> = (0..12).rev().map(|i| schedule.value_at(i)).collect();
            let mut backward = backward;
            backward.reverse();
            assert_eq!(forward, backward);
            assert_eq!(schedule.value_at(5), schedule.value_at(5));
        }
    }

    #[test]
    fn step_decay_applies_reached_milestones() {
        let schedule = ScheduleConfig::StepDecay {
            base: 1.0,
            gamma: 0.5,
            milestones: vec![10, 20],
        }
        .build()
        .unwrap();

        assert!(approx(schedule.value_at(0), 1.0));
        assert!(approx(schedule.value_at(9), 1.0));
        assert!(approx(schedule.value_at(10), 0.5));
        assert!(approx(schedule.value_at(25), 0.25));
    }

    #[test]
    fn linear_ramp_clamps_outside_window() {
        let schedule = ScheduleConfig::LinearRamp {
            start: 1.0,
            end: 0.2,
            from: 10,
            to: 20,
        }
        .build()
        .unwrap();

        assert!(approx(schedule.value_at(0), 1.0));
        assert!(approx(schedule.value_at(15), 0.6));
        assert!(approx(schedule.value_at(20), 0.2));
        assert!(approx(schedule.value_at(1_000), 0.2));
    }

    #[test]
    fn cosine_reaches_min_at_total() {
        let schedule = ScheduleConfig::LinearWarmupCosine {
            base: 1.0,
            min: 0.1,
            warmup: 0,
            total: 100,
        }
        .build()
        .unwrap();

        assert!(approx(schedule.value_at(0), 1.0));
        assert!(approx(schedule.value_at(100), 0.1));
        assert!(approx(schedule.value_at(500), 0.1));
    }

    #[test]
    fn negative_loss_weights_are_rejected() {
        let ramp = ScheduleConfig::LinearRamp {
            start: 1.0,
            end: -0.5,
            from: 0,
            to: 10,
        };
        assert_eq!(ramp.problems("w").len(), 1);

        let ok = ScheduleConfig::Constant { value: 0.0 };
        assert!(ok.problems("w").is_empty());
    }

    #[test]
    fn negative_learning_rates_fail_to_build() {
        let schedule = ScheduleConfig::StepDecay {
            base: -0.1,
            gamma: 0.1,
            milestones: vec![10],
        };
        assert!(matches!(
            schedule.build(),
            Err(TrainingError::Initialization(_))
        ));
    }

    #[test]
    fn inconsistent_schedules_fail_to_build() {
        let config = ScheduleConfig::Polynomial {
            base: 0.1,
            min: 0.5,
            warmup: 20,
            total: 10,
            power: 2.0,
        };
        assert!(matches!(
            config.build(),
            Err(TrainingError::Initialization(_))
        ));
    }
}
