use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use env_logger::Env;
use serde_json::{Number, Value};
use training::{config::ResumeConfig, Trainer, TrainingConfig, TrainingError};

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        log::error!("{err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Gait recognition training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from the latest checkpoint if available")]
    resume: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if args.resume && config.runtime.resume.is_none() {
        config.runtime.resume = Some(ResumeConfig {
            iteration: None,
            restore_optimizer: true,
            keep_iteration: true,
        });
    }
    config.validate()?;

    let mut trainer = Trainer::from_config(config)?;
    let summary = trainer.train()?;

    log::info!(
        "done after {} iterations in {:.1}s; best {:?} at iteration {:?}",
        summary.iterations,
        summary.elapsed.as_secs_f64(),
        summary.best_score,
        summary.best_iteration
    );
    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let segments = parse_path(&override_arg.path)?;
        assign_at_path(
            &mut value,
            &segments,
            parse_override_value(&override_arg.value),
        )?;
        log::info!("override {} = {}", override_arg.path, override_arg.value);
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("config is invalid after overrides: {err}"))
    })
}

/// Interprets a raw override as a JSON scalar or literal, falling back to a
/// plain string.
fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// Splits `runtime.checkpoint.every_n_iters` or `groups[1].learning_rate.base`
/// into keys and array indices.
fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, rest) = match part.split_once('[') {
            Some((key, rest)) => (key, Some(rest)),
            None => (part, None),
        };
        if key.is_empty() {
            return Err(TrainingError::configuration(format!(
                "empty key in override path '{path}'"
            )));
        }
        segments.push(PathSegment::Key(key.to_string()));
        if let Some(rest) = rest {
            for index in rest.split('[') {
                let index = index.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    TrainingError::configuration(format!(
                        "invalid index in override path '{path}': {err}"
                    ))
                })?;
                segments.push(PathSegment::Index(index));
            }
        }
    }
    Ok(segments)
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    let child = match segment {
        PathSegment::Key(key) => {
            if target.is_null() {
                *target = Value::Object(serde_json::Map::new());
            }
            let map = target.as_object_mut().ok_or_else(|| {
                TrainingError::configuration(format!(
                    "override key '{key}' points into a non-object value"
                ))
            })?;
            map.entry(key.clone()).or_insert(Value::Null)
        }
        PathSegment::Index(index) => {
            if target.is_null() {
                *target = Value::Array(Vec::new());
            }
            let array = target.as_array_mut().ok_or_else(|| {
                TrainingError::configuration(format!(
                    "override index [{index}] points into a non-array value"
                ))
            })?;
            if array.len() <= *index {
                array.resize(*index + 1, Value::Null);
            }
            &mut array[*index]
        }
    };
    assign_at_path(child, rest, new_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[data]
train = "train"
test = "test"

[model]
input_dim = 16
"#;

    fn arg(raw: &str) -> OverrideArg {
        raw.parse().unwrap()
    }

    #[test]
    fn paths_split_into_keys_and_indices() {
        assert_eq!(
            parse_path("groups[1].learning_rate").unwrap(),
            vec![
                PathSegment::Key("groups".into()),
                PathSegment::Index(1),
                PathSegment::Key("learning_rate".into()),
            ]
        );
        assert!(parse_path("groups[x]").is_err());
        assert!(parse_path("runtime..seed").is_err());
    }

    #[test]
    fn overrides_rewrite_nested_values() {
        let config: TrainingConfig = toml::from_str(CONFIG).unwrap();
        let config = apply_overrides(
            config,
            &[
                arg("runtime.num_iter=500"),
                arg("optimizer.kind=SGD"),
                arg(r#"groups[1].learning_rate={"kind":"constant","value":0.01}"#),
                arg("runtime.checkpoint={\"directory\":\"ckpt\"}"),
            ],
        )
        .unwrap();

        assert_eq!(config.runtime.num_iter, 500);
        assert_eq!(config.optimizer.kind, "SGD");
        assert_eq!(
            config.groups[1].learning_rate,
            training::ScheduleConfig::Constant { value: 0.01 }
        );
        assert_eq!(config.runtime.checkpoint.unwrap().every_n_iters, 1);
    }

    #[test]
    fn malformed_overrides_are_rejected() {
        assert!("no-equals".parse::<OverrideArg>().is_err());
        let config: TrainingConfig = toml::from_str(CONFIG).unwrap();
        assert!(apply_overrides(config, &[arg("runtime.num_iter.inner=3")]).is_err());
    }
}
