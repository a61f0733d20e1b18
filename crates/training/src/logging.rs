use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::{LoggingConfig, TargetEmbedding},
    evaluation::EvaluationReport,
    metrics::Meter,
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Meter averages and schedule values at the end of one log interval.
#[derive(Debug, Clone)]
pub struct IntervalReport {
    pub iteration: usize,
    pub learning_rates: Vec<(String, f64)>,
    pub early_weight: f64,
    pub local_weight: f64,
    pub averages: Vec<(Meter, f64)>,
}

impl IntervalReport {
    pub fn average(&self, meter: Meter) -> Option<f64> {
        self.averages
            .iter()
            .find(|(key, _)| *key == meter)
            .map(|(_, value)| *value)
    }
}

/// Scalar sink: stdout lines plus an optional TensorBoard event file.
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn log_scalar(&mut self, tag: &str, value: f64, iteration: usize) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.write_scalar(tag, iteration as i64, value) {
                log::warn!("dropping scalar {tag}: {err}");
            }
        }
    }

    pub fn log_interval(&mut self, report: &IntervalReport) {
        if self.settings.enable_stdout {
            let mut line = format!("Iter: {}", report.iteration);
            for (group, lr) in &report.learning_rates {
                line.push_str(&format!(" - lr_{group}: {lr:.2e}"));
            }
            line.push_str(&format!(
                " - w_early: {:.3} - w_local: {:.3}",
                report.early_weight, report.local_weight
            ));
            for (meter, value) in &report.averages {
                let name = meter.tag().trim_start_matches("train/");
                line.push_str(&format!(" - {name}: {value:.4}"));
            }
            println!("{line}");
        }

        let iteration = report.iteration;
        for (group, lr) in &report.learning_rates {
            self.log_scalar(&format!("lr/{group}"), *lr, iteration);
        }
        self.log_scalar("weight/early", report.early_weight, iteration);
        self.log_scalar("weight/local", report.local_weight, iteration);
        for (meter, value) in &report.averages {
            self.log_scalar(meter.tag(), *value, iteration);
        }
    }

    pub fn log_evaluation(&mut self, iteration: usize, report: &EvaluationReport) {
        for (target, scores) in [
            (TargetEmbedding::Full, &report.full),
            (TargetEmbedding::Local, &report.local),
        ] {
            if self.settings.enable_stdout {
                let summary = scores
                    .iter()
                    .map(|score| format!("{}={:.2}%", score.name, score.accuracy * 100.0))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!(
                    "eval iter={} {} acc: {} ({} samples)",
                    iteration,
                    target.as_str(),
                    summary,
                    report.samples
                );
            }
            for score in scores {
                let tag = format!("test/{}_acc/{}", target.as_str(), score.name);
                self.log_scalar(&tag, score.accuracy, iteration);
            }
        }
    }

    pub fn log_parameter_norms(&mut self, iteration: usize, norms: &[(String, f64)]) {
        for (group, norm) in norms {
            log::debug!("iter {iteration} parameter norm {group}: {norm:.4}");
            self.log_scalar(&format!("param_norm/{group}"), *norm, iteration);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let timestamp = current_unix_timestamp();
        let hostname = hostname();
        let filename = format!("events.out.tfevents.{}.{}", timestamp, hostname);
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        log::info!("writing tensorboard events to {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
