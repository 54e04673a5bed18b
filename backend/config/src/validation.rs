//! Config validation with path-qualified messages.

use thiserror::Error;

use crate::schema::EquaforgeConfig;

#[derive(Debug, Error)]
#[error("config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// All errors and warnings found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

pub fn validate(config: &EquaforgeConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_broker(config, &mut report);
    validate_queues(config, &mut report);
    validate_training(config, &mut report);
    validate_programs(config, &mut report);
    validate_workers(config, &mut report);
    validate_logging(config, &mut report);
    report
}

fn validate_broker(config: &EquaforgeConfig, report: &mut ValidationReport) {
    let broker = &config.broker;
    if broker.connect_attempts() == 0 {
        report.error("broker.connect_attempts", "must be at least 1");
    }
    if broker.poll_interval_ms == Some(0) {
        report.error("broker.poll_interval_ms", "must be greater than 0");
    }
    if broker.visibility_timeout_secs == Some(0) {
        report.error("broker.visibility_timeout_secs", "must be greater than 0");
    }
    if let Some(model_timeout) = config.model.timeout() {
        if broker.visibility_timeout() <= model_timeout {
            report.warn(
                "broker.visibility_timeout_secs",
                "not longer than model.timeout_secs; a slow inference rides on lease renewal \
                 and is delivered again if one renewal is late",
            );
        }
    }
}

fn validate_queues(config: &EquaforgeConfig, report: &mut ValidationReport) {
    let queues = &config.queues;
    let names = [
        ("queues.image", queues.image()),
        ("queues.result", queues.result()),
        ("queues.training", queues.training()),
    ];
    for (path, name) in names {
        if name.trim().is_empty() {
            report.error(path, "queue name cannot be empty");
        }
    }
    for (i, (path, name)) in names.iter().enumerate() {
        if names[..i].iter().any(|(_, other)| other == name) {
            report.error(*path, format!("queue name '{name}' is used twice"));
        }
    }
}

fn validate_training(config: &EquaforgeConfig, report: &mut ValidationReport) {
    let training = &config.training;
    if training.min_train_batch_size() == 0 {
        report.error(
            "training.min_train_batch_size",
            "must be at least 1 so the training partition is non-empty",
        );
    }
    if training.max_batch_size() == 0 {
        report.error("training.max_batch_size", "must be greater than 0");
    }
}

fn validate_programs(config: &EquaforgeConfig, report: &mut ValidationReport) {
    let model = &config.model;
    match model.program.as_deref().map(str::trim) {
        None | Some("") => report.warn(
            "model.program",
            "no OCR program configured; inference workers cannot start",
        ),
        Some(_) => {
            if !model.args.iter().any(|a| a.contains("{image}")) {
                report.error("model.args", "must reference the {image} placeholder");
            }
        }
    }

    let trainer = &config.trainer;
    match trainer.program.as_deref().map(str::trim) {
        None | Some("") => report.warn(
            "trainer.program",
            "no trainer configured; training coordinators cannot start",
        ),
        Some(_) => {
            if !trainer.args.iter().any(|a| a.contains("{config}")) {
                report.error("trainer.args", "must reference the {config} placeholder");
            }
            if trainer.timeout().is_none() {
                report.warn(
                    "trainer.timeout_secs",
                    "unbounded; a hung trainer keeps its correction leased and its batch \
                     claimed until the process is killed",
                );
            }
        }
    }
    let extension = trainer.weights_extension();
    if extension.is_empty() || extension.starts_with('.') {
        report.error(
            "trainer.weights_extension",
            "must be a bare extension such as 'pth'",
        );
    }
}

fn validate_workers(config: &EquaforgeConfig, report: &mut ValidationReport) {
    let workers = &config.workers;
    if workers.inference() + workers.result_sink() + workers.coordinator() == 0 {
        report.warn("workers", "launch would start no processes");
    }
    if workers.result_sink() > 1 {
        report.warn(
            "workers.result_sink",
            "result sinks in separate processes race on the display index file",
        );
    }
}

fn validate_logging(config: &EquaforgeConfig, report: &mut ValidationReport) {
    const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
    let level = config.logging.level();
    if !LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        report.error(
            "logging.level",
            format!("unknown level '{level}', expected one of {}", LEVELS.join(", ")),
        );
    }
}
