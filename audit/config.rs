//! # Run Configuration
//!
//! The resolved settings of a training run, persisted as `config.toml` in the
//! experiment directory so a run can be reproduced, and the numbered
//! experiment directory layout (`<output>/<stage>/exp<N>`).

use crate::heads::Head;
use crate::metrics::MetricOptions;
use crate::model::ModelConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const TRAIN_FEATURES_FILE: &str = "data_X_train_new.npy";
pub const TRAIN_LABELS_FILE: &str = "data_y_train_new.npy";
pub const TEST_FEATURES_FILE: &str = "data_X_final_test.npy";
pub const TEST_LABELS_FILE: &str = "data_y_final_test.npy";

/// File name of the persisted run configuration.
pub const RUN_CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which parameters the optimiser updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerScope {
    /// Only the network parameters; the loss weights stay at their initial value.
    #[default]
    ModelOnly,
    /// Network parameters and the per-head loss weights.
    ModelAndLossWeights,
}

impl OptimizerScope {
    pub fn includes_loss_weights(self) -> bool {
        matches!(self, OptimizerScope::ModelAndLossWeights)
    }
}

/// Validation quantity that decides when a fold's checkpoint is replaced.
///
/// Written as `acc:<head>`, `auc:<head>`, `f1:<head>` or `loss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SelectionMetric {
    Accuracy(Head),
    Auc(Head),
    F1(Head),
    /// Mean validation loss; lower is better.
    Loss,
}

impl Default for SelectionMetric {
    fn default() -> Self {
        SelectionMetric::Accuracy(Head::IcuMortality)
    }
}

impl fmt::Display for SelectionMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head_name = |head: &Head| {
            clap::ValueEnum::to_possible_value(head)
                .map(|v| v.get_name().to_string())
                .unwrap_or_else(|| head.short_name().to_string())
        };
        match self {
            SelectionMetric::Accuracy(head) => write!(f, "acc:{}", head_name(head)),
            SelectionMetric::Auc(head) => write!(f, "auc:{}", head_name(head)),
            SelectionMetric::F1(head) => write!(f, "f1:{}", head_name(head)),
            SelectionMetric::Loss => f.write_str("loss"),
        }
    }
}

impl FromStr for SelectionMetric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("loss") {
            return Ok(SelectionMetric::Loss);
        }
        let invalid = || {
            ConfigError::Invalid(format!(
                "selection metric '{s}' must be 'loss' or one of acc:/auc:/f1: followed by a head name"
            ))
        };
        let (kind, head) = s.split_once(':').ok_or_else(invalid)?;
        let head: Head = clap::ValueEnum::from_str(head, true).map_err(|_| invalid())?;
        if !head.is_active() {
            return Err(ConfigError::Invalid(format!(
                "head '{head}' is a regression head and cannot select checkpoints"
            )));
        }
        match kind.to_ascii_lowercase().as_str() {
            "acc" | "accuracy" => Ok(SelectionMetric::Accuracy(head)),
            "auc" => Ok(SelectionMetric::Auc(head)),
            "f1" => Ok(SelectionMetric::F1(head)),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for SelectionMetric {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SelectionMetric> for String {
    fn from(value: SelectionMetric) -> Self {
        value.to_string()
    }
}

/// Everything that determines a k-fold training run apart from the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub folds: usize,
    pub seed: u64,
    /// Head whose labels stratify the folds.
    pub stratify_on: Head,
    pub optimizer_scope: OptimizerScope,
    pub selection: SelectionMetric,
    pub metrics: MetricOptions,
    pub model: ModelConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            learning_rate: 1e-3,
            batch_size: 512,
            folds: 5,
            seed: 42,
            stratify_on: Head::HospitalMortality,
            optimizer_scope: OptimizerScope::default(),
            selection: SelectionMetric::default(),
            metrics: MetricOptions::default(),
            model: ModelConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if !self.stratify_on.is_active() {
            return Err(ConfigError::Invalid(format!(
                "cannot stratify on regression head '{}'",
                self.stratify_on
            )));
        }
        if self.metrics.calibration_bins == 0 {
            return Err(ConfigError::Invalid("calibration_bins must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: TrainConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }
}

/// Creates `<output>/<stage>/exp<N>`, where `N` is the number of directories
/// already present under `<output>/<stage>`.
pub fn next_experiment_dir(output: &Path, stage: &str) -> Result<PathBuf, ConfigError> {
    let stage_dir = output.join(stage);
    fs::create_dir_all(&stage_dir)?;
    let mut existing = 0usize;
    for entry in fs::read_dir(&stage_dir)? {
        if entry?.file_type()?.is_dir() {
            existing += 1;
        }
    }
    let exp_dir = stage_dir.join(format!("exp{existing}"));
    fs::create_dir_all(&exp_dir)?;
    Ok(exp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn experiment_dirs_are_numbered_by_existing_count() {
        let dir = tempdir().unwrap();
        let first = next_experiment_dir(dir.path(), "train").unwrap();
        let second = next_experiment_dir(dir.path(), "train").unwrap();
        let test = next_experiment_dir(dir.path(), "test").unwrap();
        assert_eq!(first, dir.path().join("train").join("exp0"));
        assert_eq!(second, dir.path().join("train").join("exp1"));
        assert_eq!(test, dir.path().join("test").join("exp0"));
        assert!(second.is_dir());
    }

    #[test]
    fn stray_files_do_not_count_as_experiments() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("train")).unwrap();
        fs::write(dir.path().join("train").join("notes.txt"), "x").unwrap();
        let exp = next_experiment_dir(dir.path(), "train").unwrap();
        assert!(exp.ends_with("exp0"));
    }

    #[test]
    fn selection_metric_parses_and_prints() {
        assert_eq!("loss".parse::<SelectionMetric>().unwrap(), SelectionMetric::Loss);
        assert_eq!(
            "auc:die-24".parse::<SelectionMetric>().unwrap(),
            SelectionMetric::Auc(Head::DieWithin24h)
        );
        assert_eq!(SelectionMetric::default().to_string(), "acc:icu");
        assert!("auc:los-icu".parse::<SelectionMetric>().is_err());
        assert!("median:icu".parse::<SelectionMetric>().is_err());
        assert!("icu".parse::<SelectionMetric>().is_err());
    }

    #[test]
    fn train_config_round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(RUN_CONFIG_FILE);
        let config = TrainConfig {
            epochs: 3,
            selection: SelectionMetric::F1(Head::HospitalMortality),
            optimizer_scope: OptimizerScope::ModelAndLossWeights,
            ..TrainConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(TrainConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let zero_batch = TrainConfig {
            batch_size: 0,
            ..TrainConfig::default()
        };
        assert!(zero_batch.validate().is_err());
        let regression_strata = TrainConfig {
            stratify_on: Head::IcuLengthOfStay,
            ..TrainConfig::default()
        };
        assert!(regression_strata.validate().is_err());
        assert!(TrainConfig::default().validate().is_ok());
    }
}
