//! # Multi-Head Sequence Model
//!
//! A stacked LSTM encoder over `[batch x seq_len x features]` whose hidden
//! state at the last sequence position feeds six output heads:
//!
//! - the four binary heads are `Linear -> sigmoid`,
//! - both length-of-stay heads share one `Linear/ReLU` MLP, so their two
//!   output columns are always identical.
//!
//! The bidirectional variant runs a second LSTM per layer over the reversed
//! sequence and concatenates both directions, so the final representation
//! has `2 * hidden_size` features.
//!
//! [`WeightedMultiHeadLoss`] holds one learnable weight per head. Only the
//! active binary heads contribute; the regression weights are carried but
//! unused.

use crate::heads::{Head, NUM_LABEL_COLUMNS, NUM_OUTPUTS};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::rnn::{Direction, LSTM, LSTMConfig, RNN};
use candle_nn::{Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the architecture file stored next to every checkpoint.
pub const MODEL_CONFIG_FILE: &str = "model.toml";

/// Probabilities are clamped to `[EPS, 1 - EPS]` before taking logs.
const BCE_EPS: f64 = 1e-7;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Tensor operation failed: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("Model configuration field '{0}' must be greater than zero.")]
    ZeroSized(&'static str),
    #[error("Input has {found} features per step, but the model expects {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },
    #[error("Input sequences are empty; at least one time step is required.")]
    EmptySequence,
    #[error("No '{MODEL_CONFIG_FILE}' found next to checkpoint '{0}'.")]
    MissingConfig(PathBuf),
}

// ========================================================================================
//                                   ARCHITECTURE CONFIG
// ========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub bidirectional: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_size: 12,
            hidden_size: 128,
            num_layers: 2,
            bidirectional: false,
        }
    }
}

impl ModelConfig {
    pub fn directions(&self) -> usize {
        if self.bidirectional { 2 } else { 1 }
    }

    /// Width of the encoder representation fed to the heads.
    pub fn final_hidden_size(&self) -> usize {
        self.hidden_size * self.directions()
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.input_size == 0 {
            return Err(ModelError::ZeroSized("input_size"));
        }
        if self.hidden_size == 0 {
            return Err(ModelError::ZeroSized("hidden_size"));
        }
        if self.num_layers == 0 {
            return Err(ModelError::ZeroSized("num_layers"));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let config: ModelConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }
}

// ========================================================================================
//                                        MODEL
// ========================================================================================

struct EncoderLayer {
    forward: LSTM,
    backward: Option<LSTM>,
}

pub struct MultiHeadSequenceModel {
    config: ModelConfig,
    layers: Vec<EncoderLayer>,
    binary_heads: Vec<(Head, Linear)>,
    los_mlp: [Linear; 3],
}

impl MultiHeadSequenceModel {
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        config.validate()?;
        let lstm_vb = vb.pp("lstm");
        let mut layers = Vec::with_capacity(config.num_layers);
        for layer_idx in 0..config.num_layers {
            let in_dim = if layer_idx == 0 {
                config.input_size
            } else {
                config.final_hidden_size()
            };
            let forward = candle_nn::lstm(
                in_dim,
                config.hidden_size,
                LSTMConfig {
                    layer_idx,
                    direction: Direction::Forward,
                    ..Default::default()
                },
                lstm_vb.clone(),
            )?;
            let backward = if config.bidirectional {
                Some(candle_nn::lstm(
                    in_dim,
                    config.hidden_size,
                    LSTMConfig {
                        layer_idx,
                        direction: Direction::Backward,
                        ..Default::default()
                    },
                    lstm_vb.clone(),
                )?)
            } else {
                None
            };
            layers.push(EncoderLayer { forward, backward });
        }

        let width = config.final_hidden_size();
        let binary_heads = Head::ACTIVE
            .iter()
            .map(|&head| {
                let layer = candle_nn::linear(width, 1, vb.pp(format!("head_{}", head.short_name())))?;
                Ok((head, layer))
            })
            .collect::<Result<Vec<_>, candle_core::Error>>()?;

        let mlp_vb = vb.pp("los_mlp");
        let los_mlp = [
            candle_nn::linear(width, 2 * width, mlp_vb.pp("0"))?,
            candle_nn::linear(2 * width, 2 * width, mlp_vb.pp("2"))?,
            candle_nn::linear(2 * width, 1, mlp_vb.pp("4"))?,
        ];

        Ok(Self {
            config,
            layers,
            binary_heads,
            los_mlp,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Runs the encoder and every head; returns `[batch x 6]` in head order.
    pub fn predict(&self, xs: &Tensor) -> Result<Tensor, ModelError> {
        let (_, seq_len, features) = xs.dims3()?;
        if seq_len == 0 {
            return Err(ModelError::EmptySequence);
        }
        if features != self.config.input_size {
            return Err(ModelError::MismatchedFeatureCount {
                found: features,
                expected: self.config.input_size,
            });
        }
        Ok(self.forward(xs)?)
    }

    fn encode(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let seq_len = xs.dim(1)?;
        let reversed: Vec<u32> = (0..seq_len as u32).rev().collect();
        let reversed = Tensor::new(reversed.as_slice(), xs.device())?;

        let mut hidden = xs.clone();
        for layer in &self.layers {
            let states = layer.forward.seq(&hidden)?;
            let forward = layer.forward.states_to_tensor(&states)?;
            hidden = match &layer.backward {
                Some(backward) => {
                    let flipped = hidden.index_select(&reversed, 1)?;
                    let states = backward.seq(&flipped)?;
                    let backward = backward
                        .states_to_tensor(&states)?
                        .index_select(&reversed, 1)?;
                    Tensor::cat(&[&forward, &backward], 2)?
                }
                None => forward,
            };
        }
        hidden.narrow(1, seq_len - 1, 1)?.squeeze(1)
    }
}

impl Module for MultiHeadSequenceModel {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let last = self.encode(xs)?;

        let mut los = last.clone();
        for layer in &self.los_mlp {
            los = layer.forward(&los)?.relu()?;
        }

        let mut columns = Vec::with_capacity(NUM_OUTPUTS);
        for head in Head::ALL {
            let column = match self.binary_heads.iter().find(|(h, _)| *h == head) {
                Some((_, layer)) => candle_nn::ops::sigmoid(&layer.forward(&last)?)?,
                None => los.clone(),
            };
            columns.push(column);
        }
        Tensor::cat(&columns, 1)
    }
}

/// Creates fresh parameters for `config` on `device`.
pub fn build_trainable(
    config: ModelConfig,
    device: &Device,
) -> Result<(VarMap, MultiHeadSequenceModel), ModelError> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = MultiHeadSequenceModel::new(config, vb)?;
    Ok((varmap, model))
}

/// Writes the parameters as safetensors and the architecture as TOML beside them.
pub fn save_checkpoint(
    varmap: &VarMap,
    config: &ModelConfig,
    checkpoint: &Path,
) -> Result<(), ModelError> {
    let dir = checkpoint.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    varmap.save(checkpoint)?;
    config.save(&dir.join(MODEL_CONFIG_FILE))?;
    Ok(())
}

/// Rebuilds a model from `model.toml` next to `checkpoint` and loads its parameters.
pub fn load_checkpoint(
    checkpoint: &Path,
    device: &Device,
) -> Result<MultiHeadSequenceModel, ModelError> {
    let dir = checkpoint.parent().unwrap_or_else(|| Path::new("."));
    let config_path = dir.join(MODEL_CONFIG_FILE);
    if !config_path.exists() {
        return Err(ModelError::MissingConfig(checkpoint.to_path_buf()));
    }
    let config = ModelConfig::load(&config_path)?;
    let (mut varmap, model) = build_trainable(config, device)?;
    varmap.load(checkpoint)?;
    log::info!(
        "Loaded checkpoint '{}' ({} layer(s), hidden {}, bidirectional: {})",
        checkpoint.display(),
        config.num_layers,
        config.hidden_size,
        config.bidirectional
    );
    Ok(model)
}

// ========================================================================================
//                                         LOSS
// ========================================================================================

/// Learnable per-head weights, initialised to 1.0.
pub struct WeightedMultiHeadLoss {
    weights: Var,
}

impl WeightedMultiHeadLoss {
    pub fn new(device: &Device) -> Result<Self, ModelError> {
        Ok(Self {
            weights: Var::ones(NUM_OUTPUTS, DType::F32, device)?,
        })
    }

    /// The weight variable, for inclusion in an optimiser's parameter set.
    pub fn var(&self) -> &Var {
        &self.weights
    }

    pub fn weights(&self) -> Result<Vec<f32>, ModelError> {
        Ok(self.weights.as_tensor().to_vec1::<f32>()?)
    }

    /// `sum_h w_h * BCE(outputs[:, h], targets[:, h + 1])` over the active heads.
    pub fn compute(&self, outputs: &Tensor, targets: &Tensor) -> Result<Tensor, ModelError> {
        let (_, out_cols) = outputs.dims2()?;
        let (_, target_cols) = targets.dims2()?;
        if out_cols != NUM_OUTPUTS || target_cols != NUM_LABEL_COLUMNS {
            return Err(candle_core::Error::Msg(format!(
                "loss expects [N x {NUM_OUTPUTS}] outputs and [N x {NUM_LABEL_COLUMNS}] targets, got {out_cols} and {target_cols} columns"
            ))
            .into());
        }

        let mut total: Option<Tensor> = None;
        for head in Head::ACTIVE {
            let predicted = outputs.narrow(1, head.output_column(), 1)?.squeeze(1)?;
            let truth = targets.narrow(1, head.label_column(), 1)?.squeeze(1)?;
            let term = binary_cross_entropy(&predicted, &truth)?
                .mul(&self.weights.as_tensor().get(head.output_column())?)?;
            total = Some(match total {
                Some(acc) => (acc + term)?,
                None => term,
            });
        }
        match total {
            Some(loss) => Ok(loss),
            None => Ok(Tensor::zeros((), DType::F32, outputs.device())?),
        }
    }

    /// Clamps every weight to be non-negative.
    pub fn clamp_non_negative(&self) -> Result<(), ModelError> {
        let clamped = self.weights.as_tensor().relu()?;
        self.weights.set(&clamped)?;
        Ok(())
    }
}

/// Mean binary cross-entropy of probabilities against 0/1 targets.
pub fn binary_cross_entropy(
    predicted: &Tensor,
    truth: &Tensor,
) -> candle_core::Result<Tensor> {
    let p = predicted.clamp(BCE_EPS, 1.0 - BCE_EPS)?;
    let positive = truth.mul(&p.log()?)?;
    let negative = truth.affine(-1.0, 1.0)?.mul(&p.affine(-1.0, 1.0)?.log()?)?;
    (positive + negative)?.neg()?.mean_all()
}
