// Composer configuration.
//
// Every hyperparameter the composer assembles its collaborators from lives
// here: the feature-engineering window (batch, bar length, time resolution,
// pitch range), the generator's convolutional autoencoder, the discriminator
// and the adversarial training schedule. Loaded from TOML; every field has a
// default so a partial file (or none at all) is valid.

use crate::error::{ComposerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    /// Number of bars per sampled batch. Also the filter count of every conv
    /// layer.
    pub batch_size: usize,
    /// Time steps per bar.
    pub seq_len: usize,
    /// Seconds per time step.
    pub time_fraction: f64,
    /// Lowest MIDI note number kept (inclusive).
    pub min_pitch: u8,
    /// Upper MIDI note bound (exclusive).
    pub max_pitch: u8,
    pub learning_rate: f64,
    /// Flattened feature size entering the discriminator's output graph.
    /// Derived from the conv output shape when unset.
    pub hidden_dim: Option<usize>,
    /// Root seed; every component forks its own generator from it.
    pub seed: u64,
    pub autoencoder: AutoEncoderConfig,
    pub discriminator: DiscriminatorConfig,
    pub training: TrainingConfig,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        ComposerConfig {
            batch_size: 10,
            seq_len: 4,
            time_fraction: 1.0,
            min_pitch: 24,
            max_pitch: 108,
            learning_rate: 1e-5,
            hidden_dim: None,
            seed: 0,
            autoencoder: AutoEncoderConfig::default(),
            discriminator: DiscriminatorConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoEncoderConfig {
    pub epochs: usize,
    /// Multiplies the learning rate every `attenuate_epoch` epochs.
    pub learning_attenuate_rate: f64,
    pub attenuate_epoch: usize,
    /// Share of pretraining bars held out for validation. 0 disables it.
    pub test_size_rate: f64,
    /// Minimum loss improvement; two consecutive misses stop training.
    pub tol: f64,
    /// Std of the initial Gaussian weights.
    pub scale: f64,
    pub kernel_size: usize,
    pub stride: usize,
    pub pad: usize,
    pub dropout_rate: f64,
    /// Number of bars sampled for `AaeComposer::pretrain`, in batches.
    pub pretrain_batches: usize,
}

impl Default for AutoEncoderConfig {
    fn default() -> Self {
        AutoEncoderConfig {
            epochs: 100,
            learning_attenuate_rate: 0.1,
            attenuate_epoch: 25,
            test_size_rate: 0.3,
            tol: 1e-15,
            scale: 0.01,
            kernel_size: 3,
            stride: 1,
            pad: 1,
            dropout_rate: 0.0,
            pretrain_batches: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorConfig {
    pub scale: f64,
    pub output_scale: f64,
    pub batch_norm: bool,
    pub dropout_rate: f64,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        DiscriminatorConfig {
            scale: 0.001,
            output_scale: 0.01,
            batch_norm: true,
            dropout_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Adversarial training iterations.
    pub iter_n: usize,
    /// Discriminator updates per iteration.
    pub k_step: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            iter_n: 500,
            k_step: 10,
        }
    }
}

impl ComposerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ComposerError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ComposerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Width of the pitch axis.
    pub fn dim(&self) -> usize {
        (self.max_pitch - self.min_pitch) as usize
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ComposerError::InvalidConfig(msg));

        if self.min_pitch >= self.max_pitch {
            return invalid(format!(
                "min_pitch ({}) must be below max_pitch ({})",
                self.min_pitch, self.max_pitch
            ));
        }
        if self.max_pitch > 128 {
            return invalid(format!("max_pitch ({}) exceeds 128", self.max_pitch));
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        if self.seq_len == 0 {
            return invalid("seq_len must be positive".into());
        }
        if !(self.time_fraction > 0.0) {
            return invalid(format!("time_fraction ({}) must be positive", self.time_fraction));
        }
        if !(self.learning_rate > 0.0) {
            return invalid(format!("learning_rate ({}) must be positive", self.learning_rate));
        }
        let ae = &self.autoencoder;
        if !(0.0..1.0).contains(&ae.test_size_rate) {
            return invalid(format!("test_size_rate ({}) must be in [0, 1)", ae.test_size_rate));
        }
        if ae.kernel_size == 0 || ae.stride == 0 {
            return invalid("kernel_size and stride must be positive".into());
        }
        for rate in [ae.dropout_rate, self.discriminator.dropout_rate] {
            if !(0.0..1.0).contains(&rate) {
                return invalid(format!("dropout_rate ({rate}) must be in [0, 1)"));
            }
        }
        Ok(())
    }
}
