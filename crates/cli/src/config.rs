//! Configuration persistence for the validation harness.
//!
//! Problem settings are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/causal-conv/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::DType;
use causal_conv_core::conv::Activation;
use causal_conv_core::testing::default_tolerance;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefilled timesteps for `stream`, capped at `seqlen` when unset.
const DEFAULT_PREFILL: usize = 8;

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,

    /// Number of channels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dim: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seqlen: Option<usize>,

    /// Filter width (2, 3 or 4).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,

    /// Signal dtype (f32, f64, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation: Option<Activation>,

    /// Add a per-channel bias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias: Option<bool>,

    /// Width of the initial state; 0 disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_len: Option<usize>,

    /// Segments per batch row; values above 1 enable `seq_idx` masking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<usize>,

    /// Prefilled timesteps before streaming starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefill: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Maximum absolute error; defaults to a per-dtype value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
}

/// Fully resolved problem settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckParams {
    pub batch: usize,
    pub dim: usize,
    pub seqlen: usize,
    pub width: usize,
    pub dtype: DType,
    pub activation: Activation,
    pub bias: bool,
    pub state_len: usize,
    pub segments: usize,
    pub prefill: usize,
    pub seed: u64,
    pub tolerance: f64,
}

impl CheckConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("causal-conv").join("config.toml"))
    }

    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &CheckConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field.clone();
                    }
                )*
            };
        }
        take!(
            batch, dim, seqlen, width, dtype, activation, bias, state_len, segments, prefill,
            seed, tolerance,
        );
    }

    /// Fill unset values with defaults and validate the result.
    pub fn resolve(&self) -> Result<CheckParams, ConfigError> {
        let dtype = match &self.dtype {
            Some(name) => name
                .parse::<DType>()
                .map_err(|_| ConfigError::InvalidDType(name.clone()))?,
            None => DType::F32,
        };
        if !matches!(dtype, DType::F32 | DType::F64 | DType::F16 | DType::BF16) {
            return Err(ConfigError::InvalidDType(dtype.as_str().to_string()));
        }
        let seqlen = self.seqlen.unwrap_or(32);
        let params = CheckParams {
            batch: self.batch.unwrap_or(2),
            dim: self.dim.unwrap_or(8),
            seqlen,
            width: self.width.unwrap_or(4),
            dtype,
            activation: self.activation.unwrap_or(Activation::Silu),
            bias: self.bias.unwrap_or(true),
            state_len: self.state_len.unwrap_or(0),
            segments: self.segments.unwrap_or(1).max(1),
            prefill: self.prefill.unwrap_or(DEFAULT_PREFILL.min(seqlen)),
            seed: self.seed.unwrap_or(0),
            tolerance: self.tolerance.unwrap_or_else(|| default_tolerance(dtype)),
        };
        if !(2..=4).contains(&params.width) {
            return Err(ConfigError::Invalid(format!(
                "width ({}) must be 2, 3 or 4",
                params.width
            )));
        }
        if params.prefill > params.seqlen {
            return Err(ConfigError::Invalid(format!(
                "prefill ({}) exceeds seqlen ({})",
                params.prefill, params.seqlen
            )));
        }
        Ok(params)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("No config directory available")]
    NoConfigDir,
    #[error("unsupported dtype '{0}': expected f32, f64, f16 or bf16")]
    InvalidDType(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
