//! Session configuration
//!
//! A model folder may carry a `workspace.json` naming the main model file and
//! the hyper-parameter file, and an `hparams.json` with generation defaults.
//! Both are optional; absent files mean defaults. The bridge only reads them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the workspace descriptor inside the model folder
pub const WORKSPACE_FILE: &str = "workspace.json";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Not a readable directory: {0}")]
    NotADirectory(PathBuf),
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Contents of `workspace.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workspace {
    /// Hyper-parameter file, relative to the model folder
    pub hparams_config: String,
    /// Main model file or directory, relative to the model folder.
    /// Empty means "first .gguf file in the model folder".
    pub model_main: String,
}

impl Default for Workspace {
    fn default() -> Self {
        Self {
            hparams_config: "hparams.json".to_string(),
            model_main: String::new(),
        }
    }
}

/// Sampling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerParams {
    /// Random seed (0 = random)
    pub seed: u32,
    /// Temperature (0.0 - 2.0)
    pub temperature: f32,
    /// Nucleus sampling (0.0 - 1.0)
    pub top_p: f32,
    pub top_k: u32,
    /// Minimum candidates kept by nucleus sampling
    pub min_keep: u32,
    /// Recent tokens considered for penalties (-1 = whole context, 0 = off)
    pub penalty_last_n: i32,
    /// Repetition penalty (1.0 = off)
    pub penalty_repeat: f32,
    /// Frequency penalty (0.0 = off)
    pub penalty_freq: f32,
    /// Presence penalty (0.0 = off)
    pub penalty_present: f32,
    /// Accepted for compatibility; llama.cpp penalises newlines like any token
    pub penalize_nl: bool,
    /// Keep generating past end-of-generation tokens
    pub ignore_eos: bool,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            seed: 233,
            temperature: 0.2,
            top_p: 0.9,
            top_k: 40,
            min_keep: 0,
            penalty_last_n: 1024,
            penalty_repeat: 1.1,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            penalize_nl: false,
            ignore_eos: false,
        }
    }
}

impl SamplerParams {
    /// True if any of the repetition penalties is active
    pub fn has_penalties(&self) -> bool {
        self.penalty_last_n != 0
            && (self.penalty_repeat != 1.0 || self.penalty_freq != 0.0 || self.penalty_present != 0.0)
    }
}

/// Contents of `hparams.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParams {
    /// Threads used for decoding
    pub n_threads: u32,
    /// Logical batch size for prompt processing
    pub batch_size: u32,
    /// Upper bound on generated tokens when the request does not set one
    pub max_tokens: u32,
    /// Context window size
    pub context_size: u32,
    /// Layers offloaded to the GPU (0 = CPU only)
    pub gpu_layers: u32,
    pub sampler: SamplerParams,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            n_threads: 4,
            batch_size: 1024,
            max_tokens: 2048,
            context_size: 4096,
            gpu_layers: 99,
            sampler: SamplerParams::default(),
        }
    }
}

impl HyperParams {
    /// Clamps values into usable ranges
    pub fn validate(&mut self) {
        let defaults = HyperParams::default();

        self.sampler.temperature = self.sampler.temperature.clamp(0.0, 2.0);
        self.sampler.top_p = self.sampler.top_p.clamp(0.0, 1.0);
        self.sampler.penalty_last_n = self.sampler.penalty_last_n.max(-1);
        self.sampler.penalty_freq = self.sampler.penalty_freq.clamp(-2.0, 2.0);
        self.sampler.penalty_present = self.sampler.penalty_present.clamp(-2.0, 2.0);
        if self.sampler.penalty_repeat <= 0.0 {
            self.sampler.penalty_repeat = 1.0;
        }

        if self.sampler.top_k == 0 {
            self.sampler.top_k = defaults.sampler.top_k;
        }
        if self.n_threads == 0 {
            self.n_threads = defaults.n_threads;
        }
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        if self.max_tokens == 0 {
            self.max_tokens = defaults.max_tokens;
        }
        if self.context_size == 0 {
            self.context_size = defaults.context_size;
        }
    }
}

/// Everything an engine needs to start a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub model_folder: PathBuf,
    pub lib_folder: PathBuf,
    pub workspace: Workspace,
    pub hparams: HyperParams,
}

impl SessionConfig {
    /// Loads the configuration for a session rooted at `model_folder`.
    ///
    /// Both folders must be readable directories.
    pub fn load(model_folder: &Path, lib_folder: &Path) -> Result<Self, ConfigError> {
        ensure_readable_dir(model_folder)?;
        ensure_readable_dir(lib_folder)?;

        let workspace: Workspace =
            read_json_or_default(&model_folder.join(WORKSPACE_FILE))?;
        let mut hparams: HyperParams =
            read_json_or_default(&model_folder.join(&workspace.hparams_config))?;
        hparams.validate();

        tracing::debug!(
            "Loaded session config from {} (model_main={:?})",
            model_folder.display(),
            workspace.model_main
        );

        Ok(Self {
            model_folder: model_folder.to_path_buf(),
            lib_folder: lib_folder.to_path_buf(),
            workspace,
            hparams,
        })
    }
}

fn ensure_readable_dir(path: &Path) -> Result<(), ConfigError> {
    match fs::read_dir(path) {
        Ok(_) => Ok(()),
        Err(_) => Err(ConfigError::NotADirectory(path.to_path_buf())),
    }
}

fn read_json_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if !path.exists() {
        tracing::info!("{} not found, using defaults", path.display());
        return Ok(T::default());
    }

    let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
