//! Run configuration.
//!
//! A [`ForgeConfig`] is built from defaults, optionally a YAML file, then
//! environment overrides, then command-line flags, and is validated once
//! before the search starts. Every section has serde defaults, so a YAML
//! file only needs the keys it changes:
//!
//! ```yaml
//! llm:
//!   provider: ollama
//!   model: qwen2.5-coder
//! training:
//!   total_timesteps: 50000
//!   threshold: 0.9
//! refinement:
//!   n_init: 4
//!   n_refine: 2
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::GenerationOptions;
use crate::synthesis::DEFAULT_MAX_ATTEMPTS;
use crate::training::{ExecutionMode, OrchestratorConfig, ThresholdMode};

/// Default generator model.
pub const DEFAULT_MODEL: &str = "qwen2.5-coder";

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable or flag has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to parse configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which generator backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama server.
    #[default]
    Ollama,
    /// OpenAI-compatible endpoint behind LiteLLM.
    Litellm,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Ollama => write!(f, "ollama"),
            ProviderKind::Litellm => write!(f, "litellm"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "litellm" | "openai" => Ok(ProviderKind::Litellm),
            other => Err(ConfigError::InvalidValue {
                key: "provider".to_string(),
                message: format!("unknown provider '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: ProviderKind,
    pub model: String,
    /// Model describing rollouts; defaults to `model`.
    pub critic_model: Option<String>,
    pub api_base: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub stream: bool,
    pub options: GenerationOptions,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            model: DEFAULT_MODEL.to_string(),
            critic_model: None,
            api_base: None,
            api_key: None,
            timeout_secs: 300,
            stream: true,
            options: GenerationOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub total_timesteps: u64,
    pub seed: u64,
    pub eval_episodes: usize,
    pub eval_seed: u64,
    /// Episode cap of the direct-search backend.
    pub max_episodes: usize,
    pub artifact_dir: Option<PathBuf>,
    /// Fixed success-rate threshold; the baseline's rate when unset.
    pub threshold: Option<f64>,
    pub execution: ExecutionMode,
    pub poll_interval_ms: u64,
    pub job_timeout_secs: Option<u64>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            total_timesteps: 20_000,
            seed: 0,
            eval_episodes: 10,
            eval_seed: 1_000,
            max_episodes: 2_000,
            artifact_dir: Some(PathBuf::from("./artifacts")),
            threshold: None,
            execution: ExecutionMode::Concurrent,
            poll_interval_ms: 500,
            job_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisSettings {
    pub max_attempts: u32,
    pub smoke_seed: u64,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            smoke_seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementSettings {
    pub n_init: usize,
    pub n_refine: usize,
    pub focus: Option<String>,
    pub human_feedback: bool,
    pub rollout_description: bool,
    /// Independent searches, each with its own training seed.
    pub runs: usize,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            n_init: 2,
            n_refine: 1,
            focus: None,
            human_feedback: false,
            rollout_description: false,
            runs: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunLogSettings {
    /// JSON-lines file receiving one record per evaluated candidate.
    pub path: Option<PathBuf>,
}

/// Complete configuration of a reward search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub llm: LlmSettings,
    pub training: TrainingSettings,
    pub synthesis: SynthesisSettings,
    pub refinement: RefinementSettings,
    pub run_log: RunLogSettings,
}

impl ForgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML file; missing keys keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `FORGE_PROVIDER`: `ollama` or `litellm`
    /// - `FORGE_MODEL`, `FORGE_CRITIC_MODEL`: generator and critic models
    /// - `OLLAMA_API_BASE`: Ollama server, used when the provider is `ollama`
    /// - `LITELLM_API_BASE`, `LITELLM_API_KEY`: used when the provider is `litellm`
    /// - `FORGE_TOTAL_TIMESTEPS`, `FORGE_SEED`, `FORGE_EVAL_EPISODES`
    /// - `FORGE_THRESHOLD`: fixed success-rate threshold
    /// - `FORGE_ARTIFACT_DIR`: policy artifact directory
    /// - `FORGE_JOB_TIMEOUT_SECS`: deadline for a round of training jobs
    /// - `FORGE_MAX_ATTEMPTS`: completions per reward function
    /// - `FORGE_N_INIT`, `FORGE_N_REFINE`
    /// - `FORGE_RUN_LOG`: JSON-lines run log
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from any key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("FORGE_PROVIDER") {
            self.llm.provider = val.parse()?;
        }
        if let Some(val) = lookup("FORGE_MODEL") {
            self.llm.model = val;
        }
        if let Some(val) = lookup("FORGE_CRITIC_MODEL") {
            self.llm.critic_model = Some(val);
        }
        match self.llm.provider {
            ProviderKind::Ollama => {
                if let Some(val) = lookup("OLLAMA_API_BASE") {
                    self.llm.api_base = Some(val);
                }
            }
            ProviderKind::Litellm => {
                if let Some(val) = lookup("LITELLM_API_BASE") {
                    self.llm.api_base = Some(val);
                }
                if let Some(val) = lookup("LITELLM_API_KEY") {
                    self.llm.api_key = Some(val);
                }
            }
        }

        if let Some(val) = lookup("FORGE_TOTAL_TIMESTEPS") {
            self.training.total_timesteps = parse_env_value(&val, "FORGE_TOTAL_TIMESTEPS")?;
        }
        if let Some(val) = lookup("FORGE_SEED") {
            self.training.seed = parse_env_value(&val, "FORGE_SEED")?;
        }
        if let Some(val) = lookup("FORGE_EVAL_EPISODES") {
            self.training.eval_episodes = parse_env_value(&val, "FORGE_EVAL_EPISODES")?;
        }
        if let Some(val) = lookup("FORGE_THRESHOLD") {
            self.training.threshold = Some(parse_env_value(&val, "FORGE_THRESHOLD")?);
        }
        if let Some(val) = lookup("FORGE_ARTIFACT_DIR") {
            self.training.artifact_dir = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("FORGE_JOB_TIMEOUT_SECS") {
            self.training.job_timeout_secs = Some(parse_env_value(&val, "FORGE_JOB_TIMEOUT_SECS")?);
        }

        if let Some(val) = lookup("FORGE_MAX_ATTEMPTS") {
            self.synthesis.max_attempts = parse_env_value(&val, "FORGE_MAX_ATTEMPTS")?;
        }
        if let Some(val) = lookup("FORGE_N_INIT") {
            self.refinement.n_init = parse_env_value(&val, "FORGE_N_INIT")?;
        }
        if let Some(val) = lookup("FORGE_N_REFINE") {
            self.refinement.n_refine = parse_env_value(&val, "FORGE_N_REFINE")?;
        }
        if let Some(val) = lookup("FORGE_RUN_LOG") {
            self.run_log.path = Some(PathBuf::from(val));
        }
        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "llm.model cannot be empty".to_string(),
            ));
        }
        if self.llm.provider == ProviderKind::Litellm && self.llm.api_base.is_none() {
            return Err(ConfigError::ValidationFailed(
                "llm.api_base is required for the litellm provider (set LITELLM_API_BASE)"
                    .to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.options.temperature) {
            return Err(ConfigError::ValidationFailed(
                "llm.options.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.llm.options.top_p) {
            return Err(ConfigError::ValidationFailed(
                "llm.options.top_p must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.training.total_timesteps == 0 {
            return Err(ConfigError::ValidationFailed(
                "training.total_timesteps must be greater than 0".to_string(),
            ));
        }
        if self.training.eval_episodes == 0 {
            return Err(ConfigError::ValidationFailed(
                "training.eval_episodes must be greater than 0".to_string(),
            ));
        }
        if self.training.max_episodes == 0 {
            return Err(ConfigError::ValidationFailed(
                "training.max_episodes must be greater than 0".to_string(),
            ));
        }
        if let Some(threshold) = self.training.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::ValidationFailed(
                    "training.threshold must be between 0.0 and 1.0".to_string(),
                ));
            }
        }
        if self.training.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "training.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.training.job_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "training.job_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.synthesis.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "synthesis.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.refinement.n_init == 0 {
            return Err(ConfigError::ValidationFailed(
                "refinement.n_init must be greater than 0".to_string(),
            ));
        }
        if self.refinement.runs == 0 {
            return Err(ConfigError::ValidationFailed(
                "refinement.runs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Orchestrator settings for the run using `seed`.
    pub fn orchestrator_config(&self, seed: u64) -> OrchestratorConfig {
        OrchestratorConfig {
            total_timesteps: self.training.total_timesteps,
            seed,
            eval_episodes: self.training.eval_episodes,
            eval_seed: self.training.eval_seed,
            artifact_dir: self.training.artifact_dir.clone(),
            threshold: match self.training.threshold {
                Some(value) => ThresholdMode::Fixed(value),
                None => ThresholdMode::Baseline,
            },
            execution: self.training.execution,
            poll_interval: Duration::from_millis(self.training.poll_interval_ms),
            job_timeout: self.training.job_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.llm.provider = provider;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.llm.model = model.into();
        self
    }

    pub fn with_threshold(mut self, threshold: Option<f64>) -> Self {
        self.training.threshold = threshold;
        self
    }

    pub fn with_total_timesteps(mut self, steps: u64) -> Self {
        self.training.total_timesteps = steps;
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.training.artifact_dir = Some(dir.into());
        self
    }

    pub fn with_rounds(mut self, n_init: usize, n_refine: usize) -> Self {
        self.refinement.n_init = n_init;
        self.refinement.n_refine = n_refine;
        self
    }

    pub fn with_runs(mut self, runs: usize) -> Self {
        self.refinement.runs = runs;
        self
    }

    pub fn with_run_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.run_log.path = Some(path.into());
        self
    }
}

fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
