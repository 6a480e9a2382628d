//! Policy-training contract.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::adapter::RewardEnvAdapter;
use crate::env::{Action, Hyperparameters, TaskAdapter};
use crate::error::TrainingError;

/// A trained policy.
pub trait Policy: Send + 'static {
    /// Deterministic action for an observation.
    fn predict(&self, observation: &[f64]) -> Action;

    /// Persists the policy as a JSON artifact.
    fn save(&self, path: &Path) -> Result<(), TrainingError>;
}

/// Inputs shared by every training call.
#[derive(Debug)]
pub struct TrainingContext<'a> {
    pub hyperparameters: &'a Hyperparameters,
    pub total_timesteps: u64,
    pub seed: u64,
    pub stop: &'a AtomicBool,
}

impl TrainingContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Reads a hyperparameter, falling back to `default`.
    pub fn param(&self, name: &str, default: f64) -> Result<f64, TrainingError> {
        match self.hyperparameters.get(name) {
            None => Ok(default),
            Some(value) if value.is_finite() => Ok(*value),
            Some(value) => Err(TrainingError::InvalidHyperparameter {
                name: name.to_string(),
                message: format!("{} is not finite", value),
            }),
        }
    }
}

/// Trains policies for a task. Implementations must be shareable between
/// worker threads; all per-job state lives inside `train`.
pub trait TrainingBackend<T: TaskAdapter>: Send + Sync + 'static {
    type Policy: Policy;

    fn name(&self) -> &str;

    fn train(
        &self,
        env: &mut RewardEnvAdapter<T>,
        ctx: &TrainingContext<'_>,
    ) -> Result<(Self::Policy, TrainingStats), TrainingError>;

    fn load(&self, path: &Path) -> Result<Self::Policy, TrainingError>;
}

/// Summary statistics of the training episodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub mean_reward: f64,
    pub std_reward: f64,
    pub mean_length: f64,
    pub max_score: f64,
    pub total_episodes: usize,
    pub train_success_rate: f64,
    /// Return of every training episode, in order.
    pub episode_returns: Vec<f64>,
}

impl TrainingStats {
    /// Scalar statistics as a metric map.
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("mean_reward".to_string(), self.mean_reward),
            ("std_reward".to_string(), self.std_reward),
            ("mean_length".to_string(), self.mean_length),
            ("max_score".to_string(), self.max_score),
            ("total_episodes".to_string(), self.total_episodes as f64),
            ("train_success_rate".to_string(), self.train_success_rate),
        ])
    }
}

/// Accumulates per-episode returns, lengths and outcomes during training.
#[derive(Debug, Default)]
pub struct EpisodeTracker {
    returns: Vec<f64>,
    lengths: Vec<usize>,
    successes: usize,
    current_return: f64,
    current_length: usize,
    timesteps: u64,
}

impl EpisodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_step(&mut self, reward: f64) {
        self.current_return += reward;
        self.current_length += 1;
        self.timesteps += 1;
    }

    /// Closes the current episode and returns its total reward.
    pub fn end_episode(&mut self, success: bool) -> f64 {
        let total = self.current_return;
        self.returns.push(total);
        self.lengths.push(self.current_length);
        if success {
            self.successes += 1;
        }
        self.current_return = 0.0;
        self.current_length = 0;
        total
    }

    pub fn timesteps(&self) -> u64 {
        self.timesteps
    }

    pub fn episodes(&self) -> usize {
        self.returns.len()
    }

    pub fn finish(self) -> TrainingStats {
        let n = self.returns.len();
        if n == 0 {
            return TrainingStats::default();
        }
        let mean = self.returns.iter().sum::<f64>() / n as f64;
        let std = if n > 1 {
            (self.returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n as f64).sqrt()
        } else {
            0.0
        };
        TrainingStats {
            mean_reward: mean,
            std_reward: std,
            mean_length: self.lengths.iter().sum::<usize>() as f64 / n as f64,
            max_score: self
                .returns
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max),
            total_episodes: n,
            train_success_rate: self.successes as f64 / n as f64,
            episode_returns: self.returns,
        }
    }
}
