//! Environments and task adapters.
//!
//! An [`Environment`] is a plain step/reset simulator. A [`TaskAdapter`]
//! describes one task built on top of it: how to construct the environment,
//! how to judge success at the end of an episode, which objective metrics to
//! report, and the text the generator sees when it is asked for a reward.

mod cartpole;
mod mountain_car;

pub use cartpole::{CartPole, CartPoleEnv};
pub use mountain_car::{MountainCar, MountainCarEnv};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::EnvError;

/// Observation vector returned by an environment.
pub type Observation = Vec<f64>;

/// Training hyperparameters suggested by a task, keyed by name.
pub type Hyperparameters = BTreeMap<String, f64>;

/// An action taken in an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Discrete(usize),
    Continuous(Vec<f64>),
}

/// The set of valid actions for an environment.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionSpace {
    Discrete(usize),
    Box { low: Vec<f64>, high: Vec<f64> },
}

impl ActionSpace {
    /// Draws a uniformly random action.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Action {
        match self {
            ActionSpace::Discrete(n) => Action::Discrete(rng.random_range(0..(*n).max(1))),
            ActionSpace::Box { low, high } => Action::Continuous(
                low.iter()
                    .zip(high)
                    .map(|(lo, hi)| if hi > lo { rng.random_range(*lo..*hi) } else { *lo })
                    .collect(),
            ),
        }
    }

    pub fn contains(&self, action: &Action) -> bool {
        match (self, action) {
            (ActionSpace::Discrete(n), Action::Discrete(a)) => a < n,
            (ActionSpace::Box { low, high }, Action::Continuous(values)) => {
                values.len() == low.len()
                    && values
                        .iter()
                        .zip(low.iter().zip(high))
                        .all(|(v, (lo, hi))| v >= lo && v <= hi)
            }
            _ => false,
        }
    }
}

/// Auxiliary information attached to a step.
///
/// `terminated` and `truncated` are filled in by the reward adapter when a
/// success predicate is configured; environments leave them unset and only
/// contribute named values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepInfo {
    pub terminated: bool,
    pub truncated: bool,
    pub values: BTreeMap<String, f64>,
}

/// Result of a single environment step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub observation: Observation,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: StepInfo,
}

impl Step {
    pub fn is_done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// A resettable simulator.
pub trait Environment: Send {
    /// Starts a new episode. `Some(seed)` reseeds the environment's RNG.
    fn reset(&mut self, seed: Option<u64>) -> Observation;

    /// Advances the episode by one action.
    fn step(&mut self, action: &Action) -> Result<Step, EnvError>;

    fn action_space(&self) -> ActionSpace;

    fn observation_dim(&self) -> usize;
}

/// Outcome of an episode as judged by a task's success predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessFlags {
    pub is_success: bool,
    pub is_failure: bool,
}

impl SuccessFlags {
    pub const NONE: SuccessFlags = SuccessFlags {
        is_success: false,
        is_failure: false,
    };

    pub fn success() -> Self {
        Self {
            is_success: true,
            is_failure: false,
        }
    }

    pub fn failure() -> Self {
        Self {
            is_success: false,
            is_failure: true,
        }
    }
}

/// Task description shown to the generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPrompt {
    pub goal: Option<String>,
    pub observation_space: String,
    /// Optional image of the environment attached to the first prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
}

impl TaskPrompt {
    pub fn new(goal: impl Into<String>, observation_space: impl Into<String>) -> Self {
        Self {
            goal: Some(goal.into()),
            observation_space: observation_space.into(),
            image: None,
        }
    }

    /// Replaces the goal text when `goal` is set.
    pub fn with_goal(mut self, goal: Option<String>) -> Self {
        if goal.is_some() {
            self.goal = goal;
        }
        self
    }

    /// Replaces the observation description when `observation_space` is set.
    pub fn with_observation_space(mut self, observation_space: Option<String>) -> Self {
        if let Some(text) = observation_space {
            self.observation_space = text;
        }
        self
    }

    pub fn with_image(mut self, image: Option<PathBuf>) -> Self {
        self.image = image;
        self
    }
}

/// Capability interface for a task the engine can search rewards for.
///
/// Implementations are cheap to share across worker threads; every training
/// job calls [`TaskAdapter::make_env`] to get its own environment.
pub trait TaskAdapter: Send + Sync + 'static {
    type Env: Environment + 'static;

    /// Environment identifier, e.g. `CartPole-v1`.
    fn name(&self) -> &str;

    fn make_env(&self) -> Self::Env;

    /// Judges a finished episode. Only called on the terminal step.
    fn success(&self, env: &Self::Env, info: &StepInfo) -> SuccessFlags;

    /// Task-level metrics computed from the observations of one episode.
    fn objective_metrics(&self, observations: &[Observation]) -> BTreeMap<String, f64>;

    fn prompt(&self) -> &TaskPrompt;

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
    }
}

/// Built-in tasks selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvKind {
    CartPole,
    MountainCar,
}

impl EnvKind {
    pub fn all() -> &'static [EnvKind] {
        &[EnvKind::CartPole, EnvKind::MountainCar]
    }

    /// Gymnasium-style identifier.
    pub fn id(&self) -> &'static str {
        match self {
            EnvKind::CartPole => "CartPole-v1",
            EnvKind::MountainCar => "MountainCar-v0",
        }
    }

    pub fn default_prompt(&self) -> TaskPrompt {
        match self {
            EnvKind::CartPole => cartpole::default_prompt(),
            EnvKind::MountainCar => mountain_car::default_prompt(),
        }
    }
}

impl fmt::Display for EnvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for EnvKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "cartpole" | "cartpolev1" => Ok(EnvKind::CartPole),
            "mountaincar" | "mountaincarv0" => Ok(EnvKind::MountainCar),
            _ => Err(format!(
                "unknown environment '{}', expected one of: {}",
                s,
                EnvKind::all()
                    .iter()
                    .map(|k| k.id())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

/// Mean of `|obs[i]|` over an episode, or 0 for an empty episode.
pub(crate) fn mean_abs_component(observations: &[Observation], i: usize) -> f64 {
    if observations.is_empty() {
        return 0.0;
    }
    let total: f64 = observations
        .iter()
        .map(|obs| obs.get(i).copied().unwrap_or(0.0).abs())
        .sum();
    total / observations.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_env_kind_parsing() {
        assert_eq!("cartpole".parse::<EnvKind>().unwrap(), EnvKind::CartPole);
        assert_eq!("CartPole-v1".parse::<EnvKind>().unwrap(), EnvKind::CartPole);
        assert_eq!(
            "mountain_car".parse::<EnvKind>().unwrap(),
            EnvKind::MountainCar
        );
        assert!("LunarLander-v3".parse::<EnvKind>().is_err());
    }

    #[test]
    fn test_env_kind_display_roundtrip() {
        for kind in EnvKind::all() {
            assert_eq!(kind.to_string().parse::<EnvKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn test_discrete_sample_in_space() {
        let space = ActionSpace::Discrete(3);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..50 {
            let action = space.sample(&mut rng);
            assert!(space.contains(&action));
        }
        assert!(!space.contains(&Action::Discrete(3)));
        assert!(!space.contains(&Action::Continuous(vec![0.0])));
    }

    #[test]
    fn test_box_sample_in_space() {
        let space = ActionSpace::Box {
            low: vec![-1.0, 0.0],
            high: vec![1.0, 0.5],
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let action = space.sample(&mut rng);
        assert!(space.contains(&action));
    }

    #[test]
    fn test_prompt_overrides() {
        let prompt = TaskPrompt::new("Balance", "obs")
            .with_goal(None)
            .with_observation_space(Some("custom".to_string()));
        assert_eq!(prompt.goal.as_deref(), Some("Balance"));
        assert_eq!(prompt.observation_space, "custom");
    }

    #[test]
    fn test_mean_abs_component() {
        let obs = vec![vec![1.0, -2.0], vec![-3.0, 4.0]];
        assert_eq!(mean_abs_component(&obs, 0), 2.0);
        assert_eq!(mean_abs_component(&obs, 1), 3.0);
        assert_eq!(mean_abs_component(&[], 0), 0.0);
    }
}
