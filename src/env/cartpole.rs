//! Classic cart-pole balancing task.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use super::{
    mean_abs_component, Action, ActionSpace, Environment, Hyperparameters, Observation, Step,
    StepInfo, SuccessFlags, TaskAdapter, TaskPrompt,
};
use crate::error::EnvError;

const GRAVITY: f64 = 9.8;
const MASS_CART: f64 = 1.0;
const MASS_POLE: f64 = 0.1;
const TOTAL_MASS: f64 = MASS_CART + MASS_POLE;
const HALF_LENGTH: f64 = 0.5;
const POLE_MASS_LENGTH: f64 = MASS_POLE * HALF_LENGTH;
const FORCE_MAG: f64 = 10.0;
const TAU: f64 = 0.02;
const THETA_THRESHOLD: f64 = 12.0 * 2.0 * PI / 360.0;
const X_THRESHOLD: f64 = 2.4;

pub const MAX_EPISODE_STEPS: usize = 500;

const GOAL: &str = "Balance a pole on a cart";

const OBSERVATION_SPACE: &str = "Num Observation Min Max
0 Cart Position -4.8 4.8
1 Cart Velocity -Inf Inf
2 Pole Angle ~ -0.418 rad (-24°) ~ 0.418 rad (24°)
3 Pole Angular Velocity -Inf Inf";

pub(super) fn default_prompt() -> TaskPrompt {
    TaskPrompt::new(GOAL, OBSERVATION_SPACE)
}

/// Cart-pole dynamics with Euler integration and a time limit.
#[derive(Debug, Clone)]
pub struct CartPoleEnv {
    state: [f64; 4],
    rng: ChaCha8Rng,
    steps: usize,
    max_steps: usize,
    done: bool,
}

impl CartPoleEnv {
    pub fn new(max_steps: usize) -> Self {
        Self {
            state: [0.0; 4],
            rng: ChaCha8Rng::seed_from_u64(0),
            steps: 0,
            max_steps,
            done: true,
        }
    }

    pub fn state(&self) -> [f64; 4] {
        self.state
    }
}

impl Default for CartPoleEnv {
    fn default() -> Self {
        Self::new(MAX_EPISODE_STEPS)
    }
}

impl Environment for CartPoleEnv {
    fn reset(&mut self, seed: Option<u64>) -> Observation {
        if let Some(seed) = seed {
            self.rng = ChaCha8Rng::seed_from_u64(seed);
        }
        for value in self.state.iter_mut() {
            *value = self.rng.random_range(-0.05..0.05);
        }
        self.steps = 0;
        self.done = false;
        self.state.to_vec()
    }

    fn step(&mut self, action: &Action) -> Result<Step, EnvError> {
        if self.done {
            return Err(EnvError::StepAfterDone);
        }
        let force = match action {
            Action::Discrete(1) => FORCE_MAG,
            Action::Discrete(0) => -FORCE_MAG,
            other => {
                return Err(EnvError::InvalidAction(format!(
                    "{:?} is not in Discrete(2)",
                    other
                )))
            }
        };

        let [x, x_dot, theta, theta_dot] = self.state;
        let (sin_theta, cos_theta) = theta.sin_cos();
        let temp = (force + POLE_MASS_LENGTH * theta_dot * theta_dot * sin_theta) / TOTAL_MASS;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (HALF_LENGTH * (4.0 / 3.0 - MASS_POLE * cos_theta * cos_theta / TOTAL_MASS));
        let x_acc = temp - POLE_MASS_LENGTH * theta_acc * cos_theta / TOTAL_MASS;

        self.state = [
            x + TAU * x_dot,
            x_dot + TAU * x_acc,
            theta + TAU * theta_dot,
            theta_dot + TAU * theta_acc,
        ];
        self.steps += 1;

        let [x, _, theta, _] = self.state;
        let terminated = !(-X_THRESHOLD..=X_THRESHOLD).contains(&x)
            || !(-THETA_THRESHOLD..=THETA_THRESHOLD).contains(&theta);
        let truncated = self.steps >= self.max_steps;
        self.done = terminated || truncated;

        Ok(Step {
            observation: self.state.to_vec(),
            reward: 1.0,
            terminated,
            truncated,
            info: StepInfo::default(),
        })
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::Discrete(2)
    }

    fn observation_dim(&self) -> usize {
        4
    }
}

/// CartPole task: surviving until the time limit counts as success.
#[derive(Debug, Clone)]
pub struct CartPole {
    prompt: TaskPrompt,
    max_episode_steps: usize,
}

impl CartPole {
    pub fn new() -> Self {
        Self {
            prompt: default_prompt(),
            max_episode_steps: MAX_EPISODE_STEPS,
        }
    }

    pub fn with_prompt(mut self, prompt: TaskPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_max_episode_steps(mut self, steps: usize) -> Self {
        self.max_episode_steps = steps;
        self
    }
}

impl Default for CartPole {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskAdapter for CartPole {
    type Env = CartPoleEnv;

    fn name(&self) -> &str {
        "CartPole-v1"
    }

    fn make_env(&self) -> CartPoleEnv {
        CartPoleEnv::new(self.max_episode_steps)
    }

    fn success(&self, _env: &CartPoleEnv, info: &StepInfo) -> SuccessFlags {
        if info.truncated {
            SuccessFlags::success()
        } else {
            SuccessFlags::failure()
        }
    }

    fn objective_metrics(&self, observations: &[Observation]) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "pole_angle_diff".to_string(),
            mean_abs_component(observations, 2),
        );
        metrics.insert(
            "pole_position_diff".to_string(),
            mean_abs_component(observations, 0),
        );
        metrics
    }

    fn prompt(&self) -> &TaskPrompt {
        &self.prompt
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::from([
            ("noise_std".to_string(), 1e-2),
            ("noise_std_min".to_string(), 1e-3),
            ("noise_std_max".to_string(), 2.0),
            ("plateau_patience".to_string(), 10.0),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_is_seeded() {
        let mut a = CartPoleEnv::default();
        let mut b = CartPoleEnv::default();
        assert_eq!(a.reset(Some(42)), b.reset(Some(42)));
        let obs = a.reset(Some(3));
        assert!(obs.iter().all(|v| v.abs() <= 0.05));
    }

    #[test]
    fn test_pushing_one_way_terminates() {
        let mut env = CartPoleEnv::default();
        env.reset(Some(0));
        let mut steps = 0;
        loop {
            let step = env.step(&Action::Discrete(1)).unwrap();
            steps += 1;
            assert_eq!(step.reward, 1.0);
            if step.is_done() {
                assert!(step.terminated);
                assert!(!step.truncated);
                break;
            }
        }
        assert!(steps < 100);
        assert!(matches!(
            env.step(&Action::Discrete(0)),
            Err(EnvError::StepAfterDone)
        ));
    }

    #[test]
    fn test_time_limit_truncates() {
        let mut env = CartPoleEnv::new(3);
        env.reset(Some(0));
        env.step(&Action::Discrete(0)).unwrap();
        env.step(&Action::Discrete(1)).unwrap();
        let last = env.step(&Action::Discrete(0)).unwrap();
        assert!(last.truncated);
    }

    #[test]
    fn test_invalid_action() {
        let mut env = CartPoleEnv::default();
        env.reset(None);
        assert!(matches!(
            env.step(&Action::Discrete(2)),
            Err(EnvError::InvalidAction(_))
        ));
    }

    #[test]
    fn test_success_predicate() {
        let task = CartPole::new();
        let env = task.make_env();
        let truncated = StepInfo {
            terminated: false,
            truncated: true,
            ..Default::default()
        };
        let fell = StepInfo {
            terminated: true,
            truncated: false,
            ..Default::default()
        };
        assert_eq!(task.success(&env, &truncated), SuccessFlags::success());
        assert_eq!(task.success(&env, &fell), SuccessFlags::failure());
    }

    #[test]
    fn test_objective_metrics() {
        let task = CartPole::new();
        let metrics = task.objective_metrics(&[vec![0.2, 0.0, -0.1, 0.0], vec![-0.4, 0.0, 0.3, 0.0]]);
        assert!((metrics["pole_angle_diff"] - 0.2).abs() < 1e-12);
        assert!((metrics["pole_position_diff"] - 0.3).abs() < 1e-12);
    }
}
