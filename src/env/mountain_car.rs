//! Under-powered car that must rock its way up a hill.

use std::collections::BTreeMap;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use super::{
    mean_abs_component, Action, ActionSpace, Environment, Hyperparameters, Observation, Step,
    StepInfo, SuccessFlags, TaskAdapter, TaskPrompt,
};
use crate::error::EnvError;

const MIN_POSITION: f64 = -1.2;
const MAX_POSITION: f64 = 0.6;
const MAX_SPEED: f64 = 0.07;
const GOAL_POSITION: f64 = 0.5;
const GOAL_VELOCITY: f64 = 0.0;
const FORCE: f64 = 0.001;
const GRAVITY: f64 = 0.0025;

pub const MAX_EPISODE_STEPS: usize = 200;

const GOAL: &str = "Drive the car up the right hill and reach the flag";

const OBSERVATION_SPACE: &str = "Num Observation Min Max
0 Car Position -1.2 0.6
1 Car Velocity -0.07 0.07
Actions: 0 accelerate left, 1 do not accelerate, 2 accelerate right";

pub(super) fn default_prompt() -> TaskPrompt {
    TaskPrompt::new(GOAL, OBSERVATION_SPACE)
}

#[derive(Debug, Clone)]
pub struct MountainCarEnv {
    position: f64,
    velocity: f64,
    rng: ChaCha8Rng,
    steps: usize,
    max_steps: usize,
    reached_goal: bool,
    done: bool,
}

impl MountainCarEnv {
    pub fn new(max_steps: usize) -> Self {
        Self {
            position: 0.0,
            velocity: 0.0,
            rng: ChaCha8Rng::seed_from_u64(0),
            steps: 0,
            max_steps,
            reached_goal: false,
            done: true,
        }
    }

    /// Whether the current episode ended on the flag.
    pub fn reached_goal(&self) -> bool {
        self.reached_goal
    }
}

impl Default for MountainCarEnv {
    fn default() -> Self {
        Self::new(MAX_EPISODE_STEPS)
    }
}

impl Environment for MountainCarEnv {
    fn reset(&mut self, seed: Option<u64>) -> Observation {
        if let Some(seed) = seed {
            self.rng = ChaCha8Rng::seed_from_u64(seed);
        }
        self.position = self.rng.random_range(-0.6..-0.4);
        self.velocity = 0.0;
        self.steps = 0;
        self.reached_goal = false;
        self.done = false;
        vec![self.position, self.velocity]
    }

    fn step(&mut self, action: &Action) -> Result<Step, EnvError> {
        if self.done {
            return Err(EnvError::StepAfterDone);
        }
        let push = match action {
            Action::Discrete(a) if *a < 3 => *a as f64 - 1.0,
            other => {
                return Err(EnvError::InvalidAction(format!(
                    "{:?} is not in Discrete(3)",
                    other
                )))
            }
        };

        self.velocity += push * FORCE - (3.0 * self.position).cos() * GRAVITY;
        self.velocity = self.velocity.clamp(-MAX_SPEED, MAX_SPEED);
        self.position += self.velocity;
        self.position = self.position.clamp(MIN_POSITION, MAX_POSITION);
        if self.position <= MIN_POSITION && self.velocity < 0.0 {
            self.velocity = 0.0;
        }
        self.steps += 1;

        let terminated = self.position >= GOAL_POSITION && self.velocity >= GOAL_VELOCITY;
        let truncated = self.steps >= self.max_steps;
        self.reached_goal = terminated;
        self.done = terminated || truncated;

        let mut info = StepInfo::default();
        info.values.insert("position".to_string(), self.position);

        Ok(Step {
            observation: vec![self.position, self.velocity],
            reward: -1.0,
            terminated,
            truncated,
            info,
        })
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::Discrete(3)
    }

    fn observation_dim(&self) -> usize {
        2
    }
}

/// MountainCar task: reaching the flag before the time limit is success.
#[derive(Debug, Clone)]
pub struct MountainCar {
    prompt: TaskPrompt,
    max_episode_steps: usize,
}

impl MountainCar {
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

impl Default for MountainCar {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskAdapter for MountainCar {
    type Env = MountainCarEnv;

    fn name(&self) -> &str {
        "MountainCar-v0"
    }

    fn make_env(&self) -> MountainCarEnv {
        MountainCarEnv::new(self.max_episode_steps)
    }

    fn success(&self, env: &MountainCarEnv, info: &StepInfo) -> SuccessFlags {
        if info.terminated && env.reached_goal() {
            SuccessFlags::success()
        } else {
            SuccessFlags::failure()
        }
    }

    fn objective_metrics(&self, observations: &[Observation]) -> BTreeMap<String, f64> {
        let max_position = observations
            .iter()
            .filter_map(|obs| obs.first().copied())
            .fold(f64::NEG_INFINITY, f64::max);
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "max_position".to_string(),
            if max_position.is_finite() {
                max_position
            } else {
                MIN_POSITION
            },
        );
        metrics.insert(
            "mean_speed".to_string(),
            mean_abs_component(observations, 1),
        );
        metrics
    }

    fn prompt(&self) -> &TaskPrompt {
        &self.prompt
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::from([
            ("noise_std".to_string(), 5e-2),
            ("noise_std_min".to_string(), 1e-3),
            ("noise_std_max".to_string(), 2.0),
            ("plateau_patience".to_string(), 20.0),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_range() {
        let mut env = MountainCarEnv::default();
        let obs = env.reset(Some(9));
        assert!((-0.6..-0.4).contains(&obs[0]));
        assert_eq!(obs[1], 0.0);
    }

    #[test]
    fn test_idle_car_times_out() {
        let mut env = MountainCarEnv::default();
        env.reset(Some(0));
        let mut last = None;
        for _ in 0..MAX_EPISODE_STEPS {
            let step = env.step(&Action::Discrete(1)).unwrap();
            assert_eq!(step.reward, -1.0);
            let done = step.is_done();
            last = Some(step);
            if done {
                break;
            }
        }
        let last = last.unwrap();
        assert!(last.truncated);
        assert!(!last.terminated);
        assert!(!env.reached_goal());
    }

    #[test]
    fn test_rocking_reaches_goal() {
        let mut env = MountainCarEnv::default();
        env.reset(Some(0));
        let mut reached = false;
        for _ in 0..MAX_EPISODE_STEPS {
            let action = if env.velocity >= 0.0 { 2 } else { 0 };
            let step = env.step(&Action::Discrete(action)).unwrap();
            if step.is_done() {
                reached = step.terminated;
                break;
            }
        }
        assert!(reached);
        let task = MountainCar::new();
        let info = StepInfo {
            terminated: true,
            truncated: false,
            ..Default::default()
        };
        assert_eq!(task.success(&env, &info), SuccessFlags::success());
    }

    #[test]
    fn test_position_clamped_at_left_wall() {
        let mut env = MountainCarEnv::default();
        env.reset(Some(1));
        for _ in 0..60 {
            if env.step(&Action::Discrete(0)).unwrap().is_done() {
                break;
            }
        }
        assert!(env.position >= MIN_POSITION);
    }
}
