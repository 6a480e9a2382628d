//! Step decorator that swaps an environment's native reward for a candidate's.

use std::sync::Arc;

use crate::env::{Action, ActionSpace, Environment, Observation, Step, SuccessFlags, TaskAdapter};
use crate::error::TrainingError;
use crate::sandbox::RewardFunction;

/// Wraps one environment for training, evaluation or a smoke test.
///
/// With a success predicate configured, termination and truncation are
/// copied into the step info and the predicate is evaluated once, on the
/// step where the episode first ends. With both a predicate and a reward
/// function configured, the reward function's output replaces the native
/// reward. Otherwise steps pass through unchanged.
pub struct RewardEnvAdapter<T: TaskAdapter> {
    env: T::Env,
    predicate: Option<Arc<T>>,
    reward: Option<Arc<RewardFunction>>,
    outcome: Option<SuccessFlags>,
}

impl<T: TaskAdapter> RewardEnvAdapter<T> {
    /// Plain pass-through wrapper.
    pub fn new(env: T::Env) -> Self {
        Self {
            env,
            predicate: None,
            reward: None,
            outcome: None,
        }
    }

    /// Builds a fresh environment from `task` with the task's predicate.
    pub fn for_task(task: Arc<T>, reward: Option<Arc<RewardFunction>>) -> Self {
        Self {
            env: task.make_env(),
            predicate: Some(task),
            reward,
            outcome: None,
        }
    }

    pub fn with_predicate(mut self, task: Arc<T>) -> Self {
        self.predicate = Some(task);
        self
    }

    pub fn with_reward(mut self, reward: Option<Arc<RewardFunction>>) -> Self {
        self.reward = reward;
        self
    }

    pub fn reset(&mut self, seed: Option<u64>) -> Observation {
        self.outcome = None;
        self.env.reset(seed)
    }

    pub fn step(&mut self, action: &Action) -> Result<Step, TrainingError> {
        let mut step = self.env.step(action)?;

        let Some(task) = &self.predicate else {
            return Ok(step);
        };

        step.info.terminated = step.terminated;
        step.info.truncated = step.truncated;

        let mut flags = SuccessFlags::NONE;
        if step.is_done() && self.outcome.is_none() {
            flags = task.success(&self.env, &step.info);
            self.outcome = Some(flags);
        }

        if let Some(reward) = &self.reward {
            step.reward = reward.call(&step.observation, flags.is_success, flags.is_failure)?;
        }

        Ok(step)
    }

    /// Verdict of the success predicate for the current episode, once it ended.
    pub fn outcome(&self) -> Option<SuccessFlags> {
        self.outcome
    }

    pub fn action_space(&self) -> ActionSpace {
        self.env.action_space()
    }

    pub fn observation_dim(&self) -> usize {
        self.env.observation_dim()
    }

    pub fn env(&self) -> &T::Env {
        &self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::test_support::StubTask;
    use crate::env::CartPole;
    use crate::sandbox::NumericSurface;

    fn compile(source: &str) -> Arc<RewardFunction> {
        Arc::new(
            RewardFunction::compile(source, "reward_func", Arc::new(NumericSurface::standard()))
                .unwrap(),
        )
    }

    const FLAG_REWARD: &str = "def reward_func(obs, is_success, is_failure):
    if is_success:
        return 100.0
    if is_failure:
        return -100.0
    return 1.0
";

    #[test]
    fn test_identity_without_candidate() {
        let task = Arc::new(CartPole::new());
        let mut plain = RewardEnvAdapter::<CartPole>::new(task.make_env());
        let mut wrapped = RewardEnvAdapter::for_task(Arc::clone(&task), None);
        let mut raw = task.make_env();

        let a = plain.reset(Some(11));
        let b = wrapped.reset(Some(11));
        let c = raw.reset(Some(11));
        assert_eq!(a, b);
        assert_eq!(a, c);

        for i in 0..5 {
            let action = Action::Discrete(i % 2);
            let s1 = plain.step(&action).unwrap();
            let s2 = wrapped.step(&action).unwrap();
            let s3 = raw.step(&action).unwrap();
            assert_eq!(s1.observation, s3.observation);
            assert_eq!(s1.reward, s3.reward);
            assert_eq!(s2.reward, s3.reward);
            assert_eq!(s2.terminated, s3.terminated);
        }
    }

    #[test]
    fn test_reward_without_predicate_passes_through() {
        let task = CartPole::new();
        let mut adapter =
            RewardEnvAdapter::<CartPole>::new(task.make_env()).with_reward(Some(compile(FLAG_REWARD)));
        adapter.reset(Some(0));
        let step = adapter.step(&Action::Discrete(0)).unwrap();
        assert_eq!(step.reward, 1.0);
        assert!(adapter.outcome().is_none());
    }

    #[test]
    fn test_flags_false_until_terminal_step() {
        let task = Arc::new(StubTask::new(3));
        let mut adapter = RewardEnvAdapter::for_task(Arc::clone(&task), Some(compile(FLAG_REWARD)));
        adapter.reset(Some(0));

        assert_eq!(adapter.step(&Action::Discrete(1)).unwrap().reward, 1.0);
        assert_eq!(adapter.step(&Action::Discrete(1)).unwrap().reward, 1.0);
        assert_eq!(task.calls(), 0);
        assert!(adapter.outcome().is_none());

        let last = adapter.step(&Action::Discrete(1)).unwrap();
        assert!(last.info.terminated);
        assert_eq!(last.reward, 100.0);
        assert_eq!(task.calls(), 1);
        assert_eq!(adapter.outcome(), Some(SuccessFlags::success()));
    }

    #[test]
    fn test_predicate_once_per_episode() {
        let task = Arc::new(StubTask::new(1));
        let mut adapter = RewardEnvAdapter::for_task(Arc::clone(&task), Some(compile(FLAG_REWARD)));
        for episode in 0..4u64 {
            adapter.reset(Some(episode));
            let step = adapter.step(&Action::Discrete(0)).unwrap();
            assert_eq!(step.reward, -100.0);
            assert!(adapter.step(&Action::Discrete(0)).is_err());
        }
        assert_eq!(task.calls(), 4);
    }

    #[test]
    fn test_reward_error_surfaces() {
        let task = Arc::new(StubTask::new(1));
        let broken = compile("def reward_func(obs, s, f):\n    return obs[5]\n");
        let mut adapter = RewardEnvAdapter::for_task(task, Some(broken));
        adapter.reset(Some(0));
        assert!(matches!(
            adapter.step(&Action::Discrete(0)),
            Err(TrainingError::Reward(_))
        ));
    }
}
