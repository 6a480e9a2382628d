//! Deterministic held-out evaluation of trained policies.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::adapter::RewardEnvAdapter;
use super::backend::Policy;
use crate::env::{Action, Observation, SuccessFlags, TaskAdapter};
use crate::error::TrainingError;
use crate::sandbox::RewardFunction;

const MAX_EPISODE_STEPS: usize = 10_000;

/// One recorded episode.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Rollout {
    pub seed: u64,
    pub observations: Vec<Observation>,
    pub actions: Vec<Action>,
    pub rewards: Vec<f64>,
    pub outcome: SuccessFlags,
}

impl Rollout {
    pub fn total_reward(&self) -> f64 {
        self.rewards.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Compact text description of the episode, sampled every `stride` steps.
    pub fn summarize(&self, stride: usize) -> String {
        let stride = stride.max(1);
        let mut out = format!(
            "Episode of {} steps, total reward {:.3}, outcome: {}\n",
            self.len(),
            self.total_reward(),
            if self.outcome.is_success {
                "success"
            } else if self.outcome.is_failure {
                "failure"
            } else {
                "unfinished"
            }
        );
        for (t, observation) in self.observations.iter().enumerate().step_by(stride) {
            let values: Vec<String> = observation.iter().map(|v| format!("{:.3}", v)).collect();
            out.push_str(&format!("t={} obs=[{}]", t, values.join(", ")));
            if let Some(action) = self.actions.get(t) {
                out.push_str(&format!(" action={:?}", action));
            }
            out.push('\n');
        }
        out
    }
}

/// Aggregated result over the evaluation episodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub episodes: usize,
    pub success_rate: f64,
    pub mean_return: f64,
    /// Task objective metrics averaged over episodes.
    pub metrics: BTreeMap<String, f64>,
}

/// Runs one episode with a fixed seed.
pub fn record_episode<T: TaskAdapter, P: Policy + ?Sized>(
    env: &mut RewardEnvAdapter<T>,
    policy: &P,
    seed: u64,
    stop: Option<&AtomicBool>,
) -> Result<Rollout, TrainingError> {
    let mut observation = env.reset(Some(seed));
    let mut rollout = Rollout {
        seed,
        observations: vec![observation.clone()],
        ..Default::default()
    };
    for _ in 0..MAX_EPISODE_STEPS {
        if stop.is_some_and(|s| s.load(Ordering::Relaxed)) {
            return Err(TrainingError::Cancelled);
        }
        let action = policy.predict(&observation);
        let step = env.step(&action)?;
        rollout.actions.push(action);
        rollout.rewards.push(step.reward);
        rollout.observations.push(step.observation.clone());
        let done = step.is_done();
        observation = step.observation;
        if done {
            break;
        }
    }
    rollout.outcome = env.outcome().unwrap_or_default();
    Ok(rollout)
}

/// Evaluates `policy` on episodes seeded `eval_seed + k` for `k < episodes`.
pub fn evaluate<T: TaskAdapter, P: Policy + ?Sized>(
    task: &Arc<T>,
    reward: Option<Arc<RewardFunction>>,
    policy: &P,
    episodes: usize,
    eval_seed: u64,
    stop: Option<&AtomicBool>,
) -> Result<EvaluationSummary, TrainingError> {
    let mut env = RewardEnvAdapter::for_task(Arc::clone(task), reward);
    let mut successes = 0usize;
    let mut total_return = 0.0;
    let mut metric_sums: BTreeMap<String, f64> = BTreeMap::new();

    for k in 0..episodes {
        let rollout = record_episode(&mut env, policy, eval_seed + k as u64, stop)?;
        if rollout.outcome.is_success {
            successes += 1;
        }
        total_return += rollout.total_reward();
        for (name, value) in task.objective_metrics(&rollout.observations) {
            *metric_sums.entry(name).or_insert(0.0) += value;
        }
    }

    if episodes == 0 {
        return Ok(EvaluationSummary::default());
    }
    let n = episodes as f64;
    Ok(EvaluationSummary {
        episodes,
        success_rate: successes as f64 / n,
        mean_return: total_return / n,
        metrics: metric_sums.into_iter().map(|(k, v)| (k, v / n)).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::test_support::StubTask;
    use std::path::Path;

    /// Presses 1 for seed slots below the threshold.
    struct ThresholdPolicy(f64);

    impl Policy for ThresholdPolicy {
        fn predict(&self, observation: &[f64]) -> Action {
            Action::Discrete(usize::from(observation[0] < self.0))
        }

        fn save(&self, _path: &Path) -> Result<(), TrainingError> {
            Ok(())
        }
    }

    #[test]
    fn test_success_rate_over_seeds() {
        let task = Arc::new(StubTask::new(1));
        let summary = evaluate(&task, None, &ThresholdPolicy(5.0), 20, 0, None).unwrap();
        assert_eq!(summary.episodes, 20);
        assert_eq!(summary.success_rate, 0.25);
        assert_eq!(summary.metrics["steps"], 2.0);
        assert_eq!(task.calls(), 20);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let task = Arc::new(crate::env::CartPole::new());
        let policy = crate::training::LinearPolicy::new(ndarray::array![
            [0.0, 0.0],
            [0.0, 1.0],
            [-1.0, 1.0],
            [0.0, 1.0]
        ]);
        let a = evaluate(&task, None, &policy, 3, 100, None).unwrap();
        let b = evaluate(&task, None, &policy, 3, 100, None).unwrap();
        assert_eq!(a, b);
        assert!(a.metrics.contains_key("pole_angle_diff"));
    }

    #[test]
    fn test_zero_episodes() {
        let task = Arc::new(StubTask::new(1));
        let summary = evaluate(&task, None, &ThresholdPolicy(1.0), 0, 0, None).unwrap();
        assert_eq!(summary, EvaluationSummary::default());
    }

    #[test]
    fn test_rollout_summary() {
        let task = Arc::new(StubTask::new(2));
        let mut env = RewardEnvAdapter::for_task(task, None);
        let rollout = record_episode(&mut env, &ThresholdPolicy(100.0), 3, None).unwrap();
        assert_eq!(rollout.len(), 2);
        assert!(rollout.outcome.is_success);
        let text = rollout.summarize(1);
        assert!(text.contains("outcome: success"));
        assert!(text.contains("t=0 obs=[3.000, 0.000] action=Discrete(1)"));
    }
}
