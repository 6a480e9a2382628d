//! A single candidate's train-then-evaluate job.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::adapter::RewardEnvAdapter;
use super::backend::{Policy, TrainingBackend, TrainingContext};
use super::evaluation::evaluate;
use crate::candidate::Performances;
use crate::env::TaskAdapter;
use crate::error::TrainingError;
use crate::sandbox::RewardFunction;

/// Per-job settings copied from the orchestrator configuration.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub total_timesteps: u64,
    pub seed: u64,
    pub eval_episodes: usize,
    pub eval_seed: u64,
    pub artifact_dir: Option<PathBuf>,
}

/// What a job produced.
#[derive(Debug, Clone)]
pub enum TrainingOutcome {
    Completed {
        policy: Option<PathBuf>,
        performances: Performances,
        /// Return of every training episode.
        reward_trace: Vec<f64>,
    },
    Failed {
        error: String,
    },
}

impl TrainingOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TrainingOutcome::Completed { .. })
    }
}

/// Message a worker sends back on the result channel.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub idx: usize,
    pub outcome: TrainingOutcome,
    pub duration: Duration,
}

/// Everything a worker thread needs, owned.
pub struct TrainingJob<T: TaskAdapter, B: TrainingBackend<T>> {
    pub idx: usize,
    pub task: Arc<T>,
    pub backend: Arc<B>,
    pub reward: Option<Arc<RewardFunction>>,
    pub settings: JobSettings,
    pub stop: Arc<AtomicBool>,
}

impl<T: TaskAdapter, B: TrainingBackend<T>> TrainingJob<T, B> {
    /// `<artifact_dir>/<env>/seed<seed>/policy<idx>.json`
    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.settings.artifact_dir.as_ref().map(|dir| {
            dir.join(self.task.name())
                .join(format!("seed{}", self.settings.seed))
                .join(format!("policy{}.json", self.idx))
        })
    }

    /// Runs the job to completion. Errors and panics become a failed outcome.
    pub fn run(self) -> JobReport {
        let started = Instant::now();
        let idx = self.idx;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => TrainingOutcome::Failed {
                error: e.to_string(),
            },
            Err(payload) => TrainingOutcome::Failed {
                error: TrainingError::Panicked(panic_message(payload.as_ref())).to_string(),
            },
        };
        JobReport {
            idx,
            outcome,
            duration: started.elapsed(),
        }
    }

    fn execute(&self) -> Result<TrainingOutcome, TrainingError> {
        let hyperparameters = self.task.hyperparameters();
        let ctx = TrainingContext {
            hyperparameters: &hyperparameters,
            total_timesteps: self.settings.total_timesteps,
            seed: self.settings.seed,
            stop: &self.stop,
        };

        debug!(
            idx = self.idx,
            env = self.task.name(),
            backend = self.backend.name(),
            timesteps = self.settings.total_timesteps,
            "Training started"
        );

        let mut env = RewardEnvAdapter::for_task(Arc::clone(&self.task), self.reward.clone());
        let (policy, stats) = self.backend.train(&mut env, &ctx)?;

        let policy_path = self.artifact_path();
        if let Some(path) = &policy_path {
            policy.save(path)?;
        }

        let summary = evaluate(
            &self.task,
            self.reward.clone(),
            &policy,
            self.settings.eval_episodes,
            self.settings.eval_seed,
            Some(&self.stop),
        )?;

        let mut metrics = stats.to_metrics();
        metrics.extend(summary.metrics);
        metrics.insert("eval_mean_return".to_string(), summary.mean_return);

        info!(
            idx = self.idx,
            env = self.task.name(),
            success_rate = summary.success_rate,
            episodes = stats.total_episodes,
            "Training finished"
        );

        Ok(TrainingOutcome::Completed {
            policy: policy_path,
            performances: Performances::new(summary.success_rate, metrics),
            reward_trace: stats.episode_returns,
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::CartPole;
    use crate::training::{DirectSearch, LinearPolicy, TrainingStats};
    use std::path::Path;

    fn settings(dir: Option<PathBuf>) -> JobSettings {
        JobSettings {
            total_timesteps: 1_000,
            seed: 3,
            eval_episodes: 2,
            eval_seed: 10,
            artifact_dir: dir,
        }
    }

    #[test]
    fn test_job_completes_and_saves_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let job = TrainingJob {
            idx: 4,
            task: Arc::new(CartPole::new()),
            backend: Arc::new(DirectSearch::new()),
            reward: None,
            settings: settings(Some(dir.path().to_path_buf())),
            stop: Arc::new(AtomicBool::new(false)),
        };
        let expected = dir.path().join("CartPole-v1/seed3/policy4.json");
        assert_eq!(job.artifact_path(), Some(expected.clone()));

        let report = job.run();
        assert_eq!(report.idx, 4);
        match report.outcome {
            TrainingOutcome::Completed {
                policy,
                performances,
                reward_trace,
            } => {
                assert_eq!(policy, Some(expected.clone()));
                assert!((0.0..=1.0).contains(&performances.success_rate));
                assert!(performances.metrics.contains_key("pole_angle_diff"));
                assert!(performances.metrics.contains_key("mean_reward"));
                assert!(!reward_trace.is_empty());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(expected.exists());
    }

    struct PanickingBackend;

    impl TrainingBackend<CartPole> for PanickingBackend {
        type Policy = LinearPolicy;

        fn name(&self) -> &str {
            "panicking"
        }

        fn train(
            &self,
            _env: &mut RewardEnvAdapter<CartPole>,
            _ctx: &TrainingContext<'_>,
        ) -> Result<(LinearPolicy, TrainingStats), TrainingError> {
            panic!("backend exploded")
        }

        fn load(&self, _path: &Path) -> Result<LinearPolicy, TrainingError> {
            Err(TrainingError::Cancelled)
        }
    }

    #[test]
    fn test_panic_becomes_failure() {
        let job = TrainingJob {
            idx: 1,
            task: Arc::new(CartPole::new()),
            backend: Arc::new(PanickingBackend),
            reward: None,
            settings: settings(None),
            stop: Arc::new(AtomicBool::new(false)),
        };
        let report = job.run();
        match report.outcome {
            TrainingOutcome::Failed { error } => assert!(error.contains("backend exploded")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
