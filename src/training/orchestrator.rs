//! Concurrent training of candidates and collection of their results.
//!
//! The orchestrator owns the candidate store. Each started candidate gets
//! one blocking worker that trains and evaluates a policy and sends a
//! [`JobReport`] back over an unbounded channel. [`TrainingOrchestrator::evaluate_policy`]
//! is the only place that waits: it drains the channel until every requested
//! candidate has a performance record, then splits the candidates around the
//! success-rate threshold.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::TrainingBackend;
use super::evaluation::{record_episode, Rollout};
use super::job::{JobReport, JobSettings, TrainingJob, TrainingOutcome};
use super::RewardEnvAdapter;
use crate::candidate::{Candidate, CandidateStore, Performances};
use crate::env::TaskAdapter;
use crate::error::{JobStateError, OrchestratorError};
use crate::metrics::MetricsCollector;
use crate::runlog::{CandidateRecord, RunContext, RunLogger};

/// How the success-rate threshold is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdMode {
    /// The success rate of the no-reward baseline, candidate 0.
    Baseline,
    Fixed(f64),
}

/// Where training jobs run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One blocking worker per job when a tokio runtime is available.
    #[default]
    Concurrent,
    /// Every job runs to completion inside `start_learning`.
    Inline,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub total_timesteps: u64,
    pub seed: u64,
    pub eval_episodes: usize,
    pub eval_seed: u64,
    pub artifact_dir: Option<PathBuf>,
    pub threshold: ThresholdMode,
    pub execution: ExecutionMode,
    pub poll_interval: Duration,
    pub job_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            total_timesteps: 20_000,
            seed: 0,
            eval_episodes: 10,
            eval_seed: 1_000,
            artifact_dir: None,
            threshold: ThresholdMode::Baseline,
            execution: ExecutionMode::Concurrent,
            poll_interval: Duration::from_millis(500),
            job_timeout: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_threshold(mut self, threshold: ThresholdMode) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    fn job_settings(&self) -> JobSettings {
        JobSettings {
            total_timesteps: self.total_timesteps,
            seed: self.seed,
            eval_episodes: self.eval_episodes,
            eval_seed: self.eval_seed,
            artifact_dir: self.artifact_dir.clone(),
        }
    }
}

/// Candidates split around the threshold, in request order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Partition {
    pub worse: Vec<usize>,
    pub better: Vec<usize>,
    pub threshold: f64,
}

impl Partition {
    fn classify(store: &CandidateStore, indices: &[usize], threshold: f64) -> Self {
        let (worse, better) = indices.iter().partition(|idx| {
            store
                .get(**idx)
                .and_then(Candidate::success_rate)
                .unwrap_or(0.0)
                < threshold
        });
        Self {
            worse,
            better,
            threshold,
        }
    }
}

struct Worker {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

pub struct TrainingOrchestrator<T: TaskAdapter, B: TrainingBackend<T>> {
    task: Arc<T>,
    backend: Arc<B>,
    config: OrchestratorConfig,
    store: CandidateStore,
    workers: HashMap<usize, Worker>,
    tx: mpsc::UnboundedSender<JobReport>,
    rx: mpsc::UnboundedReceiver<JobReport>,
    run_logger: Option<Arc<dyn RunLogger>>,
    context: RunContext,
    metrics: MetricsCollector,
}

impl<T: TaskAdapter, B: TrainingBackend<T>> TrainingOrchestrator<T, B> {
    /// Creates an orchestrator whose store already holds the baseline.
    pub fn new(task: Arc<T>, backend: Arc<B>, config: OrchestratorConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut store = CandidateStore::new();
        // An empty store always accepts the baseline.
        let _ = store.push(Candidate::baseline());
        let context = RunContext::new(task.name(), "unknown");
        Self {
            task,
            backend,
            config,
            store,
            workers: HashMap::new(),
            tx,
            rx,
            run_logger: None,
            context,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_run_logger(mut self, logger: Arc<dyn RunLogger>) -> Self {
        self.run_logger = Some(logger);
        self
    }

    pub fn with_run_context(mut self, context: RunContext) -> Self {
        self.context = context;
        self
    }

    pub fn task(&self) -> &Arc<T> {
        &self.task
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn run_context(&self) -> &RunContext {
        &self.context
    }

    pub fn next_idx(&self) -> usize {
        self.store.next_idx()
    }

    pub fn candidate(&self, idx: usize) -> Option<&Candidate> {
        self.store.get(idx)
    }

    pub fn candidates(&self) -> &[Candidate] {
        self.store.as_slice()
    }

    pub fn is_started(&self, idx: usize) -> bool {
        self.workers.contains_key(&idx)
    }

    /// Appends a candidate created by the caller. Its idx must be `next_idx()`.
    pub fn register(&mut self, candidate: Candidate) -> Result<usize, JobStateError> {
        let idx = self.store.push(candidate)?;
        debug!(idx = idx, "Candidate registered");
        Ok(idx)
    }

    /// Starts training candidate `idx`.
    pub fn start_learning(&mut self, idx: usize) -> Result<(), JobStateError> {
        let candidate = self
            .store
            .get(idx)
            .ok_or(JobStateError::UnknownCandidate(idx))?;
        if self.workers.contains_key(&idx) {
            return Err(JobStateError::AlreadyStarted(idx));
        }
        candidate.ensure_trainable()?;

        let stop = Arc::new(AtomicBool::new(false));
        let job = TrainingJob {
            idx,
            task: Arc::clone(&self.task),
            backend: Arc::clone(&self.backend),
            reward: candidate.reward_func().cloned(),
            settings: self.config.job_settings(),
            stop: Arc::clone(&stop),
        };
        let tx = self.tx.clone();

        let handle = match (self.config.execution, Handle::try_current()) {
            (ExecutionMode::Concurrent, Ok(runtime)) => {
                info!(idx = idx, env = self.task.name(), "Training job spawned");
                Some(runtime.spawn_blocking(move || {
                    let _ = tx.send(job.run());
                }))
            }
            _ => {
                info!(idx = idx, env = self.task.name(), "Training job running inline");
                let _ = tx.send(job.run());
                None
            }
        };

        self.workers.insert(idx, Worker { handle, stop });
        self.metrics.update_jobs_in_progress(self.in_flight());
        Ok(())
    }

    /// Starts the baseline when the threshold comes from it. Idempotent.
    pub fn start_baseline(&mut self) -> Result<(), JobStateError> {
        if self.config.threshold == ThresholdMode::Baseline && !self.is_started(0) {
            self.start_learning(0)?;
        }
        Ok(())
    }

    /// Waits for `indices` to finish training and classifies them.
    pub async fn evaluate_policy(
        &mut self,
        indices: &[usize],
    ) -> Result<Partition, OrchestratorError> {
        for &idx in indices {
            if self.store.get(idx).is_none() {
                return Err(JobStateError::UnknownCandidate(idx).into());
            }
            if !self.is_started(idx) {
                return Err(JobStateError::NotStarted(idx).into());
            }
        }

        let mut wanted = indices.to_vec();
        if self.config.threshold == ThresholdMode::Baseline {
            self.start_baseline()?;
            if !wanted.contains(&0) {
                wanted.push(0);
            }
        }

        let deadline = self.config.job_timeout.map(|t| Instant::now() + t);
        loop {
            let pending = self.pending(&wanted);
            if pending.is_empty() {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                for idx in &pending {
                    if let Some(worker) = self.workers.get(idx) {
                        worker.stop.store(true, Ordering::Relaxed);
                    }
                }
                warn!(pending = ?pending, "Training jobs timed out");
                return Err(OrchestratorError::JobTimeout { pending });
            }

            let wait = match deadline {
                Some(d) => self
                    .config
                    .poll_interval
                    .min(d.saturating_duration_since(Instant::now())),
                None => self.config.poll_interval,
            };
            match tokio::time::timeout(wait, self.rx.recv()).await {
                Ok(Some(report)) => self.collect(report).await?,
                Ok(None) => return Err(OrchestratorError::ChannelClosed { pending }),
                Err(_) => debug!(pending = ?pending, "Waiting for training results"),
            }
        }

        for idx in &wanted {
            let handle = self.workers.get_mut(idx).and_then(|w| w.handle.take());
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    warn!(idx = idx, error = %e, "Training worker did not join cleanly");
                }
            }
        }
        self.metrics.update_jobs_in_progress(self.in_flight());

        let threshold = match self.config.threshold {
            ThresholdMode::Fixed(value) => value,
            ThresholdMode::Baseline => self
                .store
                .get(0)
                .and_then(Candidate::success_rate)
                .ok_or(OrchestratorError::MissingBaseline)?,
        };

        let partition = Partition::classify(&self.store, indices, threshold);
        info!(
            threshold = threshold,
            worse = ?partition.worse,
            better = ?partition.better,
            "Candidates evaluated"
        );
        Ok(partition)
    }

    /// Replays candidate `idx`'s saved policy for one deterministic episode.
    pub fn record_rollout(&self, idx: usize) -> Result<Rollout, OrchestratorError> {
        let candidate = self
            .store
            .get(idx)
            .ok_or(JobStateError::UnknownCandidate(idx))?;
        if !self.is_started(idx) {
            return Err(JobStateError::NotStarted(idx).into());
        }
        let path = candidate.policy().ok_or(OrchestratorError::NoPolicy(idx))?;
        let policy = self.backend.load(path)?;
        let mut env =
            RewardEnvAdapter::for_task(Arc::clone(&self.task), candidate.reward_func().cloned());
        Ok(record_episode(
            &mut env,
            &policy,
            self.config.eval_seed,
            None,
        )?)
    }

    /// Raises the stop flag of every job that has not reported yet.
    pub fn cancel_all(&self) {
        for (idx, worker) in &self.workers {
            if self.store.get(*idx).is_some_and(|c| c.performances().is_none()) {
                worker.stop.store(true, Ordering::Relaxed);
            }
        }
    }

    /// The full candidate history, baseline included.
    pub fn into_candidates(self) -> Vec<Candidate> {
        self.cancel_all();
        self.store.to_vec()
    }

    fn pending(&self, wanted: &[usize]) -> Vec<usize> {
        wanted
            .iter()
            .copied()
            .filter(|idx| {
                self.store
                    .get(*idx)
                    .is_some_and(|c| c.performances().is_none())
            })
            .collect()
    }

    fn in_flight(&self) -> usize {
        self.workers
            .keys()
            .filter(|idx| {
                self.store
                    .get(**idx)
                    .is_some_and(|c| c.performances().is_none())
            })
            .count()
    }

    async fn collect(&mut self, report: JobReport) -> Result<(), OrchestratorError> {
        let JobReport {
            idx,
            outcome,
            duration,
        } = report;
        let status = if outcome.is_success() {
            "success"
        } else {
            "failure"
        };
        self.metrics
            .record_training_job(self.task.name(), status, duration.as_secs_f64());

        let (policy, performances, reward_trace) = match outcome {
            TrainingOutcome::Completed {
                policy,
                performances,
                reward_trace,
            } => (policy, performances, reward_trace),
            TrainingOutcome::Failed { error } => {
                warn!(idx = idx, error = %error, "Training job failed");
                (None, Performances::failed(error), Vec::new())
            }
        };
        self.metrics.record_success_rate(performances.success_rate);
        info!(
            idx = idx,
            success_rate = performances.success_rate,
            duration_secs = duration.as_secs_f64(),
            "Training results collected"
        );

        self.store
            .get_mut(idx)
            .ok_or(JobStateError::UnknownCandidate(idx))?
            .record_results(policy, performances)?;

        if idx != 0 {
            if let (Some(logger), Some(candidate)) = (&self.run_logger, self.store.get(idx)) {
                let record = CandidateRecord::from_candidate(&self.context, candidate, reward_trace);
                if let Err(e) = logger.append(&record).await {
                    warn!(idx = idx, error = %e, "Failed to append candidate to run log");
                }
            }
        }
        Ok(())
    }
}

impl<T: TaskAdapter, B: TrainingBackend<T>> Drop for TrainingOrchestrator<T, B> {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
