//! Policy training and evaluation of reward candidates.
//!
//! - [`adapter`]: step decorator that applies a candidate reward
//! - [`backend`]: the policy-training contract
//! - [`direct_search`]: hill-climbing reference backend
//! - [`evaluation`]: deterministic held-out evaluation
//! - [`job`]: one candidate's train-then-evaluate job
//! - [`orchestrator`]: concurrent jobs and result collection

pub mod adapter;
pub mod backend;
pub mod direct_search;
pub mod evaluation;
pub mod job;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod test_support;

pub use adapter::RewardEnvAdapter;
pub use backend::{EpisodeTracker, Policy, TrainingBackend, TrainingContext, TrainingStats};
pub use direct_search::{DirectSearch, LinearPolicy};
pub use evaluation::{evaluate, record_episode, EvaluationSummary, Rollout};
pub use job::{JobReport, JobSettings, TrainingJob, TrainingOutcome};
pub use orchestrator::{
    ExecutionMode, OrchestratorConfig, Partition, ThresholdMode, TrainingOrchestrator,
};
